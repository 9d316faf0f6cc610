use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::{oneshot, Notify};

use dropshare::config::{self, Config};
use dropshare::receive::{run_receive, ReceiveOptions};
use dropshare::server::{run_server_with_shutdown, ServeOptions};
use dropshare::transfer::broadcaster::{run_broadcast, BroadcastOptions};
use dropshare::transfer::source::FileSource;

#[derive(Parser, Debug)]
#[command(name = "dropshare", version)]
struct Cli {
    /// Path to config file
    #[arg(short = 'c', long = "config", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the session registry and relay server
    Serve {
        /// Listen address, overrides `listen_addr`
        #[arg(long = "addr")]
        addr: Option<String>,
    },
    /// Broadcast files and folders to everyone who joins
    Send {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        #[arg(long = "server")]
        server: Option<String>,
        /// Never try a direct link
        #[arg(long = "relay-only")]
        relay_only: bool,
    },
    /// Join a broadcast by session id or share link
    Receive {
        session: String,
        #[arg(long = "server")]
        server: Option<String>,
        /// Output folder, overrides `out_dir`
        #[arg(long = "out")]
        out: Option<PathBuf>,
        #[arg(long = "relay-only")]
        relay_only: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut cfg = Config::load_or_default(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { addr } => {
            let shutdown = shutdown_on_ctrl_c();
            let opts = ServeOptions {
                listen_addr: addr,
                log_path: None,
            };
            run_server_with_shutdown(cfg, opts, shutdown).await?;
        }
        Commands::Send {
            paths,
            server,
            relay_only,
        } => {
            if let Some(server) = server {
                cfg.server_url = server;
            }
            if relay_only {
                cfg.direct.enabled = false;
            }
            cfg.finish_overrides()?;
            init_log(&cfg, "send")?;

            let files = dropshare::manifest::collect_local_files(&paths)?;
            let source = FileSource::from_local(files);
            let opts = BroadcastOptions {
                server_url: cfg.server_url.clone(),
                direct: cfg.direct.clone(),
                tuning: cfg.tuning(),
                reconnect_window: cfg.owner_grace(),
            };
            let (started_tx, started_rx) = oneshot::channel::<dropshare::transfer::broadcaster::BroadcastInfo>();
            tokio::spawn(async move {
                if let Ok(info) = started_rx.await {
                    println!("Sharing as {}", info.session_id);
                    println!("Link: {}", info.share_link);
                    println!("Press Ctrl+C to stop.");
                }
            });
            run_broadcast(opts, source, shutdown_on_ctrl_c(), Some(started_tx)).await?;
        }
        Commands::Receive {
            session,
            server,
            out,
            relay_only,
        } => {
            if let Some(server) = server {
                cfg.server_url = server;
            }
            if let Some(out) = out {
                cfg.out_dir = out;
            }
            if relay_only {
                cfg.direct.enabled = false;
            }
            cfg.finish_overrides()?;
            init_log(&cfg, "receive")?;

            let session_id = config::parse_session_ref(&session)?;
            std::fs::create_dir_all(&cfg.out_dir)
                .with_context(|| format!("create {}", cfg.out_dir.display()))?;
            let opts = ReceiveOptions {
                server_url: cfg.server_url.clone(),
                session_id,
                out_dir: cfg.out_dir.clone(),
                direct: cfg.direct.clone(),
                probe_bytes: cfg.tuning().probe_bytes,
            };
            let summary = run_receive(opts).await?;
            println!(
                "Received {} ({} bytes) into {}",
                summary.delivered,
                summary.bytes,
                cfg.out_dir.display()
            );
        }
    }

    Ok(())
}

/// Each role logs to its own file next to the server log unless `log_path` is set.
fn init_log(cfg: &Config, role: &str) -> Result<()> {
    let path = match &cfg.log_path {
        Some(p) => p.clone(),
        None => cfg
            .log_file_path()
            .with_file_name(format!("dropshare-{role}.log")),
    };
    dropshare::logging::init_log_file(&path)
}

fn shutdown_on_ctrl_c() -> Arc<Notify> {
    let shutdown = Arc::new(Notify::new());
    let notify = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            dropshare::logging::info("interrupt received, shutting down");
            notify.notify_one();
        }
    });
    shutdown
}

pub mod client;
pub mod config;
pub mod direct;
pub mod logging;
pub mod manifest;
pub mod receive;
pub mod server;
pub mod telemetry;
pub mod transfer;
pub mod wsproto;

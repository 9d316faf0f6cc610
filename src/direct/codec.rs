use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::transfer::message::{Frame, TransferMessage};

const FRAME_MAGIC: &[u8] = b"DSHR";
const FRAME_VERSION: u8 = 1;
const KIND_CONTROL: u8 = 0;
const KIND_CHUNK: u8 = 1;

/// Largest payload accepted from the direct stream.
pub const MAX_FRAME_PAYLOAD: usize = 16 * 1024 * 1024;

pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>> {
    let (kind, payload) = match frame {
        Frame::Control(msg) => (KIND_CONTROL, serde_json::to_vec(msg)?),
        Frame::Chunk(bytes) => (KIND_CHUNK, bytes.clone()),
    };
    if payload.len() > MAX_FRAME_PAYLOAD {
        anyhow::bail!("frame payload too large: {}", payload.len());
    }
    let mut out = Vec::with_capacity(FRAME_MAGIC.len() + 1 + 1 + 4 + payload.len());
    out.extend_from_slice(FRAME_MAGIC);
    out.push(FRAME_VERSION);
    out.push(kind);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let raw = encode_frame(frame)?;
    writer.write_all(&raw).await?;
    Ok(())
}

/// Reads the next frame. Returns `None` when the stream ends cleanly between
/// frames. Bytes before a frame magic are skipped.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut window = Vec::with_capacity(FRAME_MAGIC.len());
    loop {
        let b = match reader.read_u8().await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof && window.is_empty() => {
                return Ok(None)
            }
            Err(e) => return Err(e.into()),
        };
        window.push(b);
        if window.len() > FRAME_MAGIC.len() {
            window.remove(0);
        }
        if window == FRAME_MAGIC {
            break;
        }
    }

    let version = reader.read_u8().await?;
    if version != FRAME_VERSION {
        anyhow::bail!("unsupported direct frame version: {version}");
    }
    let kind = reader.read_u8().await?;
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME_PAYLOAD {
        anyhow::bail!("direct frame payload too large: {len}");
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    match kind {
        KIND_CONTROL => {
            let msg: TransferMessage =
                serde_json::from_slice(&payload).context("direct control message")?;
            Ok(Some(Frame::Control(msg)))
        }
        KIND_CHUNK => Ok(Some(Frame::Chunk(payload))),
        other => anyhow::bail!("unknown direct frame kind: {other}"),
    }
}

//! Minimal RFC 5389 Binding client, enough to learn one server-reflexive
//! address for the direct link's UDP socket.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use anyhow::{Context, Result};
use tokio::net::UdpSocket;

const BINDING_REQUEST: u16 = 0x0001;
const BINDING_SUCCESS: u16 = 0x0101;
const MAGIC_COOKIE: u32 = 0x2112_A442;
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const HEADER_LEN: usize = 20;

pub type TransactionId = [u8; 12];

pub fn new_transaction_id() -> TransactionId {
    let bytes = uuid::Uuid::new_v4().into_bytes();
    let mut id = [0u8; 12];
    id.copy_from_slice(&bytes[..12]);
    id
}

pub fn encode_binding_request(txn: &TransactionId) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN);
    out.extend_from_slice(&BINDING_REQUEST.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    out.extend_from_slice(txn);
    out
}

/// Extracts the mapped address from a Binding success response for `txn`.
pub fn parse_binding_response(msg: &[u8], txn: &TransactionId) -> Result<SocketAddr> {
    if msg.len() < HEADER_LEN {
        anyhow::bail!("stun response too short");
    }
    let msg_type = u16::from_be_bytes([msg[0], msg[1]]);
    if msg_type != BINDING_SUCCESS {
        anyhow::bail!("unexpected stun message type: {msg_type:#06x}");
    }
    let body_len = u16::from_be_bytes([msg[2], msg[3]]) as usize;
    if u32::from_be_bytes([msg[4], msg[5], msg[6], msg[7]]) != MAGIC_COOKIE {
        anyhow::bail!("stun magic cookie mismatch");
    }
    if &msg[8..20] != txn {
        anyhow::bail!("stun transaction id mismatch");
    }
    let body = msg
        .get(HEADER_LEN..HEADER_LEN + body_len)
        .context("stun body truncated")?;

    let mut mapped = None;
    let mut pos = 0;
    while pos + 4 <= body.len() {
        let attr = u16::from_be_bytes([body[pos], body[pos + 1]]);
        let len = u16::from_be_bytes([body[pos + 2], body[pos + 3]]) as usize;
        let value = body
            .get(pos + 4..pos + 4 + len)
            .context("stun attribute truncated")?;
        match attr {
            ATTR_XOR_MAPPED_ADDRESS => return decode_address(value, Some(txn)),
            ATTR_MAPPED_ADDRESS => mapped = Some(decode_address(value, None)?),
            _ => {}
        }
        pos += 4 + len.div_ceil(4) * 4;
    }
    mapped.context("stun response carries no mapped address")
}

fn decode_address(value: &[u8], xor_with: Option<&TransactionId>) -> Result<SocketAddr> {
    if value.len() < 4 {
        anyhow::bail!("stun address attribute too short");
    }
    let family = value[1];
    let mut port = u16::from_be_bytes([value[2], value[3]]);
    let cookie = MAGIC_COOKIE.to_be_bytes();
    if xor_with.is_some() {
        port ^= (MAGIC_COOKIE >> 16) as u16;
    }
    let ip = match family {
        0x01 => {
            let raw = value.get(4..8).context("stun ipv4 address truncated")?;
            let octets: [u8; 4] = std::array::from_fn(|i| match xor_with {
                Some(_) => raw[i] ^ cookie[i],
                None => raw[i],
            });
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        0x02 => {
            let raw = value.get(4..20).context("stun ipv6 address truncated")?;
            let mut key = [0u8; 16];
            key[..4].copy_from_slice(&cookie);
            if let Some(txn) = xor_with {
                key[4..].copy_from_slice(txn);
            }
            let octets: [u8; 16] = std::array::from_fn(|i| match xor_with {
                Some(_) => raw[i] ^ key[i],
                None => raw[i],
            });
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        other => anyhow::bail!("unknown stun address family: {other}"),
    };
    Ok(SocketAddr::new(ip, port))
}

/// Sends one Binding request from `socket` and waits for the matching answer.
/// Callers bound the wait with their own timeout.
pub async fn query(socket: &UdpSocket, server: &str) -> Result<SocketAddr> {
    let local_is_v4 = socket.local_addr()?.is_ipv4();
    let server_addr = tokio::net::lookup_host(server)
        .await
        .with_context(|| format!("resolve stun server {server}"))?
        .find(|a| a.is_ipv4() == local_is_v4)
        .with_context(|| format!("no usable address for stun server {server}"))?;
    let txn = new_transaction_id();
    socket.send_to(&encode_binding_request(&txn), server_addr).await?;
    let mut buf = [0u8; 576];
    loop {
        let (n, from) = socket.recv_from(&mut buf).await?;
        if from != server_addr {
            continue;
        }
        if let Ok(addr) = parse_binding_response(&buf[..n], &txn) {
            return Ok(addr);
        }
    }
}

//! TP-Link Kasa local protocol: autokey XOR obfuscated JSON over UDP/TCP 9999.

use std::{
    io,
    net::{IpAddr, SocketAddr},
    time::Duration,
};

use serde_json::Value;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpStream, UdpSocket},
    time::{timeout, timeout_at, Instant},
};

use crate::error::RemoteAccessError;

pub const KASA_PORT: u16 = 9999;
pub const DEFAULT_DISCOVERY_TARGET: &str = "255.255.255.255:9999";

const INITIAL_KEY: u8 = 171;
const MAX_RESPONSE_BYTES: usize = 64 * 1024;
const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(5);

pub fn encrypt(plain: &[u8]) -> Vec<u8> {
    let mut key = INITIAL_KEY;
    plain
        .iter()
        .map(|&b| {
            key ^= b;
            key
        })
        .collect()
}

pub fn decrypt(cipher: &[u8]) -> Vec<u8> {
    let mut key = INITIAL_KEY;
    cipher
        .iter()
        .map(|&c| {
            let plain = key ^ c;
            key = c;
            plain
        })
        .collect()
}

/// TCP framing: 4-byte big-endian length, then the obfuscated payload.
pub fn frame(plain: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(plain.len() + 4);
    out.extend_from_slice(&(plain.len() as u32).to_be_bytes());
    out.extend_from_slice(&encrypt(plain));
    out
}

pub fn sysinfo_request() -> Value {
    serde_json::json!({ "system": { "get_sysinfo": {} } })
}

/// Realtime meter request, addressed to one outlet when `child_id` is set.
pub fn realtime_request(child_id: Option<&str>) -> Value {
    match child_id {
        Some(id) => serde_json::json!({
            "context": { "child_ids": [id] },
            "emeter": { "get_realtime": {} },
        }),
        None => serde_json::json!({ "emeter": { "get_realtime": {} } }),
    }
}

#[async_trait::async_trait]
pub trait PlugTransport: Send + Sync {
    /// Addresses of every plug answering discovery.
    async fn discover(&self) -> Result<Vec<IpAddr>, RemoteAccessError>;

    async fn query(&self, host: IpAddr, request: &Value) -> Result<Value, RemoteAccessError>;
}

pub struct NetworkTransport {
    discovery_target: SocketAddr,
    discovery_timeout: Duration,
    io_timeout: Duration,
    port: u16,
}

impl NetworkTransport {
    pub fn new(discovery_target: SocketAddr, discovery_timeout: Duration) -> Self {
        Self {
            discovery_target,
            discovery_timeout,
            io_timeout: DEFAULT_IO_TIMEOUT,
            port: KASA_PORT,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    async fn exchange(&self, host: IpAddr, payload: &[u8]) -> Result<Vec<u8>, RemoteAccessError> {
        let mut stream = TcpStream::connect((host, self.port)).await?;
        let _ = stream.set_nodelay(true);
        stream.write_all(&frame(payload)).await?;

        let len = stream.read_u32().await? as usize;
        if len > MAX_RESPONSE_BYTES {
            return Err(RemoteAccessError::malformed(
                format!("kasa device {host}"),
                format!("response of {len} bytes exceeds limit"),
            ));
        }
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).await?;
        Ok(decrypt(&buf))
    }
}

#[async_trait::async_trait]
impl PlugTransport for NetworkTransport {
    async fn discover(&self) -> Result<Vec<IpAddr>, RemoteAccessError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.set_broadcast(true)?;
        let request = serde_json::to_vec(&sysinfo_request()).map_err(io::Error::other)?;
        socket.send_to(&encrypt(&request), self.discovery_target).await?;

        let deadline = Instant::now() + self.discovery_timeout;
        let mut found = Vec::new();
        let mut buf = vec![0u8; MAX_RESPONSE_BYTES];
        loop {
            match timeout_at(deadline, socket.recv_from(&mut buf)).await {
                Ok(Ok((n, addr))) => {
                    let reply = decrypt(&buf[..n]);
                    if serde_json::from_slice::<Value>(&reply).is_err() {
                        tracing::debug!(%addr, "ignoring non-kasa discovery reply");
                        continue;
                    }
                    if !found.contains(&addr.ip()) {
                        found.push(addr.ip());
                    }
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_elapsed) => break,
            }
        }

        tracing::info!(devices = found.len(), "kasa discovery finished");
        Ok(found)
    }

    async fn query(&self, host: IpAddr, request: &Value) -> Result<Value, RemoteAccessError> {
        let payload = serde_json::to_vec(request).map_err(io::Error::other)?;
        let reply = timeout(self.io_timeout, self.exchange(host, &payload))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("kasa device {host} timed out")))??;

        serde_json::from_slice(&reply).map_err(|e| RemoteAccessError::malformed(format!("kasa device {host}"), e))
    }
}

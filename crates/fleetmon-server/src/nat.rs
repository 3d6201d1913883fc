use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};

use fleetmon_common::types::{task_type, NatInstruction};
use fleetmon_storage::entities::nat;

use crate::error::Result;
use crate::state::AppState;

const IDLE_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_HEAD_BYTES: usize = 8 * 1024;

/// A NAT tunnel profile: requests for `domain` on the tunnel listener are
/// relayed to `host` through the owning agent.
#[derive(Debug, Clone)]
pub struct NatProfile {
    pub id: u64,
    pub name: String,
    pub domain: String,
    pub host: String,
    pub server_id: u64,
    pub enabled: bool,
}

impl NatProfile {
    pub fn from_model(m: nat::Model) -> Self {
        Self {
            id: m.id as u64,
            name: m.name,
            domain: m.domain,
            host: m.host,
            server_id: m.server_id as u64,
            enabled: m.enabled,
        }
    }
}

/// Domain-keyed registry of NAT profiles.
#[derive(Default)]
pub struct NatRegistry {
    by_domain: RwLock<HashMap<String, Arc<NatProfile>>>,
    id_to_domain: RwLock<HashMap<u64, String>>,
}

impl NatRegistry {
    pub fn load(models: Vec<nat::Model>) -> Self {
        let registry = Self::default();
        {
            let mut by_domain = registry.by_domain.write().unwrap();
            let mut id_to_domain = registry.id_to_domain.write().unwrap();
            for m in models {
                let profile = Arc::new(NatProfile::from_model(m));
                id_to_domain.insert(profile.id, profile.domain.clone());
                by_domain.insert(profile.domain.clone(), profile);
            }
        }
        registry
    }

    pub fn get_by_domain(&self, domain: &str) -> Option<Arc<NatProfile>> {
        self.by_domain.read().unwrap().get(domain).cloned()
    }

    pub fn update(&self, profile: NatProfile) {
        let mut by_domain = self.by_domain.write().unwrap();
        let mut id_to_domain = self.id_to_domain.write().unwrap();
        if let Some(old_domain) = id_to_domain.get(&profile.id) {
            if *old_domain != profile.domain {
                by_domain.remove(old_domain);
            }
        }
        id_to_domain.insert(profile.id, profile.domain.clone());
        by_domain.insert(profile.domain.clone(), Arc::new(profile));
    }

    pub fn delete(&self, ids: &[u64]) {
        let mut by_domain = self.by_domain.write().unwrap();
        let mut id_to_domain = self.id_to_domain.write().unwrap();
        for id in ids {
            if let Some(domain) = id_to_domain.remove(id) {
                by_domain.remove(&domain);
            }
        }
    }
}

/// Accept loop of the NAT tunnel listener.
pub async fn serve(listener: TcpListener, state: AppState) {
    loop {
        let (conn, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "nat accept failed");
                continue;
            }
        };
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_conn(conn, &state).await {
                tracing::debug!(peer = %peer, error = %e, "nat session ended with error");
            }
        });
    }
}

/// Reads the HTTP head far enough to learn the Host, matches it against the
/// NAT table, instructs the owning agent to dial in, and relays the whole
/// connection (head included) over the paired IO stream.
async fn handle_conn(mut conn: TcpStream, state: &AppState) -> Result<()> {
    let mut head = Vec::with_capacity(1024);
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        if head.len() > MAX_HEAD_BYTES {
            return reject(conn, "431 Request Header Fields Too Large").await;
        }
        let n = conn.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        head.extend_from_slice(&buf[..n]);
    }

    let Some(domain) = host_from_head(&head) else {
        return reject(conn, "400 Bad Request").await;
    };
    let Some(profile) = state.nats.get_by_domain(&domain) else {
        return reject(conn, "404 Not Found").await;
    };
    if !profile.enabled {
        return reject(conn, "403 Forbidden").await;
    }
    let Some(agent) = state.registry.get(profile.server_id) else {
        return reject(conn, "503 Service Unavailable").await;
    };

    let stream_id = uuid::Uuid::new_v4().to_string();
    state.broker.create_stream(&stream_id);

    let instruction = NatInstruction {
        stream_id: stream_id.clone(),
        host: profile.host.clone(),
    };
    let task = fleetmon_common::proto::Task {
        id: profile.id,
        r#type: task_type::NAT,
        data: serde_json::to_string(&instruction).unwrap_or_default(),
    };
    if !agent.send_task(task) {
        state.broker.close_stream(&stream_id);
        return reject(conn, "503 Service Unavailable").await;
    }

    let user_io = PrefixedStream::new(head, conn);
    let result = state
        .broker
        .user_connected(&stream_id, Box::new(user_io))
        .map(|_| ());
    let outcome = match result {
        Ok(()) => state.broker.start_stream(&stream_id, IDLE_TIMEOUT).await,
        Err(e) => Err(e),
    };
    state.broker.close_stream(&stream_id);
    outcome
}

async fn reject(mut conn: TcpStream, status: &str) -> Result<()> {
    let body = format!("HTTP/1.1 {status}\r\nConnection: close\r\nContent-Length: 0\r\n\r\n");
    let _ = conn.write_all(body.as_bytes()).await;
    Ok(())
}

/// Extracts the Host header (without port) from a raw HTTP head.
fn host_from_head(head: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(head).ok()?;
    for line in text.split("\r\n").skip(1) {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.trim().eq_ignore_ascii_case("host") {
            let host = value.trim();
            let host = host.rsplit_once(':').map_or(host, |(h, port)| {
                if port.chars().all(|c| c.is_ascii_digit()) {
                    h
                } else {
                    host
                }
            });
            return Some(host.to_string());
        }
    }
    None
}

/// A byte stream that replays an already-read prefix before the underlying
/// connection.
pub struct PrefixedStream<S> {
    prefix: Vec<u8>,
    offset: usize,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix,
            offset: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.offset < self.prefix.len() {
            let remaining = &self.prefix[self.offset..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            self.offset += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_header_extraction() {
        let head = b"GET / HTTP/1.1\r\nUser-Agent: curl\r\nHost: tunnel.example.com:8008\r\n\r\n";
        assert_eq!(host_from_head(head).as_deref(), Some("tunnel.example.com"));

        let no_port = b"GET / HTTP/1.1\r\nhost: plain.example.com\r\n\r\n";
        assert_eq!(host_from_head(no_port).as_deref(), Some("plain.example.com"));

        let missing = b"GET / HTTP/1.1\r\nAccept: */*\r\n\r\n";
        assert_eq!(host_from_head(missing), None);
    }

    #[tokio::test]
    async fn prefixed_stream_replays_head_first() {
        let (mut remote, local) = tokio::io::duplex(64);
        remote.write_all(b" tail").await.unwrap();

        let mut stream = PrefixedStream::new(b"head".to_vec(), local);
        let mut got = [0u8; 9];
        stream.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"head tail");
    }

    #[test]
    fn registry_domain_moves() {
        let registry = NatRegistry::default();
        registry.update(NatProfile {
            id: 1,
            name: "web".into(),
            domain: "a.example.com".into(),
            host: "127.0.0.1:80".into(),
            server_id: 2,
            enabled: true,
        });
        assert!(registry.get_by_domain("a.example.com").is_some());

        registry.update(NatProfile {
            id: 1,
            name: "web".into(),
            domain: "b.example.com".into(),
            host: "127.0.0.1:80".into(),
            server_id: 2,
            enabled: true,
        });
        assert!(registry.get_by_domain("a.example.com").is_none());
        assert!(registry.get_by_domain("b.example.com").is_some());

        registry.delete(&[1]);
        assert!(registry.get_by_domain("b.example.com").is_none());
    }
}

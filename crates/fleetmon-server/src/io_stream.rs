use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;

use crate::error::{Result, ServerError};

/// Magic prefix of the first IO-stream frame, followed by the UTF-8 stream
/// id.
pub const STREAM_MAGIC: [u8; 4] = [0xff, 0x05, 0xff, 0x05];

pub trait StreamIo: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> StreamIo for T {}

pub type BoxedIo = Box<dyn StreamIo>;

#[derive(Default)]
struct IoStreamContext {
    user: Option<BoxedIo>,
    agent: Option<BoxedIo>,
}

/// Pairs dashboard-user connections with agent-side tunnel streams and
/// relays bytes between them.
#[derive(Default)]
pub struct IoStreamBroker {
    streams: Mutex<HashMap<String, IoStreamContext>>,
    connected: Notify,
}

impl IoStreamBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_stream(&self, id: &str) {
        self.streams
            .lock()
            .unwrap()
            .insert(id.to_owned(), IoStreamContext::default());
    }

    pub fn close_stream(&self, id: &str) {
        self.streams.lock().unwrap().remove(id);
    }

    pub fn has_stream(&self, id: &str) -> bool {
        self.streams.lock().unwrap().contains_key(id)
    }

    pub fn user_connected(&self, id: &str, io: BoxedIo) -> Result<()> {
        self.endpoint_connected(id, io, false)
    }

    pub fn agent_connected(&self, id: &str, io: BoxedIo) -> Result<()> {
        self.endpoint_connected(id, io, true)
    }

    fn endpoint_connected(&self, id: &str, io: BoxedIo, is_agent: bool) -> Result<()> {
        let mut streams = self.streams.lock().unwrap();
        let ctx = streams
            .get_mut(id)
            .ok_or_else(|| ServerError::StreamNotFound(id.to_owned()))?;
        let slot = if is_agent { &mut ctx.agent } else { &mut ctx.user };
        if slot.is_some() {
            return Err(ServerError::StreamBusy(id.to_owned()));
        }
        *slot = Some(io);
        drop(streams);
        self.connected.notify_waiters();
        Ok(())
    }

    /// Blocks until both endpoints are present (up to `pair_timeout`), then
    /// relays until either side closes or `idle_timeout` passes with no
    /// traffic in either direction.
    pub async fn start_stream(&self, id: &str, idle_timeout: Duration) -> Result<()> {
        const PAIR_TIMEOUT: Duration = Duration::from_secs(30);
        let deadline = tokio::time::Instant::now() + PAIR_TIMEOUT;

        let (user, agent) = loop {
            {
                let mut streams = self.streams.lock().unwrap();
                let ctx = streams
                    .get_mut(id)
                    .ok_or_else(|| ServerError::StreamNotFound(id.to_owned()))?;
                if ctx.user.is_some() && ctx.agent.is_some() {
                    break (ctx.user.take().unwrap(), ctx.agent.take().unwrap());
                }
            }
            if tokio::time::timeout_at(deadline, self.connected.notified())
                .await
                .is_err()
            {
                return Err(ServerError::StreamNotFound(id.to_owned()));
            }
        };

        relay(user, agent, idle_timeout).await?;
        Ok(())
    }
}

/// Copies bytes in both directions until one side closes or the stream sits
/// idle past `idle_timeout`.
pub async fn relay(user: BoxedIo, agent: BoxedIo, idle_timeout: Duration) -> std::io::Result<()> {
    let (user_read, user_write) = tokio::io::split(user);
    let (agent_read, agent_write) = tokio::io::split(agent);

    let activity = Arc::new(Mutex::new(tokio::time::Instant::now()));
    let mut upstream = tokio::spawn(copy_with_activity(user_read, agent_write, activity.clone()));
    let mut downstream = tokio::spawn(copy_with_activity(agent_read, user_write, activity.clone()));

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            r = &mut upstream => {
                downstream.abort();
                return r.unwrap_or(Ok(()));
            }
            r = &mut downstream => {
                upstream.abort();
                return r.unwrap_or(Ok(()));
            }
            _ = ticker.tick() => {
                let last = *activity.lock().unwrap();
                if last.elapsed() >= idle_timeout {
                    upstream.abort();
                    downstream.abort();
                    return Ok(());
                }
            }
        }
    }
}

async fn copy_with_activity(
    mut reader: impl AsyncRead + Send + Unpin,
    mut writer: impl AsyncWrite + Send + Unpin,
    activity: Arc<Mutex<tokio::time::Instant>>,
) -> std::io::Result<()> {
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            let _ = writer.shutdown().await;
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        *activity.lock().unwrap() = tokio::time::Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pairs_and_relays_both_directions() {
        let broker = Arc::new(IoStreamBroker::new());
        let id = "ffffffff-ffff-ffff-ffff-ffffffffffff";

        broker.create_stream(id);
        let (mut user_test, user_broker) = tokio::io::duplex(1 << 20);
        let (mut agent_test, agent_broker) = tokio::io::duplex(1 << 20);

        broker.agent_connected(id, Box::new(agent_broker)).unwrap();
        broker.user_connected(id, Box::new(user_broker)).unwrap();

        let b = broker.clone();
        let relay = tokio::spawn(async move {
            b.start_stream(id, Duration::from_secs(10)).await.unwrap();
        });

        let cases: Vec<Vec<u8>> = vec![
            vec![0, 9, 1, 3, 2, 9, 1, 4, 8],
            vec![3, 1, 3, 5, 2, 9, 5, 13, 53, 23],
            vec![0u8; 1024],
            vec![7u8; 1024 * 1024],
        ];

        for case in &cases {
            user_test.write_all(case).await.unwrap();
            let mut got = vec![0u8; case.len()];
            agent_test.read_exact(&mut got).await.unwrap();
            assert_eq!(&got, case);
        }

        for case in &cases {
            agent_test.write_all(case).await.unwrap();
            let mut got = vec![0u8; case.len()];
            user_test.read_exact(&mut got).await.unwrap();
            assert_eq!(&got, case);
        }

        // partial reads drain in order
        agent_test.write_all(&[1, 2, 3, 4, 5, 6, 7, 8]).await.unwrap();
        let mut first = [0u8; 4];
        user_test.read_exact(&mut first).await.unwrap();
        let mut second = [0u8; 4];
        user_test.read_exact(&mut second).await.unwrap();
        assert_eq!(first, [1, 2, 3, 4]);
        assert_eq!(second, [5, 6, 7, 8]);

        drop(user_test);
        drop(agent_test);
        relay.await.unwrap();
    }

    #[tokio::test]
    async fn endpoints_require_created_stream() {
        let broker = IoStreamBroker::new();
        let (_a, b) = tokio::io::duplex(64);
        let err = broker.user_connected("missing", Box::new(b)).unwrap_err();
        assert!(matches!(err, ServerError::StreamNotFound(_)));

        broker.create_stream("s1");
        let (_a, b) = tokio::io::duplex(64);
        broker.user_connected("s1", Box::new(b)).unwrap();
        let (_a, b) = tokio::io::duplex(64);
        assert!(matches!(
            broker.user_connected("s1", Box::new(b)),
            Err(ServerError::StreamBusy(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_ends_relay() {
        let (user_test, user_broker) = tokio::io::duplex(64);
        let (agent_test, agent_broker) = tokio::io::duplex(64);

        let relay = tokio::spawn(relay(
            Box::new(user_broker) as BoxedIo,
            Box::new(agent_broker) as BoxedIo,
            Duration::from_secs(10),
        ));

        tokio::time::sleep(Duration::from_secs(12)).await;
        relay.await.unwrap().unwrap();
        drop(user_test);
        drop(agent_test);
    }
}

//! Dialing abstraction (C12): C8's driver loop talks to `dyn Transport`
//! rather than `tokio_tungstenite` directly, so tests can drive welcome/
//! keepalive/reconnect/dedup scenarios against an in-process fake instead
//! of a real socket.

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::MaybeTlsStream;

use crate::error::{Error, Result};

#[async_trait::async_trait]
pub trait Transport: Send {
    /// Yields the next text frame. `Ok(None)` on a clean close, `Err` on a
    /// transport failure. Ping/pong is handled internally.
    async fn recv(&mut self) -> Result<Option<String>>;
    async fn close(&mut self);
}

#[async_trait::async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, url: &str) -> Result<Box<dyn Transport>>;
}

pub struct TungsteniteTransport {
    stream: tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
}

#[async_trait::async_trait]
impl Transport for TungsteniteTransport {
    async fn recv(&mut self) -> Result<Option<String>> {
        loop {
            match self.stream.next().await {
                None => return Ok(None),
                Some(Err(e)) => return Err(Error::WebSocket(e)),
                Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                Some(Ok(Message::Ping(payload))) => {
                    self.stream.send(Message::Pong(payload)).await?;
                }
                Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Ok(_)) => continue,
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}

pub struct TungsteniteDialer;

#[async_trait::async_trait]
impl Dialer for TungsteniteDialer {
    async fn dial(&self, url: &str) -> Result<Box<dyn Transport>> {
        let (stream, _response) = tokio_tungstenite::connect_async(url).await?;
        Ok(Box::new(TungsteniteTransport { stream }))
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::collections::VecDeque;
    use tokio::sync::Mutex as AsyncMutex;
    use tokio::sync::mpsc;

    /// Feeds pre-scripted text frames to the driver loop and records
    /// whether `close()` was called.
    pub struct FakeTransport {
        inbound: mpsc::UnboundedReceiver<String>,
        pub closed: std::sync::Arc<std::sync::atomic::AtomicBool>,
    }

    impl FakeTransport {
        pub fn new() -> (mpsc::UnboundedSender<String>, Self) {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                tx,
                Self {
                    inbound: rx,
                    closed: std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false)),
                },
            )
        }
    }

    #[async_trait::async_trait]
    impl Transport for FakeTransport {
        async fn recv(&mut self) -> Result<Option<String>> {
            Ok(self.inbound.recv().await)
        }

        async fn close(&mut self) {
            self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    /// Hands out pre-registered [`FakeTransport`]s in dial order, regardless
    /// of the URL requested.
    pub struct FakeDialer {
        queue: AsyncMutex<VecDeque<Box<dyn Transport>>>,
    }

    impl FakeDialer {
        pub fn new() -> Self {
            Self {
                queue: AsyncMutex::new(VecDeque::new()),
            }
        }

        pub async fn push(&self, transport: FakeTransport) {
            self.queue.lock().await.push_back(Box::new(transport));
        }
    }

    #[async_trait::async_trait]
    impl Dialer for FakeDialer {
        async fn dial(&self, _url: &str) -> Result<Box<dyn Transport>> {
            self.queue
                .lock()
                .await
                .pop_front()
                .ok_or_else(|| Error::Transport("no fake transport queued".into()))
        }
    }
}

//! Serialized writer for one client connection.
//!
//! Every subscription task on a connection writes through the same
//! [`WsConn`]; a single async mutex around the sink keeps frames whole. The
//! first failed write closes the connection, which cancels everything hanging
//! off [`WsConn::closed`].

use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::SinkExt;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::WsError;

/// Outgoing half of a client connection.
#[async_trait]
pub trait FrameSink: Send {
    async fn send_text(&mut self, text: String) -> Result<(), WsError>;

    async fn close(&mut self) -> Result<(), WsError>;
}

#[async_trait]
impl<S> FrameSink for SplitSink<WebSocketStream<S>, Message>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send_text(&mut self, text: String) -> Result<(), WsError> {
        self.send(Message::Text(text.into()))
            .await
            .map_err(|e| WsError::Write(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), WsError> {
        SinkExt::close(self)
            .await
            .map_err(|e| WsError::Write(e.to_string()))
    }
}

/// In-process sink: every frame becomes one channel message.
#[async_trait]
impl FrameSink for mpsc::Sender<String> {
    async fn send_text(&mut self, text: String) -> Result<(), WsError> {
        self.send(text).await.map_err(|_| WsError::Closed)
    }

    async fn close(&mut self) -> Result<(), WsError> {
        Ok(())
    }
}

/// A client connection's write side.
pub struct WsConn {
    peer: String,
    sink: Mutex<Box<dyn FrameSink>>,
    closed: CancellationToken,
}

impl std::fmt::Debug for WsConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsConn")
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl WsConn {
    pub fn new(peer: impl Into<String>, sink: impl FrameSink + 'static) -> Self {
        Self {
            peer: peer.into(),
            sink: Mutex::new(Box::new(sink)),
            closed: CancellationToken::new(),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Serialize `value` and send it as one text frame.
    ///
    /// A failed send closes the connection.
    pub async fn write_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<(), WsError> {
        if self.closed.is_cancelled() {
            return Err(WsError::Closed);
        }
        let text = serde_json::to_string(value)?;
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.send_text(text).await {
            warn!(peer = %self.peer, error = %e, "write failed, dropping peer");
            self.closed.cancel();
            if let Err(e) = sink.close().await {
                debug!(peer = %self.peer, error = %e, "close after failed write");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Close the connection. Idempotent.
    pub async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        if let Err(e) = self.sink.lock().await.close().await {
            debug!(peer = %self.peer, error = %e, "close failed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Token cancelled once the connection closes.
    pub fn closed(&self) -> &CancellationToken {
        &self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    struct FailingSink;

    #[async_trait]
    impl FrameSink for FailingSink {
        async fn send_text(&mut self, _text: String) -> Result<(), WsError> {
            Err(WsError::Write("broken pipe".into()))
        }

        async fn close(&mut self) -> Result<(), WsError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn writes_whole_frames() {
        let (tx, mut rx) = mpsc::channel(8);
        let conn = WsConn::new("test", tx);
        conn.write_json(&json!({"a": 1})).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), r#"{"a":1}"#);
    }

    #[tokio::test]
    async fn concurrent_writers_do_not_interleave() {
        let (tx, mut rx) = mpsc::channel(256);
        let conn = Arc::new(WsConn::new("test", tx));
        let writers: Vec<_> = (0..8)
            .map(|w| {
                let conn = Arc::clone(&conn);
                tokio::spawn(async move {
                    for i in 0..16 {
                        conn.write_json(&json!({"w": w, "i": i})).await.unwrap();
                    }
                })
            })
            .collect();
        for w in writers {
            w.await.unwrap();
        }
        drop(conn);
        let mut frames = 0;
        while let Some(frame) = rx.recv().await {
            let v: serde_json::Value = serde_json::from_str(&frame).unwrap();
            assert!(v["w"].is_number());
            frames += 1;
        }
        assert_eq!(frames, 128);
    }

    #[tokio::test]
    async fn failed_write_closes_connection() {
        let conn = WsConn::new("test", FailingSink);
        let closed = conn.closed().clone();
        assert!(conn.write_json(&json!(1)).await.is_err());
        assert!(closed.is_cancelled());
        assert!(matches!(conn.write_json(&json!(2)).await, Err(WsError::Closed)));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (tx, _rx) = mpsc::channel(1);
        let conn = WsConn::new("test", tx);
        conn.close().await;
        conn.close().await;
        assert!(conn.is_closed());
    }
}

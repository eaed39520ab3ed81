//! Message-oriented connection handles
//!
//! Each channel of a server transport exclusively owns one `StreamConn`.
//! Every `send` is delivered to the peer as one message, and every `recv`
//! returns exactly one message.

use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};

#[async_trait]
pub trait StreamConn: Send + Sync {
    /// Receive the next message into `buf`, returning its length. Fails with
    /// `UnexpectedEof` once the stream has ended, and with `InvalidData` if
    /// the message does not fit in `buf`.
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Send one message
    async fn send(&self, buf: &[u8]) -> io::Result<usize>;

    async fn close(&self) -> io::Result<()>;
}

pub(crate) fn eof() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "stream closed")
}

/// Copy a received message into the caller's buffer
pub(crate) fn copy_message(message: &[u8], buf: &mut [u8]) -> io::Result<usize> {
    if message.len() > buf.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "message of {} bytes does not fit in {} byte buffer",
                message.len(),
                buf.len()
            ),
        ));
    }
    buf[..message.len()].copy_from_slice(message);
    Ok(message.len())
}

/// In-process connection, one half of a [`pipe`]
pub struct PipeConn {
    tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    rx: Mutex<mpsc::Receiver<Bytes>>,
    closed: watch::Sender<bool>,
}

/// Create a connected pair of in-process connections
pub fn pipe(capacity: usize) -> (Arc<PipeConn>, Arc<PipeConn>) {
    let (a_tx, b_rx) = mpsc::channel(capacity);
    let (b_tx, a_rx) = mpsc::channel(capacity);

    let a = PipeConn {
        tx: Mutex::new(Some(a_tx)),
        rx: Mutex::new(a_rx),
        closed: watch::channel(false).0,
    };
    let b = PipeConn {
        tx: Mutex::new(Some(b_tx)),
        rx: Mutex::new(b_rx),
        closed: watch::channel(false).0,
    };

    (Arc::new(a), Arc::new(b))
}

#[async_trait]
impl StreamConn for PipeConn {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut closed = self.closed.subscribe();
        let mut rx = self.rx.lock().await;

        tokio::select! {
            message = rx.recv() => copy_message(&message.ok_or_else(eof)?, buf),
            _ = closed.wait_for(|closed| *closed) => Err(eof()),
        }
    }

    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        let tx = self.tx.lock().await.clone();
        let tx = tx.ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "pipe closed"))?;

        tx.send(Bytes::copy_from_slice(buf))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe peer closed"))?;
        Ok(buf.len())
    }

    async fn close(&self) -> io::Result<()> {
        // Dropping the sender ends the peer's stream
        self.tx.lock().await.take();
        self.closed.send_replace(true);
        Ok(())
    }
}

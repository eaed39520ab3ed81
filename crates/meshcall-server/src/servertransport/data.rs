//! Data channel: application messages for one room

use meshcall_protocol::DataMessage;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{Instrument, Span};

use crate::error::{Error, Result};
use crate::mux::StreamConn;
use crate::transport::{Done, DoneTrigger};

const DATA_MTU: usize = 64 * 1024;

const INBOUND_QUEUE: usize = 256;

pub struct DataTransportParams {
    pub conn: Arc<dyn StreamConn>,
    pub span: Span,
}

async fn read_loop(
    conn: Arc<dyn StreamConn>,
    inbound: mpsc::Sender<DataMessage>,
    closed: DoneTrigger,
) {
    let mut buf = vec![0u8; DATA_MTU];

    loop {
        let n = match conn.recv(&mut buf).await {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                tracing::debug!("Data stream ended");
                break;
            }
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                tracing::warn!("Dropping oversized data message: {}", e);
                continue;
            }
            Err(e) => {
                tracing::warn!("Data stream read failed: {}", e);
                break;
            }
        };

        let message = match DataMessage::from_bytes(&buf[..n]) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Invalid data message: {}", e);
                continue;
            }
        };

        if inbound.send(message).await.is_err() {
            break;
        }
    }

    closed.fire();
}

/// Ordered, reliable application messages for one room
pub struct DataTransport {
    conn: Arc<dyn StreamConn>,
    inbound: Mutex<mpsc::Receiver<DataMessage>>,
    reader: JoinHandle<()>,
    closed: Done,
    closing: AtomicBool,
    span: Span,
}

impl DataTransport {
    pub fn new(params: DataTransportParams) -> Self {
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
        let trigger = DoneTrigger::new();
        let closed = trigger.signal();
        let reader = tokio::spawn(
            read_loop(params.conn.clone(), tx, trigger).instrument(params.span.clone()),
        );

        Self {
            conn: params.conn,
            inbound: Mutex::new(rx),
            reader,
            closed,
            closing: AtomicBool::new(false),
            span: params.span,
        }
    }

    pub async fn send(&self, message: &DataMessage) -> Result<()> {
        self.conn.send(&message.to_bytes()).await?;
        Ok(())
    }

    /// Next message from the remote node, in the order it was sent. None
    /// once the channel has closed.
    pub async fn recv(&self) -> Option<DataMessage> {
        self.inbound.lock().await.recv().await
    }

    /// Fires when the read loop has stopped
    pub fn closed(&self) -> Done {
        self.closed.clone()
    }

    pub async fn close(&self) -> Result<()> {
        if self.closing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let result = self.conn.close().await;
        self.reader.abort();

        tracing::debug!(parent: &self.span, "Data transport closed");
        result.map_err(Error::from)
    }
}

impl Drop for DataTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::pipe;
    use meshcall_protocol::DataKind;
    use std::time::Duration;
    use tokio::time::timeout;

    fn pair() -> (DataTransport, DataTransport) {
        let (a, b) = pipe(16);
        (
            DataTransport::new(DataTransportParams {
                conn: a,
                span: Span::none(),
            }),
            DataTransport::new(DataTransportParams {
                conn: b,
                span: Span::none(),
            }),
        )
    }

    #[tokio::test]
    async fn test_messages_arrive_in_order() {
        let (a, b) = pair();

        a.send(&DataMessage::text("hello")).await.unwrap();
        a.send(&DataMessage::binary(vec![1, 2, 3])).await.unwrap();
        a.send(&DataMessage::text("bye")).await.unwrap();

        let first = timeout(Duration::from_secs(1), b.recv()).await.unwrap().unwrap();
        assert_eq!(first.kind, DataKind::String);
        assert_eq!(first.data, b"hello");

        let second = timeout(Duration::from_secs(1), b.recv()).await.unwrap().unwrap();
        assert_eq!(second.kind, DataKind::Binary);
        assert_eq!(second.data, vec![1, 2, 3]);

        let third = timeout(Duration::from_secs(1), b.recv()).await.unwrap().unwrap();
        assert_eq!(third.data, b"bye");
    }

    #[tokio::test]
    async fn test_close_ends_remote_recv() {
        let (a, b) = pair();
        a.close().await.unwrap();
        a.close().await.unwrap();

        assert!(timeout(Duration::from_secs(1), b.recv()).await.unwrap().is_none());
        timeout(Duration::from_secs(1), b.closed().wait())
            .await
            .unwrap();
        assert!(b.closed().is_done());
    }
}

// In-memory transport over a pair of bounded channels. The bound is what
// makes backpressure observable end to end: a slow reader stalls the
// producer's sends, which stalls the multiplexer's race.

use crate::transport::{TextTransport, TransportError};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// One endpoint of an in-memory duplex link.
#[derive(Debug)]
pub struct ChannelTransport {
    tx: Option<mpsc::Sender<String>>,
    rx: mpsc::Receiver<String>,
}

/// Two connected endpoints; what one sends the other receives.
pub fn pair(capacity: usize) -> (ChannelTransport, ChannelTransport) {
    let (a_tx, a_rx) = mpsc::channel(capacity);
    let (b_tx, b_rx) = mpsc::channel(capacity);
    (
        ChannelTransport {
            tx: Some(a_tx),
            rx: b_rx,
        },
        ChannelTransport {
            tx: Some(b_tx),
            rx: a_rx,
        },
    )
}

#[async_trait]
impl TextTransport for ChannelTransport {
    async fn send(&mut self, fragment: &str) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::ConnectionClosed)?;
        tx.send(fragment.to_string())
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn recv(&mut self) -> Result<Option<String>, TransportError> {
        Ok(self.rx.recv().await)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx = None;
        Ok(())
    }
}

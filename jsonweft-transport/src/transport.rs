use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed")]
    ConnectionClosed,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed input: {0}")]
    Malformed(String),
}

/// Bidirectional carrier of wire text. Fragment boundaries carry no
/// meaning: a transport may coalesce or split them arbitrarily, the codec
/// reassembles records from complete lines.
#[async_trait]
pub trait TextTransport: Send {
    async fn send(&mut self, fragment: &str) -> Result<(), TransportError>;

    /// Next fragment, or `None` once the peer has closed cleanly.
    async fn recv(&mut self) -> Result<Option<String>, TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Drive a serialized call into a transport, closing it afterwards.
pub async fn pump<T: TextTransport>(
    transport: &mut T,
    mut fragments: BoxStream<'static, String>,
) -> Result<(), TransportError> {
    while let Some(fragment) = fragments.next().await {
        transport.send(&fragment).await?;
    }
    transport.close().await
}

/// Adapt a receiving transport into the fragment source `Codec::parse`
/// expects. A transport failure mid-document ends the source, which the
/// codec surfaces as an interruption on every unsettled value.
pub fn into_fragments<T: TextTransport + 'static>(transport: T) -> BoxStream<'static, String> {
    stream::unfold(transport, |mut transport| async move {
        match transport.recv().await {
            Ok(Some(fragment)) => Some((fragment, transport)),
            Ok(None) => None,
            Err(err) => {
                warn!(error = %err, "transport failed mid-document");
                None
            }
        }
    })
    .boxed()
}

//! Inbound side of the byte transport.
//!
//! Accepts connections, reads one frame per connection until the sender
//! half-closes, pushes the raw frame into the peer's inbox and answers with
//! the fixed `ACK` token.

use bytes::Bytes;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::constants::protocol::{ACK_TOKEN, MAX_FRAME_SIZE};
use crate::error::TransportError;

/// Sending half of a peer's inbox
pub type InboxSender = mpsc::UnboundedSender<Bytes>;

pub struct TransportServer {
    listener: TcpListener,
    read_timeout: Duration,
}

impl TransportServer {
    pub async fn bind(bind_addr: &str, read_timeout: Duration) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|source| TransportError::Bind {
                address: bind_addr.to_string(),
                source,
            })?;

        Ok(Self {
            listener,
            read_timeout,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept until cancelled. Dropping `self` on return closes the listening socket.
    pub async fn run(
        self,
        inbox: InboxSender,
        cancel: CancellationToken,
    ) -> Result<(), TransportError> {
        tracing::info!(
            "📡 Transport listening on {}",
            self.listener
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "?".to_string())
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("🛑 Transport accept loop stopped");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (stream, remote) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::warn!("❌ Accept failed: {}", e);
                            continue;
                        }
                    };

                    let inbox = inbox.clone();
                    let read_timeout = self.read_timeout;
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, remote, inbox, read_timeout).await {
                            tracing::debug!("Connection from {} dropped: {}", remote, e);
                        }
                    });
                }
            }
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    remote: SocketAddr,
    inbox: InboxSender,
    read_timeout: Duration,
) -> Result<(), TransportError> {
    let mut frame = Vec::new();
    let mut limited = (&mut stream).take(MAX_FRAME_SIZE as u64 + 1);
    let read = limited.read_to_end(&mut frame);

    match tokio::time::timeout(read_timeout, read).await {
        Ok(result) => {
            result?;
        }
        Err(_) => {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "frame read timed out",
            )));
        }
    }

    if frame.len() > MAX_FRAME_SIZE {
        tracing::warn!(
            "🚫 Refusing oversized frame from {} (> {} bytes)",
            remote,
            MAX_FRAME_SIZE
        );
        return Err(TransportError::FrameTooLarge {
            size: frame.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    tracing::trace!("📥 Received {} bytes from {}", frame.len(), remote);
    inbox
        .send(Bytes::from(frame))
        .map_err(|_| TransportError::InboxClosed)?;

    stream.write_all(ACK_TOKEN).await?;
    stream.flush().await?;
    Ok(())
}

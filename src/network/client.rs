//! Outbound side of the byte transport.
//!
//! Every frame goes out on its own short-lived TCP connection: connect, write
//! the frame, half-close, then wait for the 3-byte `ACK`. Anything else is a
//! delivery failure.

use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::address::Address;
use crate::constants::protocol::{ACK_TOKEN, MAX_FRAME_SIZE};
use crate::error::TransportError;

/// "Send bytes to address X, expect an ACK."
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, to: Address, frame: Bytes) -> Result<(), TransportError>;
}

#[derive(Debug, Clone)]
pub struct TcpTransport {
    timeout: Duration,
}

impl TcpTransport {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn exchange(&self, to: Address, frame: &[u8]) -> Result<(), TransportError> {
        let mut stream = TcpStream::connect(SocketAddr::V4(to.socket_addr()))
            .await
            .map_err(|source| TransportError::Connect {
                address: to,
                source,
            })?;
        stream.set_nodelay(true)?;

        stream.write_all(frame).await?;
        stream.flush().await?;
        stream.shutdown().await?;

        let mut reply = Vec::with_capacity(ACK_TOKEN.len());
        (&mut stream)
            .take(ACK_TOKEN.len() as u64 + 1)
            .read_to_end(&mut reply)
            .await?;

        if reply.as_slice() != ACK_TOKEN.as_slice() {
            return Err(TransportError::BadAck { address: to, reply });
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, to: Address, frame: Bytes) -> Result<(), TransportError> {
        if frame.len() > MAX_FRAME_SIZE {
            return Err(TransportError::FrameTooLarge {
                size: frame.len(),
                max: MAX_FRAME_SIZE,
            });
        }

        match tokio::time::timeout(self.timeout, self.exchange(to, &frame)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(to)),
        }
    }
}

//! Prompt-framed reads over any async byte stream

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use super::{TransportError, TransportHandle};
use crate::elm::PROMPT;

const READ_CHUNK: usize = 256;

/// [`TransportHandle`] over a serial port or socket
pub struct StreamHandle<S> {
    stream: Option<S>,
    label: String,
    buffer: Vec<u8>,
}

impl<S> StreamHandle<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, label: impl Into<String>) -> Self {
        Self {
            stream: Some(stream),
            label: label.into(),
            buffer: Vec::new(),
        }
    }

    fn stream(&mut self) -> Result<&mut S, TransportError> {
        self.stream.as_mut().ok_or(TransportError::ConnectionClosed)
    }

    fn take_reply(&mut self) -> Option<Vec<u8>> {
        let end = self.buffer.iter().position(|b| *b == PROMPT)?;
        Some(self.buffer.drain(..=end).collect())
    }
}

#[async_trait]
impl<S> TransportHandle for StreamHandle<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let stream = self.stream()?;
        stream
            .write_all(bytes)
            .await
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        stream
            .flush()
            .await
            .map_err(|e| TransportError::WriteFailed(e.to_string()))
    }

    async fn read(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(reply) = self.take_reply() {
                trace!(adapter = %self.label, len = reply.len(), "Reply received");
                return Ok(reply);
            }
            let stream = self.stream()?;
            let result = tokio::time::timeout_at(deadline, stream.read(&mut chunk)).await;
            match result {
                Err(_) => {
                    return Err(TransportError::Timeout(format!(
                        "no prompt from {} within {} ms",
                        self.label,
                        timeout.as_millis()
                    )))
                }
                Ok(Ok(0)) => return Err(TransportError::ConnectionClosed),
                Ok(Ok(n)) => self.buffer.extend_from_slice(&chunk[..n]),
                Ok(Err(e)) => return Err(TransportError::ReadFailed(e.to_string())),
            }
        }
    }

    async fn discard_input(&mut self) -> Result<(), TransportError> {
        self.buffer.clear();
        let mut chunk = [0u8; READ_CHUNK];
        let stream = self.stream()?;
        // A zero timeout polls the stream once without waiting.
        while let Ok(result) = tokio::time::timeout(Duration::ZERO, stream.read(&mut chunk)).await
        {
            match result {
                Ok(0) => return Err(TransportError::ConnectionClosed),
                Ok(_) => continue,
                Err(e) => return Err(TransportError::ReadFailed(e.to_string())),
            }
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(mut stream) = self.stream.take() {
            self.buffer.clear();
            stream
                .shutdown()
                .await
                .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }
}

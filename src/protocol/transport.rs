//! Line-delimited JSON transport.

use crate::error::{ProtocolError, Result};
use crate::protocol::types::Response;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Stdin, Stdout};
use tokio::sync::Mutex;
use tracing::{debug, error, trace};

/// Transport trait for the gateway service.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Next request line as JSON, `None` at end of input.
    async fn read_message(&self) -> Result<Option<Value>>;
    async fn write_response(&self, response: &Response) -> Result<()>;
}

/// JSON-lines transport over any buffered reader and writer.
pub struct LineTransport<R, W> {
    reader: Mutex<R>,
    writer: Mutex<W>,
}

/// The transport used by the binary.
pub type StdioTransport = LineTransport<BufReader<Stdin>, Stdout>;

impl StdioTransport {
    pub fn stdio() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
    }
}

impl<R, W> LineTransport<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        }
    }

    /// Read the next non-blank line.
    async fn read_line(&self) -> Result<Option<String>> {
        let mut reader = self.reader.lock().await;
        let mut line = String::new();

        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => return Ok(None), // EOF
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    trace!("Received line: {}", trimmed);
                    return Ok(Some(trimmed.to_string()));
                }
                Err(e) => {
                    error!("Error reading request stream: {}", e);
                    return Err(e.into());
                }
            }
        }
    }

    async fn write_line(&self, content: &str) -> Result<()> {
        let mut writer = self.writer.lock().await;
        trace!("Sending line: {}", content);
        writer.write_all(content.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }

    /// Give back the writer, e.g. to inspect what was written.
    pub fn into_writer(self) -> W {
        self.writer.into_inner()
    }
}

#[async_trait::async_trait]
impl<R, W> Transport for LineTransport<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn read_message(&self) -> Result<Option<Value>> {
        let Some(line) = self.read_line().await? else {
            return Ok(None);
        };

        match serde_json::from_str::<Value>(&line) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                error!("Failed to parse request: {}", e);
                Err(ProtocolError::ParseError.into())
            }
        }
    }

    async fn write_response(&self, response: &Response) -> Result<()> {
        let json = serde_json::to_string(response)?;
        debug!("Sending response: id={:?} ok={}", response.id, response.ok);
        self.write_line(&json).await
    }
}

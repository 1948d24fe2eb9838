use std::{collections::VecDeque, pin::Pin, sync::Arc};

use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines},
    sync::Mutex,
};

use super::{
    codec::{self, FramingError},
    message::Message,
};

pub type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;
pub type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("channel I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error("channel is closed")]
    Closed,
}

/// Reads framed messages from a byte stream.
///
/// Messages skipped by [`MessageReader::read_matching`] are kept and handed
/// out by later reads in arrival order.
pub struct MessageReader {
    lines: Lines<BufReader<BoxedReader>>,
    backlog: VecDeque<Message>,
}

impl MessageReader {
    pub fn new(reader: impl AsyncRead + Send + 'static) -> Self {
        let reader: BoxedReader = Box::pin(reader);
        Self {
            lines: BufReader::new(reader).lines(),
            backlog: VecDeque::new(),
        }
    }

    /// Next message, or `None` once the peer closed the stream.
    ///
    /// Cancel safe: dropping the future loses no buffered input.
    pub async fn read(&mut self) -> Result<Option<Message>, ChannelError> {
        if let Some(message) = self.backlog.pop_front() {
            return Ok(Some(message));
        }
        self.read_stream().await
    }

    /// Next message satisfying `predicate`; everything else is queued.
    pub async fn read_matching<F>(&mut self, mut predicate: F) -> Result<Option<Message>, ChannelError>
    where
        F: FnMut(&Message) -> bool,
    {
        if let Some(index) = self.backlog.iter().position(&mut predicate) {
            return Ok(self.backlog.remove(index));
        }
        loop {
            let Some(message) = self.read_stream().await? else {
                return Ok(None);
            };
            if predicate(&message) {
                return Ok(Some(message));
            }
            self.backlog.push_back(message);
        }
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    async fn read_stream(&mut self) -> Result<Option<Message>, ChannelError> {
        loop {
            let Some(line) = self.lines.next_line().await? else {
                return Ok(None);
            };
            if line.trim().is_empty() {
                continue;
            }
            return Ok(Some(codec::decode(&line)?));
        }
    }
}

/// Writes framed messages; one message at a time, flushed per line.
#[derive(Clone)]
pub struct MessageWriter {
    inner: Arc<Mutex<Option<BoxedWriter>>>,
}

impl MessageWriter {
    pub fn new(writer: impl AsyncWrite + Send + 'static) -> Self {
        let writer: BoxedWriter = Box::pin(writer);
        Self {
            inner: Arc::new(Mutex::new(Some(writer))),
        }
    }

    pub async fn send(&self, message: &Message) -> Result<(), ChannelError> {
        let line = codec::encode(message)?;
        let mut guard = self.inner.lock().await;
        let writer = guard.as_mut().ok_or(ChannelError::Closed)?;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Shuts the stream down. Later sends fail with [`ChannelError::Closed`].
    pub async fn close(&self) {
        let writer = self.inner.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(err) = writer.shutdown().await {
                tracing::debug!(%err, "channel shutdown failed");
            }
        }
    }

    /// Drops the stream without waiting; a no-op while a send is in progress.
    pub fn close_now(&self) {
        if let Ok(mut guard) = self.inner.try_lock() {
            guard.take();
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};
    use tokio::io::{AsyncWriteExt, duplex};

    use super::*;

    #[tokio::test]
    async fn read_matching_queues_skipped_messages_in_order() {
        let (mut tx, rx) = duplex(1024);
        tx.write_all(
            b"{\"method\":\"Log\",\"params\":1}\n\n{\"method\":\"Log\",\"params\":2}\n{\"method\":\"NotifyStarted\"}\n",
        )
        .await
        .expect("write");
        drop(tx);

        let mut reader = MessageReader::new(rx);
        let started = reader
            .read_matching(|m| m.is_notification_of("NotifyStarted"))
            .await
            .expect("read");
        assert_eq!(started, Some(Message::notification("NotifyStarted", Value::Null)));
        assert_eq!(reader.backlog_len(), 2);

        assert_eq!(
            reader.read().await.expect("read"),
            Some(Message::notification("Log", json!(1)))
        );
        assert_eq!(
            reader.read().await.expect("read"),
            Some(Message::notification("Log", json!(2)))
        );
        assert_eq!(reader.read().await.expect("read"), None);
    }

    #[tokio::test]
    async fn malformed_line_is_a_framing_error() {
        let (mut tx, rx) = duplex(64);
        tx.write_all(b"not json\n").await.expect("write");
        let mut reader = MessageReader::new(rx);
        assert!(matches!(reader.read().await, Err(ChannelError::Framing(_))));
    }

    #[tokio::test]
    async fn writer_rejects_sends_after_close() {
        let (tx, rx) = duplex(1024);
        let writer = MessageWriter::new(tx);
        let mut reader = MessageReader::new(rx);

        writer
            .send(&Message::notification("Shutdown", Value::Null))
            .await
            .expect("send");
        writer.close().await;

        assert!(matches!(
            writer.send(&Message::notification("Shutdown", Value::Null)).await,
            Err(ChannelError::Closed)
        ));
        assert!(reader.read().await.expect("read").is_some());
        assert_eq!(reader.read().await.expect("read"), None);
    }
}

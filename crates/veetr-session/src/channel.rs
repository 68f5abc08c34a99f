//! Command channel over an attached link.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};
use veetr_core::{ChannelError, CommandChannel, LinkWriter, Notice, wire::CodecError};

/// Buffered notices per subscriber.
const NOTICE_CAPACITY: usize = 256;

/// [`CommandChannel`] backed by one link's writer.
///
/// The session's pump feeds inbound notices in through [`dispatch`]; the
/// session closes the channel when the link goes away, which wakes every
/// waiter watching [`CommandChannel::closed`].
///
/// [`dispatch`]: LinkChannel::dispatch
pub struct LinkChannel {
    writer: Arc<dyn LinkWriter>,
    notices: broadcast::Sender<Notice>,
    closed: watch::Sender<bool>,
    max_envelope_bytes: usize,
}

impl LinkChannel {
    #[must_use]
    pub fn new(writer: Arc<dyn LinkWriter>, max_envelope_bytes: usize) -> Self {
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        let (closed, _) = watch::channel(false);
        Self {
            writer,
            notices,
            closed,
            max_envelope_bytes,
        }
    }

    /// Deliver an inbound notice to current subscribers.
    pub fn dispatch(&self, notice: Notice) {
        // no subscriber means nobody is waiting for it
        let _ = self.notices.send(notice);
    }

    /// Mark the channel closed. Later sends fail with [`ChannelError::Closed`].
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    pub(crate) fn writer(&self) -> &Arc<dyn LinkWriter> {
        &self.writer
    }
}

#[async_trait]
impl CommandChannel for LinkChannel {
    async fn send(&self, payload: Vec<u8>) -> Result<(), ChannelError> {
        if *self.closed.borrow() {
            return Err(ChannelError::Closed);
        }
        if payload.len() > self.max_envelope_bytes {
            return Err(CodecError::Oversize {
                len: payload.len(),
                max: self.max_envelope_bytes,
            }
            .into());
        }
        self.writer.write(&payload).await.map_err(ChannelError::from)
    }

    fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    fn closed(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    fn max_envelope_bytes(&self) -> usize {
        self.max_envelope_bytes
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use veetr_core::{Command, LinkError};

    use super::*;

    #[derive(Default)]
    struct RecordingWriter {
        writes: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl LinkWriter for RecordingWriter {
        async fn write(&self, payload: &[u8]) -> Result<(), LinkError> {
            self.writes.lock().unwrap().push(payload.to_vec());
            Ok(())
        }

        async fn close(&self) -> Result<(), LinkError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_send_writes_one_message() {
        let writer = Arc::new(RecordingWriter::default());
        let channel = LinkChannel::new(writer.clone(), 512);

        channel
            .send_command(&Command::GetFirmwareVersion)
            .await
            .unwrap();
        let writes = writer.writes.lock().unwrap();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0], br#"{"cmd":"GET_FW_VERSION"}"#);
    }

    #[tokio::test]
    async fn test_oversize_rejected_before_write() {
        let writer = Arc::new(RecordingWriter::default());
        let channel = LinkChannel::new(writer.clone(), 16);

        let err = channel.send(vec![b'x'; 17]).await.unwrap_err();
        assert!(matches!(err, ChannelError::Codec(CodecError::Oversize { .. })));
        assert!(writer.writes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_close_wakes_watchers_and_fails_sends() {
        let channel = LinkChannel::new(Arc::new(RecordingWriter::default()), 512);
        let mut closed = channel.closed();
        assert!(!channel.is_closed());

        channel.close();
        closed.changed().await.unwrap();
        assert!(*closed.borrow());
        assert!(matches!(
            channel.send(b"{}".to_vec()).await,
            Err(ChannelError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_dispatch_reaches_subscribers() {
        let channel = LinkChannel::new(Arc::new(RecordingWriter::default()), 512);
        channel.dispatch(Notice::ChunkAck { index: 0 }); // nobody listening

        let mut rx = channel.subscribe();
        channel.dispatch(Notice::ChunkAck { index: 1 });
        assert_eq!(rx.recv().await.unwrap(), Notice::ChunkAck { index: 1 });
    }
}

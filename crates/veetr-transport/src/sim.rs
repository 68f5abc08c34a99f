//! In-process simulated remote unit.
//!
//! Speaks the unit side of the protocol over an in-memory link: acks
//! chunks, checks the written image on verify, drops the link on apply,
//! and answers version queries. Failures can be injected per chunk or per
//! write. Useful for development and tests; nothing touches a radio.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use veetr_core::{
    Command, DeviceAction, Link, LinkError, LinkWriter, Notice, Transport, config::DEFAULT_MAX_IMAGE_BYTES,
};

/// Something the simulated unit saw or did, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum SimEvent {
    /// A firmware command arrived.
    Received(Command),
    /// A control action arrived.
    Action(DeviceAction),
    /// The unit sent a notice.
    Sent(Notice),
}

#[derive(Debug, Default)]
struct UpdateState {
    size: usize,
    image: Vec<u8>,
    next_index: u32,
}

struct SimState {
    label: Option<String>,
    version: String,
    storage_bytes: u64,
    attach_failures: VecDeque<LinkError>,
    write_failures: u32,
    dropped_acks: HashMap<u32, u32>,
    rejected_chunks: HashMap<u32, u32>,
    stale_acks: bool,
    verify_failure: Option<String>,
    silent_verify: bool,
    attaches: usize,
    closes: usize,
    link_id: u64,
    notify: Option<mpsc::UnboundedSender<Vec<u8>>>,
    update: Option<UpdateState>,
    installed: Option<Vec<u8>>,
    events: Vec<SimEvent>,
}

impl SimState {
    fn send_notice(&mut self, notice: Notice) {
        if let Some(tx) = &self.notify {
            match serde_json::to_vec(&notice) {
                Ok(payload) => {
                    let _ = tx.send(payload);
                }
                Err(e) => tracing::error!("Failed to serialize notice: {e}"),
            }
        }
        self.events.push(SimEvent::Sent(notice));
    }

    fn handle(&mut self, command: Command) {
        self.events.push(SimEvent::Received(command.clone()));
        match command {
            Command::StartFirmwareUpdate { size } => {
                let size = size as usize;
                self.update = Some(UpdateState {
                    size,
                    ..UpdateState::default()
                });
                self.send_notice(Notice::MemoryInfo {
                    required: size as u64,
                    available: self.storage_bytes,
                    total: self.storage_bytes,
                    sufficient: size as u64 <= self.storage_bytes,
                });
            }
            Command::FirmwareChunk { index, .. } => self.handle_chunk(index, &command),
            Command::VerifyFirmware => self.handle_verify(),
            Command::ApplyFirmware => {
                if let Some(update) = self.update.take() {
                    self.installed = Some(update.image);
                }
                // reboot: the link goes away without a reply
                self.notify = None;
            }
            Command::GetFirmwareVersion => {
                let version = self.version.clone();
                self.send_notice(Notice::FirmwareVersion { version });
            }
        }
    }

    fn handle_chunk(&mut self, index: u32, chunk: &Command) {
        if take_one(&mut self.dropped_acks, index) {
            tracing::debug!(index, "Simulated unit swallowing ack");
            return;
        }
        if take_one(&mut self.rejected_chunks, index) {
            self.send_notice(Notice::ChunkError {
                index,
                error: Some("write failed".into()),
            });
            return;
        }

        let Some(update) = self.update.as_mut() else {
            self.send_notice(Notice::ChunkError {
                index,
                error: Some("no update in progress".into()),
            });
            return;
        };

        let Some(data) = chunk.decode_chunk() else {
            self.send_notice(Notice::ChunkError {
                index,
                error: Some("bad base64".into()),
            });
            return;
        };

        if index == update.next_index {
            update.image.extend_from_slice(&data);
            update.next_index += 1;
        } else if index > update.next_index {
            self.send_notice(Notice::ChunkError {
                index,
                error: Some("out of order".into()),
            });
            return;
        }
        // index < next_index: a retry of a chunk already written, ack again

        if self.stale_acks && index > 0 {
            self.send_notice(Notice::ChunkAck { index: index - 1 });
        }
        self.send_notice(Notice::ChunkAck { index });
    }

    fn handle_verify(&mut self) {
        if self.silent_verify {
            return;
        }
        let notice = if let Some(reason) = self.verify_failure.clone() {
            Notice::VerifyComplete {
                success: false,
                error: Some(reason),
            }
        } else {
            match &self.update {
                Some(u) if u.image.len() == u.size => Notice::VerifyComplete {
                    success: true,
                    error: None,
                },
                Some(u) => Notice::VerifyComplete {
                    success: false,
                    error: Some(format!("size mismatch: {} of {} bytes", u.image.len(), u.size)),
                },
                None => Notice::VerifyComplete {
                    success: false,
                    error: Some("no update in progress".into()),
                },
            }
        };
        self.send_notice(notice);
    }
}

fn take_one(counts: &mut HashMap<u32, u32>, index: u32) -> bool {
    match counts.get_mut(&index) {
        Some(n) if *n > 0 => {
            *n -= 1;
            true
        }
        _ => false,
    }
}

/// Simulated remote unit usable as a [`Transport`].
///
/// Clones share the same unit.
#[derive(Clone)]
pub struct SimulatedUnit {
    inner: Arc<Mutex<SimState>>,
}

impl Default for SimulatedUnit {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedUnit {
    /// Create a unit advertising as `Veetr`, running `v0.0.14`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(SimState {
                label: Some("Veetr".into()),
                version: "v0.0.14".into(),
                storage_bytes: DEFAULT_MAX_IMAGE_BYTES as u64,
                attach_failures: VecDeque::new(),
                write_failures: 0,
                dropped_acks: HashMap::new(),
                rejected_chunks: HashMap::new(),
                stale_acks: false,
                verify_failure: None,
                silent_verify: false,
                attaches: 0,
                closes: 0,
                link_id: 0,
                notify: None,
                update: None,
                installed: None,
                events: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set the advertised name.
    #[must_use]
    pub fn with_label(self, label: impl Into<String>) -> Self {
        self.lock().label = Some(label.into());
        self
    }

    /// Set the running firmware version.
    #[must_use]
    pub fn with_version(self, version: impl Into<String>) -> Self {
        self.lock().version = version.into();
        self
    }

    /// Set the update storage size reported in `memory_info`.
    #[must_use]
    pub fn with_storage(self, bytes: u64) -> Self {
        self.lock().storage_bytes = bytes;
        self
    }

    /// Make the next attach fail with `error`.
    pub fn fail_next_attach(&self, error: LinkError) {
        self.lock().attach_failures.push_back(error);
    }

    /// Make the next `count` writes fail.
    pub fn fail_writes(&self, count: u32) {
        self.lock().write_failures = count;
    }

    /// Swallow the ack for chunk `index` the next `times` it arrives.
    pub fn drop_acks(&self, index: u32, times: u32) {
        self.lock().dropped_acks.insert(index, times);
    }

    /// Answer chunk `index` with `chunk_error` the next `times` it arrives.
    pub fn reject_chunk(&self, index: u32, times: u32) {
        self.lock().rejected_chunks.insert(index, times);
    }

    /// Precede every ack with a stale ack for the previous chunk.
    pub fn send_stale_acks(&self, enabled: bool) {
        self.lock().stale_acks = enabled;
    }

    /// Fail verification with `reason`.
    pub fn fail_verify(&self, reason: impl Into<String>) {
        self.lock().verify_failure = Some(reason.into());
    }

    /// Never answer `VERIFY_FW`.
    pub fn ignore_verify(&self) {
        self.lock().silent_verify = true;
    }

    /// Send a telemetry frame on the active link.
    pub fn send_telemetry(&self, frame: &Value) {
        let state = self.lock();
        if let Some(tx) = &state.notify {
            let _ = tx.send(frame.to_string().into_bytes());
        }
    }

    /// Send a notice on the active link.
    pub fn send_notice(&self, notice: Notice) {
        self.lock().send_notice(notice);
    }

    /// Send raw bytes on the active link.
    pub fn send_raw(&self, payload: &[u8]) {
        let state = self.lock();
        if let Some(tx) = &state.notify {
            let _ = tx.send(payload.to_vec());
        }
    }

    /// Drop the active link as if the unit went out of range.
    pub fn drop_link(&self) {
        self.lock().notify = None;
    }

    /// Whether a link is currently attached.
    #[must_use]
    pub fn is_linked(&self) -> bool {
        self.lock().notify.is_some()
    }

    /// Number of successful attaches.
    #[must_use]
    pub fn attach_count(&self) -> usize {
        self.lock().attaches
    }

    /// Number of link teardowns requested by the controller.
    #[must_use]
    pub fn close_count(&self) -> usize {
        self.lock().closes
    }

    /// Everything the unit saw or sent, in order.
    #[must_use]
    pub fn events(&self) -> Vec<SimEvent> {
        self.lock().events.clone()
    }

    /// Firmware commands received, in order.
    #[must_use]
    pub fn received(&self) -> Vec<Command> {
        self.lock()
            .events
            .iter()
            .filter_map(|e| match e {
                SimEvent::Received(c) => Some(c.clone()),
                _ => None,
            })
            .collect()
    }

    /// Image installed by the last `APPLY_FW`.
    #[must_use]
    pub fn installed_image(&self) -> Option<Vec<u8>> {
        self.lock().installed.clone()
    }
}

#[async_trait]
impl Transport for SimulatedUnit {
    async fn attach(&self) -> Result<Link, LinkError> {
        let mut state = self.lock();
        if let Some(error) = state.attach_failures.pop_front() {
            return Err(error);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.link_id += 1;
        state.attaches += 1;
        state.notify = Some(tx);
        state.update = None;

        Ok(Link {
            label: state.label.clone(),
            writer: Arc::new(SimWriter {
                unit: self.clone(),
                link_id: state.link_id,
            }),
            inbound: UnboundedReceiverStream::new(rx).boxed(),
        })
    }
}

/// Write half of a simulated link.
struct SimWriter {
    unit: SimulatedUnit,
    link_id: u64,
}

#[async_trait]
impl LinkWriter for SimWriter {
    async fn write(&self, payload: &[u8]) -> Result<(), LinkError> {
        let mut state = self.unit.lock();
        if state.link_id != self.link_id || state.notify.is_none() {
            return Err(LinkError::Closed);
        }
        if state.write_failures > 0 {
            state.write_failures -= 1;
            return Err(LinkError::Write("injected write failure".into()));
        }

        if let Ok(command) = serde_json::from_slice::<Command>(payload) {
            state.handle(command);
        } else if let Ok(action) = serde_json::from_slice::<DeviceAction>(payload) {
            state.events.push(SimEvent::Action(action));
        } else {
            tracing::warn!("Simulated unit ignoring unknown payload");
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), LinkError> {
        let mut state = self.unit.lock();
        state.closes += 1;
        if state.link_id == self.link_id {
            state.notify = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use veetr_core::wire;

    use super::*;

    async fn next_notice(link: &mut Link) -> Notice {
        let payload = link.inbound.next().await.unwrap();
        match wire::decode(&payload).unwrap() {
            veetr_core::Envelope::Notice(n) => n,
            other => panic!("Expected notice, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_chunk_flow_and_verify() {
        let unit = SimulatedUnit::new();
        let mut link = unit.attach().await.unwrap();

        let start = serde_json::to_vec(&Command::StartFirmwareUpdate { size: 4 }).unwrap();
        link.writer.write(&start).await.unwrap();
        assert!(matches!(
            next_notice(&mut link).await,
            Notice::MemoryInfo {
                sufficient: true,
                ..
            }
        ));

        let chunk = serde_json::to_vec(&Command::chunk(0, b"abcd")).unwrap();
        link.writer.write(&chunk).await.unwrap();
        assert_eq!(next_notice(&mut link).await, Notice::ChunkAck { index: 0 });

        let verify = serde_json::to_vec(&Command::VerifyFirmware).unwrap();
        link.writer.write(&verify).await.unwrap();
        assert_eq!(
            next_notice(&mut link).await,
            Notice::VerifyComplete {
                success: true,
                error: None
            }
        );

        let apply = serde_json::to_vec(&Command::ApplyFirmware).unwrap();
        link.writer.write(&apply).await.unwrap();
        assert!(link.inbound.next().await.is_none());
        assert_eq!(unit.installed_image().unwrap(), b"abcd");
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let unit = SimulatedUnit::new();
        unit.fail_next_attach(LinkError::DeviceNotFound("none".into()));
        assert!(matches!(
            unit.attach().await,
            Err(LinkError::DeviceNotFound(_))
        ));

        let link = unit.attach().await.unwrap();
        unit.fail_writes(1);
        let version = serde_json::to_vec(&Command::GetFirmwareVersion).unwrap();
        assert!(matches!(
            link.writer.write(&version).await,
            Err(LinkError::Write(_))
        ));
        tokio_test::assert_ok!(link.writer.write(&version).await);
    }

    #[tokio::test]
    async fn test_old_link_writes_fail_after_reattach() {
        let unit = SimulatedUnit::new();
        let old = unit.attach().await.unwrap();
        let _new = unit.attach().await.unwrap();

        let version = serde_json::to_vec(&Command::GetFirmwareVersion).unwrap();
        assert!(matches!(
            old.writer.write(&version).await,
            Err(LinkError::Closed)
        ));
        assert_eq!(unit.attach_count(), 2);
    }
}

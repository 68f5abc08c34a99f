//! Connection session to one remote unit.
//!
//! Owns the attach/teardown lifecycle, routes inbound envelopes (telemetry
//! to the [`TelemetryStore`], notices to the [`LinkChannel`]), and hands
//! the channel to at most one firmware transfer at a time.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use futures::StreamExt;
use serde::Serialize;
use tokio::{
    sync::{RwLock, broadcast},
    task::JoinHandle,
};
use veetr_core::{
    ChannelError, Command, CommandChannel, DeviceAction, Envelope, ErrorKind, Inbound, LinkConfig,
    LinkError, Notice, SessionStatus, SignalQuality, Telemetry, TelemetryFrame, TelemetryStore,
    Transport,
    telemetry::now_millis,
    wire::{self, CodecError},
};

use crate::channel::LinkChannel;

/// Longest device name the unit accepts.
pub const MAX_DEVICE_NAME_LEN: usize = 20;

const EVENT_CAPACITY: usize = 64;

/// Session error.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Connect failed: {0}")]
    Connect(#[from] LinkError),
    #[error("Not connected")]
    NotConnected,
    #[error("A firmware transfer is already in progress")]
    TransferInProgress,
    #[error("{0} is only sent by a firmware transfer")]
    ReservedCommand(&'static str),
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("Invalid device name: {0}")]
    InvalidDeviceName(String),
}

/// Why a session left `Connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    /// `disconnect()` or a new `connect()` tore the link down.
    Requested,
    /// The transport reported the link gone.
    LinkLost,
}

/// Session lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    StatusChanged { status: SessionStatus },
    Connected { label: Option<String> },
    Disconnected { reason: DisconnectReason },
    FirmwareVersion { version: String },
}

/// Point-in-time view of the session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub status: SessionStatus,
    pub last_error: Option<ErrorKind>,
    pub signal_level: Option<i16>,
    pub signal_quality: SignalQuality,
    pub device_label: Option<String>,
    /// Arrival of the last telemetry frame (Unix epoch milliseconds).
    pub last_message_at: Option<i64>,
    pub firmware_version: Option<String>,
    pub has_channel: bool,
    pub transfer_active: bool,
}

struct ActiveLink {
    channel: Arc<LinkChannel>,
    pump: Option<JoinHandle<()>>,
    transfer_busy: Arc<AtomicBool>,
}

#[derive(Default)]
struct State {
    status: SessionStatus,
    last_error: Option<ErrorKind>,
    signal_level: Option<i16>,
    device_label: Option<String>,
    last_message_at: Option<i64>,
    firmware_version: Option<String>,
    link: Option<ActiveLink>,
    /// Bumped by every connect and teardown; stale attaches and pumps
    /// compare against it.
    generation: u64,
}

impl State {
    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            status: self.status,
            last_error: self.last_error,
            signal_level: self.signal_level,
            signal_quality: self
                .signal_level
                .map_or(SignalQuality::Unknown, SignalQuality::from_rssi),
            device_label: self.device_label.clone(),
            last_message_at: self.last_message_at,
            firmware_version: self.firmware_version.clone(),
            has_channel: self.link.is_some(),
            transfer_active: self
                .link
                .as_ref()
                .is_some_and(|l| l.transfer_busy.load(Ordering::Acquire)),
        }
    }

    /// The connected link, unless a transfer holds it.
    fn idle_link(&self) -> Result<&ActiveLink, SessionError> {
        let link = self
            .link
            .as_ref()
            .filter(|_| self.status == SessionStatus::Connected)
            .ok_or(SessionError::NotConnected)?;
        if link.transfer_busy.load(Ordering::Acquire) {
            return Err(SessionError::TransferInProgress);
        }
        Ok(link)
    }

    /// Clear per-link state and hand back the link for teardown.
    fn reset(&mut self) -> Option<ActiveLink> {
        self.status = SessionStatus::Disconnected;
        self.signal_level = None;
        self.device_label = None;
        self.last_message_at = None;
        self.firmware_version = None;
        self.generation += 1;
        self.link.take()
    }
}

struct Shared {
    state: RwLock<State>,
    events: broadcast::Sender<SessionEvent>,
    telemetry: Arc<TelemetryStore>,
}

impl Shared {
    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Close the channel, stop the pump and release the transport handle.
    async fn teardown(&self, link: ActiveLink) {
        link.channel.close();
        if let Some(pump) = link.pump {
            pump.abort();
        }
        if let Err(e) = link.channel.writer().close().await {
            tracing::warn!("Link teardown failed: {e}");
        }
        self.telemetry.clear();
    }

    /// Leave `Connected` and announce it. Shared by disconnect and link loss.
    async fn finish(&self, link: Option<ActiveLink>, was: SessionStatus, reason: DisconnectReason) {
        if let Some(link) = link {
            self.teardown(link).await;
        }
        if was != SessionStatus::Disconnected {
            tracing::info!(?reason, "Session disconnected");
            self.emit(SessionEvent::Disconnected { reason });
            self.emit(SessionEvent::StatusChanged {
                status: SessionStatus::Disconnected,
            });
        }
    }

    async fn link_lost(&self, generation: u64) {
        let (link, was) = {
            let mut state = self.state.write().await;
            if state.generation != generation {
                return; // already torn down
            }
            let was = state.status;
            (state.reset(), was)
        };
        tracing::warn!("Link lost");
        // the pump is the caller; dropping its handle detaches it
        let link = link.map(|mut l| {
            l.pump = None;
            l
        });
        self.finish(link, was, DisconnectReason::LinkLost).await;
    }

    async fn on_telemetry(&self, generation: u64, telemetry: Telemetry) {
        let frame = TelemetryFrame {
            received_at: now_millis(),
            telemetry,
        };
        {
            let mut state = self.state.write().await;
            if state.generation != generation || state.status != SessionStatus::Connected {
                return;
            }
            state.last_message_at = Some(frame.received_at);
            if let Some(rssi) = frame.telemetry.rssi() {
                state.signal_level = Some(rssi);
            }
        }
        self.telemetry.push(frame);
    }

    async fn on_version(&self, generation: u64, version: &str) {
        {
            let mut state = self.state.write().await;
            if state.generation != generation {
                return;
            }
            state.firmware_version = Some(version.to_owned());
        }
        tracing::info!(version, "Unit firmware version");
        self.emit(SessionEvent::FirmwareVersion {
            version: version.to_owned(),
        });
    }
}

/// Route inbound payloads until the link ends.
async fn pump(shared: Arc<Shared>, channel: Arc<LinkChannel>, mut inbound: Inbound, generation: u64) {
    while let Some(payload) = inbound.next().await {
        match wire::decode(&payload) {
            Ok(Envelope::Telemetry(telemetry)) => shared.on_telemetry(generation, telemetry).await,
            Ok(Envelope::Notice(notice)) => {
                if let Notice::FirmwareVersion { version } = &notice {
                    shared.on_version(generation, version).await;
                }
                tracing::trace!(kind = ?notice.kind(), index = ?notice.index(), "Notice");
                channel.dispatch(notice);
            }
            Ok(Envelope::Unknown { kind }) => tracing::debug!(kind, "Ignoring unknown envelope"),
            Err(e) => tracing::warn!("Dropping malformed envelope: {e}"),
        }
    }
    shared.link_lost(generation).await;
}

/// Exclusive claim on the session's channel for one firmware transfer.
///
/// Released on drop. The channel it hands out is closed when the session
/// tears the link down, so a lease outliving its link is inert.
pub struct TransferLease {
    channel: Arc<LinkChannel>,
    busy: Arc<AtomicBool>,
}

impl TransferLease {
    #[must_use]
    pub fn channel(&self) -> Arc<dyn CommandChannel> {
        Arc::clone(&self.channel) as Arc<dyn CommandChannel>
    }
}

impl Drop for TransferLease {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

/// Connection session to one remote unit.
pub struct Session<T: Transport> {
    transport: T,
    config: LinkConfig,
    shared: Arc<Shared>,
}

impl<T: Transport> Session<T> {
    #[must_use]
    pub fn new(transport: T, config: LinkConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let telemetry = Arc::new(TelemetryStore::new(config.telemetry_history));
        Self {
            transport,
            config,
            shared: Arc::new(Shared {
                state: RwLock::new(State::default()),
                events,
                telemetry,
            }),
        }
    }

    /// The underlying transport.
    #[must_use]
    pub const fn transport(&self) -> &T {
        &self.transport
    }

    /// Attach to a unit.
    ///
    /// Any existing link is torn down first. On failure the session is left
    /// `Disconnected` with `last_error` recording the cause.
    ///
    /// # Errors
    /// Returns error if the transport cannot attach, or a `disconnect()`
    /// superseded this attempt ([`LinkError::Cancelled`]).
    pub async fn connect(&self) -> Result<(), SessionError> {
        let (generation, stale, was) = {
            let mut state = self.shared.state.write().await;
            let was = state.status;
            let stale = state.reset();
            state.status = SessionStatus::Connecting;
            state.last_error = None;
            (state.generation, stale, was)
        };
        if stale.is_some() {
            tracing::info!("Replacing existing link");
            self.shared
                .finish(stale, was, DisconnectReason::Requested)
                .await;
        }
        self.shared.emit(SessionEvent::StatusChanged {
            status: SessionStatus::Connecting,
        });

        let attached = self.transport.attach().await;

        let mut state = self.shared.state.write().await;
        if state.generation != generation {
            drop(state);
            tracing::info!("Connect superseded");
            if let Ok(link) = attached {
                if let Err(e) = link.writer.close().await {
                    tracing::warn!("Failed to release superseded link: {e}");
                }
            }
            return Err(LinkError::Cancelled.into());
        }

        match attached {
            Err(e) => {
                state.status = SessionStatus::Disconnected;
                state.last_error = Some(e.kind());
                drop(state);
                tracing::warn!("Connect failed: {e}");
                self.shared.emit(SessionEvent::StatusChanged {
                    status: SessionStatus::Disconnected,
                });
                Err(e.into())
            }
            Ok(link) => {
                let channel = Arc::new(LinkChannel::new(
                    link.writer,
                    self.config.max_envelope_bytes,
                ));
                self.shared.telemetry.clear();
                let pump = tokio::spawn(pump(
                    Arc::clone(&self.shared),
                    Arc::clone(&channel),
                    link.inbound,
                    generation,
                ));
                state.status = SessionStatus::Connected;
                state.device_label.clone_from(&link.label);
                state.link = Some(ActiveLink {
                    channel,
                    pump: Some(pump),
                    transfer_busy: Arc::new(AtomicBool::new(false)),
                });
                drop(state);

                tracing::info!(label = ?link.label, "Session connected");
                self.shared
                    .emit(SessionEvent::Connected { label: link.label });
                self.shared.emit(SessionEvent::StatusChanged {
                    status: SessionStatus::Connected,
                });
                Ok(())
            }
        }
    }

    /// Tear the link down and clear per-link state.
    ///
    /// Never fails: teardown errors are logged. A transfer using the
    /// channel fails with a session-closed error.
    pub async fn disconnect(&self) {
        let (link, was) = {
            let mut state = self.shared.state.write().await;
            let was = state.status;
            (state.reset(), was)
        };
        self.shared
            .finish(link, was, DisconnectReason::Requested)
            .await;
    }

    /// Current state.
    pub async fn snapshot(&self) -> SessionSnapshot {
        self.shared.state.read().await.snapshot()
    }

    pub async fn status(&self) -> SessionStatus {
        self.shared.state.read().await.status
    }

    /// Lifecycle events from now on.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// Telemetry frames received on the current link.
    #[must_use]
    pub fn telemetry(&self) -> Arc<TelemetryStore> {
        Arc::clone(&self.shared.telemetry)
    }

    /// The live channel, for callers that query the unit directly.
    ///
    /// # Errors
    /// Returns error if not connected or a transfer holds the channel.
    pub async fn channel(&self) -> Result<Arc<dyn CommandChannel>, SessionError> {
        let state = self.shared.state.read().await;
        let link = state.idle_link()?;
        Ok(Arc::clone(&link.channel) as Arc<dyn CommandChannel>)
    }

    /// Claim the channel for a firmware transfer.
    ///
    /// # Errors
    /// Returns error if not connected or a transfer already holds the lease.
    pub async fn begin_transfer(&self) -> Result<TransferLease, SessionError> {
        // exclusive so no direct send is mid-flight when the lease is taken
        let state = self.shared.state.write().await;
        let link = state
            .link
            .as_ref()
            .filter(|_| state.status == SessionStatus::Connected)
            .ok_or(SessionError::NotConnected)?;
        if link
            .transfer_busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SessionError::TransferInProgress);
        }
        Ok(TransferLease {
            channel: Arc::clone(&link.channel),
            busy: Arc::clone(&link.transfer_busy),
        })
    }

    /// Send a firmware command outside a transfer (e.g. a version query).
    ///
    /// Commands that belong to the transfer protocol are refused; they are
    /// only sent by the transfer holding the lease.
    ///
    /// # Errors
    /// Returns error if the command is reserved, not connected, a transfer
    /// is running, or the write fails.
    pub async fn send_command(&self, command: &Command) -> Result<(), SessionError> {
        if !matches!(command, Command::GetFirmwareVersion) {
            return Err(SessionError::ReservedCommand(command.name()));
        }
        let state = self.shared.state.read().await;
        state.idle_link()?.channel.send_command(command).await?;
        Ok(())
    }

    /// Send a control action to the unit.
    ///
    /// # Errors
    /// Returns error if not connected, a transfer is running, a device name
    /// is invalid, or the write fails.
    pub async fn send_action(&self, action: &DeviceAction) -> Result<(), SessionError> {
        if let DeviceAction::SetDeviceName { device_name } = action {
            validate_device_name(device_name)?;
        }
        let state = self.shared.state.read().await;
        let channel = &state.idle_link()?.channel;
        let payload = wire::encode(action, channel.max_envelope_bytes())?;
        tracing::debug!(?action, "Sending action");
        channel.send(payload).await?;
        Ok(())
    }

    /// Rename the unit. It restarts to apply the name, dropping the link.
    ///
    /// # Errors
    /// Returns error if the name is invalid or the write fails.
    pub async fn set_device_name(&self, name: &str) -> Result<(), SessionError> {
        let device_name = validate_device_name(name)?;
        self.send_action(&DeviceAction::SetDeviceName { device_name })
            .await
    }
}

/// Check a device name against the unit's rules and return it trimmed.
///
/// # Errors
/// Returns error if the trimmed name is empty, longer than
/// [`MAX_DEVICE_NAME_LEN`], or has characters other than ASCII letters,
/// digits, `_`, `-` and space.
pub fn validate_device_name(name: &str) -> Result<String, SessionError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(SessionError::InvalidDeviceName("name is empty".into()));
    }
    if name.len() > MAX_DEVICE_NAME_LEN {
        return Err(SessionError::InvalidDeviceName(format!(
            "name is longer than {MAX_DEVICE_NAME_LEN} characters"
        )));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | ' ')))
    {
        return Err(SessionError::InvalidDeviceName(format!(
            "character {c:?} is not allowed"
        )));
    }
    Ok(name.to_owned())
}

//! Wire codec for controller <-> remote unit envelopes.
//!
//! Every message is one JSON object. Commands the controller sends are
//! tagged on `cmd`, control actions on `action`, and replies from the unit
//! on `type`. Objects without a `type` are telemetry frames.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Largest encoded envelope the transport accepts in a single write.
pub const MAX_ENVELOPE_BYTES: usize = 512;

/// Raw firmware bytes carried by one `FW_CHUNK` envelope.
pub const DEFAULT_CHUNK_SIZE: usize = 200;

/// Codec error.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Envelope too large: {len} bytes (max {max})")]
    Oversize { len: usize, max: usize },
    #[error("Envelope is not a JSON object")]
    NotAnObject,
}

/// Firmware command from controller to remote unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum Command {
    /// Ask the unit to prepare update storage for `size` bytes.
    #[serde(rename = "START_FW_UPDATE")]
    StartFirmwareUpdate { size: u32 },
    /// One slice of the image (base64 encoded).
    #[serde(rename = "FW_CHUNK")]
    FirmwareChunk { index: u32, data: String },
    /// Check the written image.
    #[serde(rename = "VERIFY_FW")]
    VerifyFirmware,
    /// Boot into the new image. The link drops right after.
    #[serde(rename = "APPLY_FW")]
    ApplyFirmware,
    /// Ask for the running firmware version.
    #[serde(rename = "GET_FW_VERSION")]
    GetFirmwareVersion,
}

impl Command {
    /// Create a chunk command from raw image bytes.
    #[must_use]
    pub fn chunk(index: u32, data: &[u8]) -> Self {
        Self::FirmwareChunk {
            index,
            data: BASE64.encode(data),
        }
    }

    /// Decode chunk data from base64.
    #[must_use]
    pub fn decode_chunk(&self) -> Option<Vec<u8>> {
        if let Self::FirmwareChunk { data, .. } = self {
            BASE64.decode(data).ok()
        } else {
            None
        }
    }

    /// Wire name of the command.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::StartFirmwareUpdate { .. } => "START_FW_UPDATE",
            Self::FirmwareChunk { .. } => "FW_CHUNK",
            Self::VerifyFirmware => "VERIFY_FW",
            Self::ApplyFirmware => "APPLY_FW",
            Self::GetFirmwareVersion => "GET_FW_VERSION",
        }
    }
}

/// Control action for the unit's sensors and settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum DeviceAction {
    /// Zero the heel angle at the current attitude.
    ResetHeelAngle,
    /// Take the current heading as north.
    ResetCompassNorth,
    /// Mark the port end of the start line.
    RegattaSetPort,
    /// Mark the starboard end of the start line.
    RegattaSetStarboard,
    /// Rename the unit. It restarts to apply the new name.
    SetDeviceName {
        #[serde(rename = "deviceName")]
        device_name: String,
    },
}

/// Reply or status notice from the remote unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notice {
    /// Chunk `index` was written.
    ChunkAck { index: u32 },
    /// Chunk `index` was rejected.
    ChunkError {
        index: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Result of `VERIFY_FW`.
    VerifyComplete {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Reply to `GET_FW_VERSION`.
    FirmwareVersion { version: String },
    /// Storage precheck sent after `START_FW_UPDATE`.
    MemoryInfo {
        required: u64,
        available: u64,
        total: u64,
        sufficient: bool,
    },
}

impl Notice {
    const KINDS: [&'static str; 5] = [
        "chunk_ack",
        "chunk_error",
        "verify_complete",
        "firmware_version",
        "memory_info",
    ];

    /// Discriminator of this notice.
    #[must_use]
    pub const fn kind(&self) -> EnvelopeKind {
        match self {
            Self::ChunkAck { .. } => EnvelopeKind::ChunkAck,
            Self::ChunkError { .. } => EnvelopeKind::ChunkError,
            Self::VerifyComplete { .. } => EnvelopeKind::VerifyComplete,
            Self::FirmwareVersion { .. } => EnvelopeKind::FirmwareVersion,
            Self::MemoryInfo { .. } => EnvelopeKind::MemoryInfo,
        }
    }

    /// Chunk index carried by the notice, if any.
    #[must_use]
    pub const fn index(&self) -> Option<u32> {
        match self {
            Self::ChunkAck { index } | Self::ChunkError { index, .. } => Some(*index),
            _ => None,
        }
    }
}

/// Telemetry frame: an untyped JSON object streamed by the unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Telemetry {
    fields: Map<String, Value>,
}

impl Telemetry {
    /// Wrap a JSON object.
    #[must_use]
    pub const fn new(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    /// Link signal strength reported by the unit (dBm).
    #[must_use]
    pub fn rssi(&self) -> Option<i16> {
        self.fields
            .get("rssi")
            .and_then(Value::as_i64)
            .and_then(|v| i16::try_from(v).ok())
    }

    /// Get a raw field.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// All fields.
    #[must_use]
    pub const fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }
}

/// Envelope discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    Telemetry,
    ChunkAck,
    ChunkError,
    VerifyComplete,
    FirmwareVersion,
    MemoryInfo,
    Unknown,
}

/// Decoded inbound envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Notice(Notice),
    Telemetry(Telemetry),
    /// A `type` this controller does not understand.
    Unknown { kind: String },
}

impl Envelope {
    /// Discriminator used for routing.
    #[must_use]
    pub const fn kind(&self) -> EnvelopeKind {
        match self {
            Self::Notice(notice) => notice.kind(),
            Self::Telemetry(_) => EnvelopeKind::Telemetry,
            Self::Unknown { .. } => EnvelopeKind::Unknown,
        }
    }
}

/// Serialize an outbound message, enforcing the transport's size limit.
///
/// # Errors
/// Returns error if serialization fails or the result exceeds `max_bytes`.
pub fn encode<T: Serialize + ?Sized>(msg: &T, max_bytes: usize) -> Result<Vec<u8>, CodecError> {
    let bytes = serde_json::to_vec(msg)?;
    if bytes.len() > max_bytes {
        return Err(CodecError::Oversize {
            len: bytes.len(),
            max: max_bytes,
        });
    }
    Ok(bytes)
}

/// Parse an inbound payload.
///
/// # Errors
/// Returns error if the payload is not a JSON object, or carries a known
/// `type` with malformed fields.
pub fn decode(payload: &[u8]) -> Result<Envelope, CodecError> {
    let Value::Object(fields) = serde_json::from_slice(payload)? else {
        return Err(CodecError::NotAnObject);
    };

    let Some(kind) = fields.get("type").and_then(Value::as_str).map(str::to_owned) else {
        return Ok(Envelope::Telemetry(Telemetry::new(fields)));
    };

    if Notice::KINDS.contains(&kind.as_str()) {
        Ok(Envelope::Notice(Notice::deserialize(Value::Object(fields))?))
    } else {
        Ok(Envelope::Unknown { kind })
    }
}

/// Encoded size of the largest possible `FW_CHUNK` envelope for `chunk_size`
/// raw bytes.
#[must_use]
pub fn encoded_chunk_len(chunk_size: usize) -> usize {
    let worst = Command::chunk(u32::MAX, &vec![0xff; chunk_size]);
    serde_json::to_vec(&worst).map_or(usize::MAX, |v| v.len())
}

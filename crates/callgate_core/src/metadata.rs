use bytes::Bytes;
use tokio::time::Instant;
use tonic::metadata::{
    AsciiMetadataKey, AsciiMetadataValue, BinaryMetadataKey, BinaryMetadataValue, MetadataMap,
};
use tonic::{Code, Status};

use crate::error::CallError;

/// Header carrying the compression algorithm applied to messages.
pub const ENCODING_KEY: &str = "grpc-encoding";

/// Header listing the compression algorithms a peer accepts.
pub const ACCEPT_ENCODING_KEY: &str = "grpc-accept-encoding";

/// One raw metadata entry as handed over by the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataEntry {
    pub key: String,
    pub value: Bytes,
}

impl MetadataEntry {
    pub fn new(key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Validate an application metadata array and convert it to a map.
///
/// Keys must be lowercase header names; `-bin` keys carry arbitrary bytes,
/// every other key must carry a printable ASCII value.
pub fn validate_metadata(
    entries: &[MetadataEntry],
    max_entries: usize,
) -> Result<MetadataMap, CallError> {
    if entries.len() > max_entries {
        return Err(CallError::InvalidMetadata);
    }

    let mut map = MetadataMap::with_capacity(entries.len());
    for entry in entries {
        if entry.key.ends_with("-bin") {
            let key = BinaryMetadataKey::from_bytes(entry.key.as_bytes())
                .map_err(|_| CallError::InvalidMetadata)?;
            map.append_bin(key, BinaryMetadataValue::from_bytes(&entry.value));
        } else {
            let key = AsciiMetadataKey::from_bytes(entry.key.as_bytes())
                .map_err(|_| CallError::InvalidMetadata)?;
            let value = std::str::from_utf8(&entry.value)
                .ok()
                .and_then(|v| v.parse::<AsciiMetadataValue>().ok())
                .ok_or(CallError::InvalidMetadata)?;
            map.append(key, value);
        }
    }
    Ok(map)
}

/// Read an ASCII metadata value as a string.
pub fn metadata_str<'a>(map: &'a MetadataMap, key: &str) -> Option<&'a str> {
    map.get(key).and_then(|v| v.to_str().ok())
}

/// A message flowing in either direction of a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub payload: Bytes,
    pub flags: u32,
}

impl Message {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            flags: 0,
        }
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }
}

/// Initial metadata sent by the client when a call starts.
#[derive(Debug, Clone)]
pub struct ClientMetadata {
    /// Method path, e.g. `/echo.Echo/Say`.
    pub path: String,
    pub authority: Option<String>,
    pub deadline: Option<Instant>,
    /// Flags from the send-initial-metadata operation.
    pub flags: u32,
    pub entries: MetadataMap,
}

impl ClientMetadata {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            authority: None,
            deadline: None,
            flags: 0,
            entries: MetadataMap::new(),
        }
    }
}

/// Trailing metadata: the terminal status of a call.
///
/// Every user-visible end of a call is expressed as one of these, including
/// local cancellation and transport failures.
#[derive(Debug, Clone)]
pub struct TrailingMetadata {
    pub code: Code,
    pub message: String,
    pub entries: MetadataMap,
    /// True when the call ended by cancellation rather than a sent status.
    pub was_cancelled: bool,
}

impl TrailingMetadata {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            entries: MetadataMap::new(),
            was_cancelled: false,
        }
    }

    pub fn ok() -> Self {
        Self::new(Code::Ok, "")
    }

    /// Synthesize trailing metadata from a lower-level failure.
    pub fn from_status(status: &Status) -> Self {
        Self {
            code: status.code(),
            message: status.message().to_string(),
            entries: status.metadata().clone(),
            was_cancelled: false,
        }
    }

    /// Trailing metadata recording a cancellation.
    pub fn cancelled(status: &Status) -> Self {
        Self {
            was_cancelled: true,
            ..Self::from_status(status)
        }
    }

    pub fn with_entries(mut self, entries: MetadataMap) -> Self {
        self.entries = entries;
        self
    }

    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }

    pub fn to_status(&self) -> Status {
        Status::with_metadata(self.code, self.message.clone(), self.entries.clone())
    }
}

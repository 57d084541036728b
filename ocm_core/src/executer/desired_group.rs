//! Command message carrying the name of the group an external controller
//! wants active.
//!
//! Wire layout matches the embedded IPC framing the controller side
//! speaks: an 8-byte big-endian type fingerprint, then the string as a
//! 4-byte big-endian length (including the NUL) followed by the bytes and
//! a terminating NUL.

use crate::error::{OcmError, OcmResult};
use crate::ipc::TopicMessage;

// Layout fingerprint: stable across processes, derived from the message
// definition, independent of the payload.
const BASE_HASH: u64 = 0xe21c_68d2_e41b_458d;
const TYPE_HASH: u64 = (BASE_HASH << 1).wrapping_add((BASE_HASH >> 63) & 1);

/// The group an external controller asks the orchestrator to activate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredGroupData {
    pub desired_group: String,
}

impl DesiredGroupData {
    pub fn new(desired_group: impl Into<String>) -> Self {
        Self {
            desired_group: desired_group.into(),
        }
    }
}

impl TopicMessage for DesiredGroupData {
    fn encode(&self) -> Vec<u8> {
        let name = self.desired_group.as_bytes();
        let mut bytes = Vec::with_capacity(8 + 4 + name.len() + 1);
        bytes.extend(TYPE_HASH.to_be_bytes());
        bytes.extend(((name.len() + 1) as u32).to_be_bytes());
        bytes.extend(name);
        bytes.push(0);
        bytes
    }

    fn decode(bytes: &[u8]) -> OcmResult<Self> {
        if bytes.len() < 13 {
            return Err(OcmError::Serialization(format!(
                "desired-group frame too short: {} bytes",
                bytes.len()
            )));
        }
        let hash = u64::from_be_bytes(bytes[0..8].try_into().expect("sized slice"));
        if hash != TYPE_HASH {
            return Err(OcmError::Serialization(format!(
                "desired-group type hash mismatch: {hash:#018x}"
            )));
        }
        let len = u32::from_be_bytes(bytes[8..12].try_into().expect("sized slice")) as usize;
        if len == 0 || bytes.len() < 12 + len {
            return Err(OcmError::Serialization(format!(
                "desired-group length {len} exceeds frame of {} bytes",
                bytes.len()
            )));
        }
        // len counts the trailing NUL.
        let name = std::str::from_utf8(&bytes[12..12 + len - 1])
            .map_err(|err| OcmError::Serialization(format!("desired-group not UTF-8: {err}")))?;
        Ok(Self::new(name))
    }
}

//! Device info record codec.
//!
//! The info endpoint serves a small CBOR map describing what the device has
//! already been provisioned with:
//!
//! ```text
//! {
//!   "flags": uint,             bit 0: device certificate provisioned
//!   "server_cert_snr": bytes,  serial of the server certificate it holds
//! }
//! ```
//!
//! Unknown keys are ignored; both keys are optional.

use bitflags::bitflags;
use bytes::Bytes;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

/// Size of the buffer the info record is read into
pub const INFO_MAX_LEN: usize = 64;

const KEY_FLAGS: &str = "flags";
const KEY_SERVER_CERT_SNR: &str = "server_cert_snr";

bitflags! {
    /// Provisioning flags reported by the device
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct InfoFlags: u32 {
        /// The device holds a certificate the cloud already knows
        const DEVICE_CERT_PROVISIONED = 1 << 0;
    }
}

/// Decoded info record
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceInfo {
    /// Provisioning flags
    pub flags: InfoFlags,
    /// Serial number of the server certificate stored on the device
    pub server_cert_serial: Option<Bytes>,
}

impl DeviceInfo {
    /// Whether the device reports its own certificate as provisioned
    pub fn device_cert_provisioned(&self) -> bool {
        self.flags.contains(InfoFlags::DEVICE_CERT_PROVISIONED)
    }

    /// Whether the device holds the server certificate with `serial`
    pub fn has_server_cert(&self, serial: &[u8]) -> bool {
        self.server_cert_serial.as_deref() == Some(serial)
    }

    /// Encode as CBOR
    pub fn encode(&self) -> Result<Bytes, InfoError> {
        let mut entries = vec![(
            ciborium::Value::Text(KEY_FLAGS.to_string()),
            ciborium::Value::Integer(self.flags.bits().into()),
        )];
        if let Some(serial) = &self.server_cert_serial {
            entries.push((
                ciborium::Value::Text(KEY_SERVER_CERT_SNR.to_string()),
                ciborium::Value::Bytes(serial.to_vec()),
            ));
        }

        let mut buf = Vec::new();
        ciborium::into_writer(&ciborium::Value::Map(entries), &mut buf)
            .map_err(|_| InfoError::Encode)?;
        Ok(Bytes::from(buf))
    }
}

/// Info record errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InfoError {
    /// Not valid CBOR, or not a map
    #[error("info decoding failed")]
    Decode,
    /// A known key carries the wrong type
    #[error("invalid value for {0}")]
    Value(&'static str),
    /// Encoding failed
    #[error("info encoding failed")]
    Encode,
}

/// Decode an info record
pub fn decode_info(raw: &[u8]) -> Result<DeviceInfo, InfoError> {
    let map = parse_map(raw)?;
    let mut info = DeviceInfo::default();

    if let Some(value) = map.get(KEY_FLAGS) {
        let bits = match value {
            ciborium::Value::Integer(i) => {
                u32::try_from(*i).map_err(|_| InfoError::Value(KEY_FLAGS))?
            }
            _ => return Err(InfoError::Value(KEY_FLAGS)),
        };
        info.flags = InfoFlags::from_bits_truncate(bits);
        if info.flags.bits() != bits {
            debug!("Ignoring unknown info flags {:#x}", bits & !InfoFlags::all().bits());
        }
    }

    if let Some(value) = map.get(KEY_SERVER_CERT_SNR) {
        match value {
            ciborium::Value::Bytes(b) => info.server_cert_serial = Some(Bytes::copy_from_slice(b)),
            _ => return Err(InfoError::Value(KEY_SERVER_CERT_SNR)),
        }
    }

    Ok(info)
}

fn parse_map(raw: &[u8]) -> Result<BTreeMap<String, ciborium::Value>, InfoError> {
    let value: ciborium::Value = ciborium::from_reader(raw).map_err(|e| {
        debug!("Info record of {} bytes is not valid CBOR: {}", raw.len(), e);
        InfoError::Decode
    })?;

    let ciborium::Value::Map(map) = value else {
        debug!("Info record is not a CBOR map");
        return Err(InfoError::Decode);
    };

    Ok(map
        .into_iter()
        .filter_map(|(k, v)| match k {
            ciborium::Value::Text(key) => Some((key, v)),
            _ => None,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_roundtrip() {
        let info = DeviceInfo {
            flags: InfoFlags::DEVICE_CERT_PROVISIONED,
            server_cert_serial: Some(Bytes::from_static(&[0x01, 0x9a, 0x33])),
        };
        let raw = info.encode().unwrap();
        assert!(raw.len() <= INFO_MAX_LEN);

        let decoded = decode_info(&raw).unwrap();
        assert!(decoded.device_cert_provisioned());
        assert!(decoded.has_server_cert(&[0x01, 0x9a, 0x33]));
        assert!(!decoded.has_server_cert(&[0x01]));
    }

    #[test]
    fn test_missing_keys_default() {
        let mut raw = Vec::new();
        ciborium::into_writer(&ciborium::Value::Map(vec![]), &mut raw).unwrap();

        let info = decode_info(&raw).unwrap();
        assert_eq!(info, DeviceInfo::default());
        assert!(!info.has_server_cert(&[]));
    }

    #[test]
    fn test_garbage_rejected() {
        assert_eq!(decode_info(&[0xff, 0x00]), Err(InfoError::Decode));
        assert_eq!(decode_info(&[]), Err(InfoError::Decode));

        let mut raw = Vec::new();
        ciborium::into_writer(&ciborium::Value::Integer(3.into()), &mut raw).unwrap();
        assert_eq!(decode_info(&raw), Err(InfoError::Decode));
    }

    #[test]
    fn test_unknown_flags_ignored() {
        let mut raw = Vec::new();
        let value = ciborium::Value::Map(vec![(
            ciborium::Value::Text("flags".into()),
            ciborium::Value::Integer(0x81.into()),
        )]);
        ciborium::into_writer(&value, &mut raw).unwrap();

        let info = decode_info(&raw).unwrap();
        assert_eq!(info.flags, InfoFlags::DEVICE_CERT_PROVISIONED);
        assert!(info.server_cert_serial.is_none());
    }

    #[test]
    fn test_wrong_type_rejected() {
        let mut raw = Vec::new();
        let value = ciborium::Value::Map(vec![(
            ciborium::Value::Text("flags".into()),
            ciborium::Value::Text("yes".into()),
        )]);
        ciborium::into_writer(&value, &mut raw).unwrap();
        assert_eq!(decode_info(&raw), Err(InfoError::Value("flags")));
    }
}

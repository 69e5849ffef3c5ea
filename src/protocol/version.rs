use std::fmt;

use bincode::{
    Decode, Encode,
    config::{Configuration, Fixint, LittleEndian},
    decode_from_slice, encode_to_vec,
};

use crate::{
    buffer::{MessageReader, MessageWriter},
    error::Result,
};

/// Handshake dialect spoken with the server.
///
/// Ordering is lexicographic on `(major, minor, patch)`; on the wire it is three
/// little-endian 16-bit integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Encode, Decode)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

pub const VERSION_1_0_0: ProtocolVersion = ProtocolVersion::new(1, 0, 0);
pub const VERSION_1_1_0: ProtocolVersion = ProtocolVersion::new(1, 1, 0);
pub const VERSION_1_2_0: ProtocolVersion = ProtocolVersion::new(1, 2, 0);
pub const VERSION_1_3_0: ProtocolVersion = ProtocolVersion::new(1, 3, 0);
pub const VERSION_1_4_0: ProtocolVersion = ProtocolVersion::new(1, 4, 0);

// 1.0.0 lays out the handshake fields differently and is not spoken.
pub const SUPPORTED_VERSIONS: [ProtocolVersion; 4] =
    [VERSION_1_1_0, VERSION_1_2_0, VERSION_1_3_0, VERSION_1_4_0];

pub const CURRENT_VERSION: ProtocolVersion = VERSION_1_4_0;

/// First version that accepts username/password in the handshake.
pub const AUTHENTICATION_SINCE: ProtocolVersion = VERSION_1_1_0;

/// First version with response flags, topology updates and node ids.
pub const PARTITION_AWARENESS_SINCE: ProtocolVersion = VERSION_1_4_0;

const PROTOCOL_VERSION_SIZE: usize = 3 * size_of::<u16>();
const TOPOLOGY_VERSION_SIZE: usize = size_of::<i64>() + size_of::<i32>();

pub(crate) fn wire_config() -> Configuration<LittleEndian, Fixint> {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}

impl ProtocolVersion {
    pub const fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    pub fn is_supported(&self) -> bool {
        SUPPORTED_VERSIONS.contains(self)
    }

    pub fn read(reader: &mut MessageReader) -> Result<Self> {
        let raw = reader.read_bytes(PROTOCOL_VERSION_SIZE)?;
        let (version, _) = decode_from_slice(&raw, wire_config())?;
        Ok(version)
    }

    pub fn write(&self, writer: &mut MessageWriter) -> Result<()> {
        writer.write_bytes(&encode_to_vec(self, wire_config())?);
        Ok(())
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Server-side data distribution version, pushed opportunistically on responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Encode, Decode)]
pub struct AffinityTopologyVersion {
    pub major: i64,
    pub minor: i32,
}

impl AffinityTopologyVersion {
    pub fn read(reader: &mut MessageReader) -> Result<Self> {
        let raw = reader.read_bytes(TOPOLOGY_VERSION_SIZE)?;
        let (version, _) = decode_from_slice(&raw, wire_config())?;
        Ok(version)
    }
}

impl fmt::Display for AffinityTopologyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_serializes_to_six_bytes() {
        let mut writer = MessageWriter::new();
        ProtocolVersion::new(1, 4, 2).write(&mut writer).unwrap();

        assert_eq!(&writer.into_bytes()[..], &[1, 0, 4, 0, 2, 0]);
    }

    #[test]
    fn version_read_back() {
        let mut writer = MessageWriter::new();
        VERSION_1_3_0.write(&mut writer).unwrap();
        let mut reader = MessageReader::new(writer.into_bytes());

        assert_eq!(ProtocolVersion::read(&mut reader).unwrap(), VERSION_1_3_0);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn supported_versions_are_ascending() {
        assert!(VERSION_1_0_0 < VERSION_1_1_0);
        for pair in SUPPORTED_VERSIONS.windows(2) {
            assert!(pair[0] < pair[1], "{} !< {}", pair[0], pair[1]);
        }
        assert_eq!(SUPPORTED_VERSIONS.iter().max(), Some(&CURRENT_VERSION));
    }

    #[test]
    fn ordering_is_lexicographic() {
        assert!(ProtocolVersion::new(1, 10, 0) > ProtocolVersion::new(1, 9, 9));
        assert!(ProtocolVersion::new(2, 0, 0) > ProtocolVersion::new(1, 99, 99));
        assert!(ProtocolVersion::new(1, 1, 1) > VERSION_1_1_0);
    }

    #[test]
    fn unsupported_versions() {
        assert!(!VERSION_1_0_0.is_supported());
        assert!(!ProtocolVersion::new(1, 5, 0).is_supported());
        assert!(VERSION_1_2_0.is_supported());
    }

    #[test]
    fn topology_version_layout() {
        let mut writer = MessageWriter::new();
        writer.write_i64(7);
        writer.write_i32(3);
        let mut reader = MessageReader::new(writer.into_bytes());

        let version = AffinityTopologyVersion::read(&mut reader).unwrap();
        assert_eq!(version, AffinityTopologyVersion { major: 7, minor: 3 });
        assert_eq!(version.to_string(), "7.3");
    }
}

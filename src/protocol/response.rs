use crate::{
    buffer::MessageReader,
    error::{ClientError, Result},
};

use super::{AffinityTopologyVersion, ProtocolVersion, version::PARTITION_AWARENESS_SINCE};

pub const FLAG_ERROR: i16 = 1;
pub const FLAG_AFFINITY_TOPOLOGY_CHANGED: i16 = 1 << 1;

const STATUS_SUCCESS: i32 = 0;

/// Status section of a response, decoded up to the start of the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseStatus {
    pub topology: Option<AffinityTopologyVersion>,
    pub error: Option<ClientError>,
}

impl ResponseStatus {
    /// Reads flags (or the legacy status code), the optional topology update and the
    /// optional error, leaving `reader` at the first payload byte.
    pub fn read(reader: &mut MessageReader, version: ProtocolVersion) -> Result<Self> {
        if version < PARTITION_AWARENESS_SINCE {
            let status = reader.read_i32()?;
            let error = match status {
                STATUS_SUCCESS => None,
                code => Some(read_error(reader, code)?),
            };
            return Ok(Self {
                topology: None,
                error,
            });
        }

        let flags = reader.read_i16()?;
        let topology = if flags & FLAG_AFFINITY_TOPOLOGY_CHANGED != 0 {
            Some(AffinityTopologyVersion::read(reader)?)
        } else {
            None
        };
        let error = if flags & FLAG_ERROR != 0 {
            let code = reader.read_i32()?;
            Some(read_error(reader, code)?)
        } else {
            None
        };

        Ok(Self { topology, error })
    }
}

fn read_error(reader: &mut MessageReader, code: i32) -> Result<ClientError> {
    let message = reader.read_string()?.unwrap_or_default();
    Ok(ClientError::Operation {
        code: Some(code),
        message,
    })
}

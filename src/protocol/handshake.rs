//! Version negotiation.
//!
//! The client proposes the newest version it speaks. A server that only speaks an older
//! dialect rejects the handshake and reports its own version; if that version is one we
//! support, `connect` proposes it in a fresh handshake.
use log::debug;
use uuid::Uuid;

use crate::{
    buffer::{MessageReader, MessageWriter},
    config::Credentials,
    error::{ClientError, Result},
};

use super::{
    ProtocolVersion,
    request::PayloadWriter,
    version::{AUTHENTICATION_SINCE, PARTITION_AWARENESS_SINCE},
};

pub const HANDSHAKE_CODE: u8 = 1;
pub const CLIENT_CODE: u8 = 2;
pub const HANDSHAKE_SUCCESS: u8 = 1;

/// Outcome of a decoded handshake response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeResult {
    Accepted { node_id: Option<Uuid> },
    /// The server speaks another supported version; propose it next.
    Downgrade(ProtocolVersion),
}

pub(crate) fn payload_writer(
    version: ProtocolVersion,
    credentials: Option<Credentials>,
) -> PayloadWriter {
    Box::new(move |writer: &mut MessageWriter| {
        writer.write_u8(HANDSHAKE_CODE);
        version.write(writer)?;
        writer.write_u8(CLIENT_CODE);
        if let Some(credentials) = credentials {
            writer.write_string(Some(&credentials.username))?;
            writer.write_string(Some(&credentials.password))?;
        }
        Ok(())
    })
}

/// Decodes the server's answer to a handshake that proposed `proposed`.
pub fn finalize(
    reader: &mut MessageReader,
    proposed: ProtocolVersion,
    has_credentials: bool,
) -> Result<HandshakeResult> {
    if reader.read_u8()? == HANDSHAKE_SUCCESS {
        let node_id = if proposed >= PARTITION_AWARENESS_SINCE {
            reader.read_uuid()?
        } else {
            None
        };
        return Ok(HandshakeResult::Accepted { node_id });
    }

    let server = ProtocolVersion::read(reader)?;
    let message = reader.read_string()?.unwrap_or_default();
    debug!("handshake at {proposed} rejected, server speaks {server}: {message}");

    if server == proposed {
        return Err(ClientError::Operation {
            code: None,
            message,
        });
    }

    if !server.is_supported() || (server < AUTHENTICATION_SINCE && has_credentials) {
        return Err(ClientError::ProtocolVersionMismatch {
            client: proposed,
            server,
            message,
        });
    }

    Ok(HandshakeResult::Downgrade(server))
}

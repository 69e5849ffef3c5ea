//! Error taxonomy for the client connection.
//!
//! Every failure a caller can observe is a [`ClientError`]. Errors are `Clone` so that a
//! single disconnect cause can be handed to every request still waiting on the
//! connection.
use std::io;

use thiserror::Error;

use crate::protocol::{ConnectionState, ProtocolVersion};

pub type Result<T, E = ClientError> = std::result::Result<T, E>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    #[error("illegal state: connection is {0}")]
    IllegalState(ConnectionState),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error(
        "protocol version mismatch: client {client} / server {server}. server details: {message}"
    )]
    ProtocolVersionMismatch {
        client: ProtocolVersion,
        server: ProtocolVersion,
        message: String,
    },

    #[error("{}", operation_message(.code, .message))]
    Operation { code: Option<i32>, message: String },

    #[error("{}", lost_connection_message(.0.as_deref()))]
    LostConnection(Option<String>),

    #[error("internal protocol error: {0}")]
    InternalProtocol(String),

    #[error("failed to decode message: {0}")]
    Decode(String),

    #[error("transport io error: {0}")]
    Io(String),

    #[error("tls error: {0}")]
    Tls(String),
}

fn operation_message(code: &Option<i32>, message: &str) -> String {
    match code {
        Some(code) => format!("operation failed [{code}]: {message}"),
        None => format!("operation failed: {message}"),
    }
}

fn lost_connection_message(cause: Option<&str>) -> String {
    match cause {
        Some(cause) => format!("lost connection to the server: {cause}"),
        None => "lost connection to the server".to_string(),
    }
}

impl From<io::Error> for ClientError {
    fn from(value: io::Error) -> Self {
        ClientError::Io(value.to_string())
    }
}

impl From<rustls::Error> for ClientError {
    fn from(value: rustls::Error) -> Self {
        ClientError::Tls(value.to_string())
    }
}

impl From<bincode::error::EncodeError> for ClientError {
    fn from(value: bincode::error::EncodeError) -> Self {
        ClientError::Decode(format!("failed to encode value: {value}"))
    }
}

impl From<bincode::error::DecodeError> for ClientError {
    fn from(value: bincode::error::DecodeError) -> Self {
        ClientError::Decode(value.to_string())
    }
}

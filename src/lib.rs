pub mod buffer;
pub mod config;
pub mod error;
pub mod protocol;

pub use buffer::{MessageReader, MessageWriter};
pub use config::{ClientConfig, Credentials, TlsConfig, TransportOptions};
pub use error::{ClientError, Result};
pub use protocol::{
    AffinityTopologyVersion, Connection, ConnectionListeners, ConnectionState, Endpoint,
    ProtocolVersion, ResponseHandle,
};

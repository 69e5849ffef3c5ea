//! Client-server wire protocol.
//!
//! This module implements the client side of a binary thin-client protocol: version
//! negotiation, message framing, request/response correlation and the transport that
//! carries them over TCP or TLS.
//!
//! # Overview
//!
//! A [`Connection`] owns one socket to one server node. After the socket opens, the client
//! proposes a protocol version in a handshake; the server either accepts it or answers with
//! the version it speaks, in which case the client retries with that version. Once
//! connected, any number of threads may issue requests over the same connection. Each
//! request carries an id, and responses are matched back to their callers by that id in
//! whatever order the server sends them.
//!
//! The protocol decisions live in [`Session`], which never touches a socket, so they can be
//! driven directly from tests. [`Connection`] wires a session to a [`Socket`] and a
//! background reader thread.
//!
//! # Binary Format
//!
//! All integers are little-endian.
//!
//! - Every message is an `i32` body length followed by the body.
//! - A request body starts with an `i16` operation code and an `i64` request id.
//! - A response body starts with the `i64` request id, followed by a status word and the
//!   operation payload.
//! - The handshake request and response carry no id; at most one handshake is in flight.
//!
//! Reads from the socket may split or coalesce messages arbitrarily. [`FrameAssembler`]
//! reassembles them.
//!
//! # Key Components
//!
//! - [`Connection`]: Public handle: connect, send requests, disconnect.
//! - [`Session`]: Connection state machine and correlation table.
//! - [`ProtocolVersion`]: Negotiable protocol versions and feature thresholds.
//! - [`Endpoint`]: Parsed `host[:port]` server address.
//! - [`Socket`]: Plain or TLS byte stream.
mod connection;
mod endpoint;
mod framing;
mod handshake;
mod request;
mod response;
mod session;
mod thread;
mod transport;
mod version;

pub use connection::{Connection, ConnectionListeners, DisconnectListener, TopologyListener};
pub use endpoint::{AddressFamily, DEFAULT_PORT, Endpoint};
pub use framing::FrameAssembler;
pub use handshake::HandshakeResult;
pub use request::{PayloadWriter, PendingRequest, RequestTable, ResponseHandle};
pub use response::ResponseStatus;
pub use session::{ConnectionState, Dispatch, Session, Teardown};
pub use transport::{Socket, SocketReader, SocketWriter};
pub use version::{
    AUTHENTICATION_SINCE, AffinityTopologyVersion, CURRENT_VERSION, PARTITION_AWARENESS_SINCE,
    ProtocolVersion, SUPPORTED_VERSIONS, VERSION_1_0_0, VERSION_1_1_0, VERSION_1_2_0,
    VERSION_1_3_0, VERSION_1_4_0,
};

//! Public connection handle.
//!
//! A [`Connection`] drives one [`Session`] over one [`Socket`]: `connect` opens the
//! socket and runs the handshake (including version downgrades), a background reader
//! thread feeds socket reads into the session, and request-issuing threads serialize
//! their frames and wait on per-request handles.
//!
//! # Example
//! ```no_run
//! use thinwire::{ClientConfig, Connection, ConnectionListeners};
//!
//! let listeners = ConnectionListeners::default()
//!     .on_disconnect(|conn, err| eprintln!("lost {}: {err:?}", conn.endpoint()));
//! let conn = Connection::new("127.0.0.1:10800", ClientConfig::default(), listeners).unwrap();
//! conn.connect().unwrap();
//!
//! // OP_CACHE_GET_NAMES
//! let count = conn
//!     .send_request(1050, |_| Ok(()), |payload| payload.read_i32())
//!     .unwrap();
//! println!("{count} caches");
//!
//! conn.disconnect();
//! ```
use std::{
    fmt, io,
    io::Write,
    net::{Shutdown, TcpStream},
    sync::{Arc, mpsc},
};

use log::{debug, info, warn};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::{
    buffer::{MessageReader, MessageWriter},
    config::ClientConfig,
    error::{ClientError, Result},
};

use super::{
    AffinityTopologyVersion, ConnectionState, ProtocolVersion,
    endpoint::Endpoint,
    request::{HandshakeReply, PendingRequest, ResponseHandle, response_channel},
    session::Session,
    thread::ReaderThread,
    transport::{Socket, SocketWriter},
    version::{CURRENT_VERSION, SUPPORTED_VERSIONS},
};

pub type DisconnectListener = Box<dyn Fn(&Connection, Option<&ClientError>) + Send + Sync>;
pub type TopologyListener = Box<dyn Fn(AffinityTopologyVersion) + Send + Sync>;

/// Callbacks into the code that owns the connection.
#[derive(Default)]
pub struct ConnectionListeners {
    /// Runs once when an established connection goes away.
    pub on_disconnect: Option<DisconnectListener>,
    /// Runs on the reader thread before the response that carried the update completes.
    pub on_affinity_topology_change: Option<TopologyListener>,
}

impl ConnectionListeners {
    pub fn on_disconnect<F>(mut self, listener: F) -> Self
    where
        F: Fn(&Connection, Option<&ClientError>) + Send + Sync + 'static,
    {
        self.on_disconnect = Some(Box::new(listener));
        self
    }

    pub fn on_affinity_topology_change<F>(mut self, listener: F) -> Self
    where
        F: Fn(AffinityTopologyVersion) + Send + Sync + 'static,
    {
        self.on_affinity_topology_change = Some(Box::new(listener));
        self
    }
}

impl fmt::Debug for ConnectionListeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionListeners")
            .field("on_disconnect", &self.on_disconnect.is_some())
            .field(
                "on_affinity_topology_change",
                &self.on_affinity_topology_change.is_some(),
            )
            .finish()
    }
}

pub(crate) struct Shared {
    address: String,
    endpoint: Endpoint,
    config: ClientConfig,
    listeners: ConnectionListeners,
    session: Mutex<Session>,
    writer: Mutex<Option<SocketWriter>>,
    /// Second handle on the socket, so shutting it down never waits for a writer.
    stream: Mutex<Option<TcpStream>>,
    reader: Mutex<Option<ReaderThread>>,
}

impl Shared {
    /// Writes one complete frame. A failed write tears the connection down.
    fn write(self: &Arc<Self>, message: &[u8]) -> Result<()> {
        let written = match self.writer.lock().as_mut() {
            Some(socket) => Some(socket.write_all(message).and_then(|_| socket.flush())),
            None => None,
        };

        match written {
            Some(Ok(())) => Ok(()),
            Some(Err(e)) => {
                warn!("failed to write to {}: {e}", self.endpoint);
                self.disconnect(Some(ClientError::from(e)), true);
                Err(self.session.lock().lost_connection())
            }
            None => Err(self.session.lock().lost_connection()),
        }
    }

    /// Feeds a socket read into the session; returns `false` once the reader should stop.
    pub(crate) fn handle_data(self: &Arc<Self>, chunk: &[u8]) -> bool {
        let mut dispatches = Vec::new();
        let result = self.session.lock().on_data(chunk, &mut dispatches);

        let on_topology_change = self.listeners.on_affinity_topology_change.as_deref();
        for dispatch in dispatches {
            if let Some(topology) = dispatch.topology() {
                debug!("affinity topology changed to {topology}");
            }
            dispatch.deliver(on_topology_change);
        }

        match result {
            Ok(()) => self.session.lock().state() != ConnectionState::Disconnected,
            Err(e) => {
                warn!("closing connection to {}: {e}", self.endpoint);
                self.disconnect(Some(e), true);
                false
            }
        }
    }

    /// The server closed the stream.
    pub(crate) fn handle_close(self: &Arc<Self>) {
        self.disconnect(None, false);
    }

    pub(crate) fn handle_error(self: &Arc<Self>, error: io::Error) {
        let error = ClientError::from(error);
        warn!("socket error on {}: {error}", self.endpoint);
        self.disconnect(Some(error), true);
    }

    /// Moves to `Disconnected`, fails every pending request and notifies the listener.
    ///
    /// `close` is false when the server already closed the stream.
    fn disconnect(self: &Arc<Self>, cause: Option<ClientError>, close: bool) {
        let teardown = self.session.lock().disconnect(cause);

        if close {
            // A caller blocked mid-frame holds the send half; skip close_notify then.
            if let Some(mut writer) = self.writer.try_lock() {
                if let Some(writer) = writer.as_mut() {
                    if let Err(e) = writer.shutdown() {
                        debug!("socket shutdown for {} failed: {e}", self.endpoint);
                    }
                }
            }
        }
        let stream = self.stream.lock().take();
        if let Some(stream) = stream {
            // Wakes the reader thread and any blocked writer.
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.writer.lock().take();

        if let Some(mut teardown) = teardown {
            info!(
                "disconnected from {} ({} pending requests failed)",
                self.endpoint,
                teardown.requests.len()
            );
            teardown.fail_requests();

            if teardown.notify {
                if let Some(listener) = &self.listeners.on_disconnect {
                    let connection = Connection {
                        shared: Arc::clone(self),
                    };
                    listener(&connection, teardown.cause.as_ref());
                }
            }
        }

        let reader = self.reader.lock().take();
        if let Some(reader) = reader {
            if !reader.is_current() {
                reader.join();
            }
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(mut writer) = self.writer.get_mut().take() {
            let _ = writer.shutdown();
        }
        if let Some(stream) = self.stream.get_mut().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

/// Client side of one server connection. Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Validates `endpoint` and `config` without touching the network.
    pub fn new(
        endpoint: &str,
        config: ClientConfig,
        listeners: ConnectionListeners,
    ) -> Result<Self> {
        let parsed = Endpoint::parse(endpoint)?;
        config.validate()?;

        Ok(Self {
            shared: Arc::new(Shared {
                address: endpoint.to_string(),
                endpoint: parsed,
                session: Mutex::new(Session::new(config.credentials.is_some())),
                config,
                listeners,
                writer: Mutex::new(None),
                stream: Mutex::new(None),
                reader: Mutex::new(None),
            }),
        })
    }

    /// Opens the socket and negotiates a protocol version.
    ///
    /// Returns once the handshake has been accepted, or with the error that ended it; in
    /// the error case the connection is left `Disconnected`.
    pub fn connect(&self) -> Result<()> {
        let state = self.state();
        if state != ConnectionState::Initial {
            return Err(ClientError::IllegalState(state));
        }

        info!("connecting to {}", self.shared.endpoint);
        let opened = Socket::open(&self.shared.endpoint, &self.shared.config)
            .and_then(|socket| Ok((socket.writer.try_clone_stream()?, socket)));
        let (stream, Socket { reader, mut writer }) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                return Err(self.abort(ClientError::ConnectionFailed(e.to_string())));
            }
        };

        if let Err(e) = self.shared.session.lock().on_connected() {
            let _ = writer.shutdown();
            return Err(e);
        }
        *self.shared.writer.lock() = Some(writer);
        *self.shared.stream.lock() = Some(stream);

        let name = format!("thinwire-reader-{}", self.shared.endpoint);
        match ReaderThread::spawn(Arc::downgrade(&self.shared), reader, name) {
            Ok(reader) => *self.shared.reader.lock() = Some(reader),
            Err(e) => return Err(self.abort(ClientError::from(e))),
        }

        self.handshake()
    }

    /// Proposes versions until the server accepts one, each at most once.
    fn handshake(&self) -> Result<()> {
        let credentials = self.shared.config.credentials.clone();
        let mut proposed = Vec::with_capacity(SUPPORTED_VERSIONS.len());
        let mut version = CURRENT_VERSION;

        loop {
            proposed.push(version);
            let (sender, receiver) = mpsc::sync_channel(1);
            let message = self.shared.session.lock().begin_handshake(
                version,
                credentials.clone(),
                sender,
            );
            let message = match message {
                Ok(message) => message,
                Err(e) => return Err(self.abort(e)),
            };
            self.shared.write(&message)?;

            let reply = receiver
                .recv()
                .unwrap_or_else(|_| Err(self.shared.session.lock().lost_connection()));

            match reply {
                Ok(HandshakeReply::Established(version)) => {
                    info!(
                        "connected to {} using protocol version {version}",
                        self.shared.endpoint
                    );
                    return Ok(());
                }
                Ok(HandshakeReply::Retry(server)) if proposed.contains(&server) => {
                    return Err(self.abort(ClientError::ProtocolVersionMismatch {
                        client: version,
                        server,
                        message: "server proposed a version it already rejected".to_string(),
                    }));
                }
                Ok(HandshakeReply::Retry(server)) => {
                    debug!("server speaks {server}, retrying handshake");
                    version = server;
                }
                Err(e) => return Err(self.abort(e)),
            }
        }
    }

    fn abort(&self, error: ClientError) -> ClientError {
        self.shared.disconnect(Some(error.clone()), true);
        error
    }

    /// Closes the connection. Every pending request fails with a lost-connection error.
    pub fn disconnect(&self) {
        self.shared.disconnect(None, true);
    }

    /// Sends a request and returns a handle to its single outcome without waiting.
    ///
    /// Fails with [`ClientError::IllegalState`] unless the connection is established;
    /// nothing is written in that case.
    pub fn submit<T, W, R>(
        &self,
        op_code: i16,
        payload_writer: W,
        payload_reader: R,
    ) -> Result<ResponseHandle<T>>
    where
        T: Send + 'static,
        W: FnOnce(&mut MessageWriter) -> Result<()> + Send + 'static,
        R: FnOnce(&mut MessageReader) -> Result<T> + Send + 'static,
    {
        let id = {
            let mut session = self.shared.session.lock();
            session.ensure_connected()?;
            session.allocate_request_id()
        };

        let (completion, handle) = response_channel(payload_reader);
        let mut request = PendingRequest::new(id, op_code, Box::new(payload_writer), completion);
        let message = request.build_message()?;
        self.shared.session.lock().register(request)?;

        debug!(
            "sending request {id} (op {op_code}, {} bytes)",
            message.len()
        );
        self.shared.write(&message)?;
        Ok(handle)
    }

    /// Sends a request and waits for the response, decoded by `payload_reader`.
    pub fn send_request<T, W, R>(
        &self,
        op_code: i16,
        payload_writer: W,
        payload_reader: R,
    ) -> Result<T>
    where
        T: Send + 'static,
        W: FnOnce(&mut MessageWriter) -> Result<()> + Send + 'static,
        R: FnOnce(&mut MessageReader) -> Result<T> + Send + 'static,
    {
        self.submit(op_code, payload_writer, payload_reader)?.wait()
    }

    /// Sends a request whose response carries no payload of interest.
    pub fn send<W>(&self, op_code: i16, payload_writer: W) -> Result<()>
    where
        W: FnOnce(&mut MessageWriter) -> Result<()> + Send + 'static,
    {
        self.send_request(op_code, payload_writer, |_| Ok(()))
    }

    /// Endpoint as given to [`Connection::new`].
    pub fn endpoint(&self) -> &str {
        &self.shared.address
    }

    /// Server node id, known after a handshake at 1.4.0 or later.
    pub fn node_id(&self) -> Option<Uuid> {
        self.shared.session.lock().node_id()
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.shared.session.lock().protocol_version()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.session.lock().state()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.shared.address)
            .field("state", &self.state())
            .finish()
    }
}

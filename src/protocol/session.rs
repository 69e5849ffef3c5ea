//! Socket-independent connection state machine.
//!
//! [`Session`] owns everything about one connection except the socket: lifecycle state,
//! request id allocation, the correlation table and the receive buffer. The socket driver
//! in [`connection`](super::connection) feeds it transport events and performs whatever
//! I/O it asks for, so every protocol decision here can be exercised without a network.
//!
//! ```text
//!  INITIAL ──connected──▶ HANDSHAKING ──accepted──▶ CONNECTED
//!     │                    │   ▲                        │
//!     │                    └───┘ downgrade retry        │
//!     └────────────────────┴──────────────┬─────────────┘
//!                                         ▼
//!                                   DISCONNECTED
//! ```
use std::fmt;

use bytes::Bytes;
use log::{debug, info, trace};
use uuid::Uuid;

use crate::{
    buffer::MessageReader,
    config::Credentials,
    error::{ClientError, Result},
};

use super::{
    AffinityTopologyVersion, ProtocolVersion,
    framing::FrameAssembler,
    handshake::{self, HandshakeResult},
    request::{HandshakeReply, HandshakeSender, PendingRequest, RequestTable},
    response::ResponseStatus,
    version::CURRENT_VERSION,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Initial,
    Handshaking,
    Connected,
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Initial => "INITIAL",
            ConnectionState::Handshaking => "HANDSHAKING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Disconnected => "DISCONNECTED",
        };
        f.write_str(name)
    }
}

/// A decoded response ready to be delivered outside the session lock.
#[derive(Debug)]
pub struct Dispatch {
    request: PendingRequest,
    topology: Option<AffinityTopologyVersion>,
    outcome: Result<MessageReader>,
}

impl Dispatch {
    pub fn request_id(&self) -> i64 {
        self.request.id()
    }

    pub fn topology(&self) -> Option<AffinityTopologyVersion> {
        self.topology
    }

    /// Notifies the topology listener first, then completes the request.
    pub fn deliver(
        self,
        on_topology_change: Option<&(dyn Fn(AffinityTopologyVersion) + Send + Sync)>,
    ) {
        if let (Some(topology), Some(listener)) = (self.topology, on_topology_change) {
            listener(topology);
        }
        self.request.complete(self.outcome);
    }
}

/// Everything that must happen after the session has moved to `Disconnected`.
#[derive(Debug)]
pub struct Teardown {
    pub requests: Vec<PendingRequest>,
    pub cause: Option<ClientError>,
    /// The connection had been established, so the disconnect listener must run.
    pub notify: bool,
}

impl Teardown {
    /// Fails every swept request with a lost-connection error.
    pub fn fail_requests(&mut self) {
        let cause = self.cause.as_ref().map(|e| e.to_string());
        for request in self.requests.drain(..) {
            request.fail(ClientError::LostConnection(cause.clone()));
        }
    }
}

#[derive(Debug)]
pub struct Session {
    state: ConnectionState,
    protocol_version: ProtocolVersion,
    node_id: Option<Uuid>,
    next_request_id: i64,
    handshake_request_id: Option<i64>,
    requests: RequestTable,
    frames: FrameAssembler,
    has_credentials: bool,
    was_connected: bool,
    last_error: Option<ClientError>,
}

impl Session {
    pub fn new(has_credentials: bool) -> Self {
        Self {
            state: ConnectionState::Initial,
            protocol_version: CURRENT_VERSION,
            node_id: None,
            next_request_id: 0,
            handshake_request_id: None,
            requests: RequestTable::new(),
            frames: FrameAssembler::new(),
            has_credentials,
            was_connected: false,
            last_error: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.protocol_version
    }

    pub fn node_id(&self) -> Option<Uuid> {
        self.node_id
    }

    pub fn was_connected(&self) -> bool {
        self.was_connected
    }

    pub fn last_error(&self) -> Option<&ClientError> {
        self.last_error.as_ref()
    }

    pub fn pending_requests(&self) -> usize {
        self.requests.len()
    }

    pub fn allocate_request_id(&mut self) -> i64 {
        let id = self.next_request_id;
        self.next_request_id += 1;
        id
    }

    pub fn ensure_connected(&self) -> Result<()> {
        match self.state {
            ConnectionState::Connected => Ok(()),
            state => Err(ClientError::IllegalState(state)),
        }
    }

    /// The transport reported the socket as connected.
    pub fn on_connected(&mut self) -> Result<()> {
        match self.state {
            ConnectionState::Initial => {
                self.state = ConnectionState::Handshaking;
                Ok(())
            }
            state => Err(ClientError::IllegalState(state)),
        }
    }

    /// Registers a handshake proposing `version` and returns the frame to send.
    pub(crate) fn begin_handshake(
        &mut self,
        version: ProtocolVersion,
        credentials: Option<Credentials>,
        reply: HandshakeSender,
    ) -> Result<Bytes> {
        if self.state != ConnectionState::Handshaking {
            return Err(match self.state {
                ConnectionState::Disconnected => self.lost_connection(),
                state => ClientError::IllegalState(state),
            });
        }

        self.protocol_version = version;
        let id = self.allocate_request_id();
        let mut request =
            PendingRequest::handshake(id, handshake::payload_writer(version, credentials), reply);
        let message = request.build_message()?;
        self.requests.insert(request)?;
        self.handshake_request_id = Some(id);

        debug!("handshake {id} proposing version {version}");
        Ok(message)
    }

    /// Places a serialized request into the correlation table just before it is written.
    pub fn register(&mut self, request: PendingRequest) -> Result<()> {
        if self.state != ConnectionState::Connected {
            return Err(match self.state {
                ConnectionState::Disconnected => self.lost_connection(),
                state => ClientError::IllegalState(state),
            });
        }
        self.requests.insert(request)
    }

    /// Error handed to callers once the connection is gone.
    pub fn lost_connection(&self) -> ClientError {
        ClientError::LostConnection(self.last_error.as_ref().map(|e| e.to_string()))
    }

    /// Appends a chunk read from the socket and decodes every complete frame in it.
    ///
    /// Responses are pushed to `dispatches` in frame order. An error is fatal for the
    /// connection: the caller must disconnect, but dispatches gathered before the error
    /// are still valid and must be delivered.
    pub fn on_data(&mut self, chunk: &[u8], dispatches: &mut Vec<Dispatch>) -> Result<()> {
        trace!("received {} bytes", chunk.len());
        self.frames.push(chunk);

        while let Some(frame) = self.frames.next_frame()? {
            if self.state == ConnectionState::Disconnected {
                break;
            }
            self.process_frame(frame, dispatches)?;
        }
        Ok(())
    }

    fn process_frame(
        &mut self,
        mut frame: MessageReader,
        dispatches: &mut Vec<Dispatch>,
    ) -> Result<()> {
        // The handshake response carries no request id on the wire.
        let request_id = match (self.state, self.handshake_request_id) {
            (ConnectionState::Handshaking, Some(id)) => id,
            (ConnectionState::Handshaking, None) => {
                return Err(ClientError::InternalProtocol(
                    "frame received while no handshake is in flight".to_string(),
                ));
            }
            _ => frame.read_i64()?,
        };

        let request = self.requests.take(request_id).ok_or_else(|| {
            ClientError::InternalProtocol(format!("no pending request with id {request_id}"))
        })?;

        if request.is_handshake() {
            self.finalize_handshake(request, frame)
        } else {
            self.finalize_response(request, frame, dispatches)
        }
    }

    fn finalize_handshake(
        &mut self,
        request: PendingRequest,
        mut frame: MessageReader,
    ) -> Result<()> {
        self.handshake_request_id = None;
        let proposed = self.protocol_version;

        match handshake::finalize(&mut frame, proposed, self.has_credentials) {
            Ok(HandshakeResult::Accepted { node_id }) => {
                self.node_id = node_id;
                self.state = ConnectionState::Connected;
                self.was_connected = true;
                info!("handshake accepted at version {proposed}");
                request.resolve_handshake(Ok(HandshakeReply::Established(proposed)));
                Ok(())
            }
            Ok(HandshakeResult::Downgrade(server)) => {
                request.resolve_handshake(Ok(HandshakeReply::Retry(server)));
                Ok(())
            }
            Err(e) => {
                request.resolve_handshake(Err(e.clone()));
                Err(e)
            }
        }
    }

    fn finalize_response(
        &mut self,
        request: PendingRequest,
        mut frame: MessageReader,
        dispatches: &mut Vec<Dispatch>,
    ) -> Result<()> {
        match ResponseStatus::read(&mut frame, self.protocol_version) {
            Ok(status) => {
                trace!(
                    "response for request {} ({} payload bytes)",
                    request.id(),
                    frame.remaining()
                );
                dispatches.push(Dispatch {
                    request,
                    topology: status.topology,
                    outcome: match status.error {
                        Some(error) => Err(error),
                        None => Ok(frame),
                    },
                });
                Ok(())
            }
            Err(e) => {
                dispatches.push(Dispatch {
                    request,
                    topology: None,
                    outcome: Err(e.clone()),
                });
                Err(e)
            }
        }
    }

    /// Moves to `Disconnected` and sweeps the correlation table.
    ///
    /// Returns `None` when already disconnected, so the sweep and the listener
    /// notification happen once per connection.
    pub fn disconnect(&mut self, cause: Option<ClientError>) -> Option<Teardown> {
        if self.state == ConnectionState::Disconnected {
            return None;
        }
        if let Some(cause) = cause {
            self.last_error = Some(cause);
        }

        info!("disconnecting from state {}", self.state);
        self.state = ConnectionState::Disconnected;
        self.handshake_request_id = None;
        self.frames.clear();

        Some(Teardown {
            requests: self.requests.drain(),
            cause: self.last_error.clone(),
            notify: self.was_connected,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc, Mutex,
        mpsc::{self, Receiver},
    };

    use crate::{
        buffer::MessageWriter,
        protocol::{
            request::{PayloadWriter, ResponseHandle, response_channel},
            response::{FLAG_AFFINITY_TOPOLOGY_CHANGED, FLAG_ERROR},
            version::{VERSION_1_0_0, VERSION_1_1_0, VERSION_1_2_0, VERSION_1_3_0},
        },
    };

    use super::*;

    fn frame(body: impl FnOnce(&mut MessageWriter)) -> Bytes {
        let mut writer = MessageWriter::framed();
        body(&mut writer);
        writer.finish_frame().unwrap()
    }

    fn handshake_accepted(node_id: Option<Uuid>) -> Bytes {
        frame(|w| {
            w.write_u8(1);
            if node_id.is_some() {
                w.write_uuid(node_id);
            }
        })
    }

    fn handshake_rejected(server: ProtocolVersion) -> Bytes {
        frame(|w| {
            w.write_u8(0);
            server.write(w).unwrap();
            w.write_string(Some("unsupported version")).unwrap();
        })
    }

    fn ok_response(id: i64, value: i32) -> Bytes {
        frame(|w| {
            w.write_i64(id);
            w.write_i16(0);
            w.write_i32(value);
        })
    }

    fn start_handshake(
        session: &mut Session,
        version: ProtocolVersion,
    ) -> Receiver<Result<HandshakeReply>> {
        let (sender, receiver) = mpsc::sync_channel(1);
        session.begin_handshake(version, None, sender).unwrap();
        receiver
    }

    fn connected_session() -> Session {
        let mut session = Session::new(false);
        session.on_connected().unwrap();
        let reply = start_handshake(&mut session, CURRENT_VERSION);
        let mut dispatches = Vec::new();
        session
            .on_data(&handshake_accepted(Some(Uuid::from_u128(1))), &mut dispatches)
            .unwrap();
        assert_eq!(
            reply.recv().unwrap(),
            Ok(HandshakeReply::Established(CURRENT_VERSION))
        );
        session
    }

    fn register_read_i32(session: &mut Session) -> (i64, ResponseHandle<i32>) {
        let id = session.allocate_request_id();
        let (completion, handle) = response_channel(|payload| payload.read_i32());
        let writer: PayloadWriter = Box::new(|_: &mut MessageWriter| Ok(()));
        let mut request = PendingRequest::new(id, 1000, writer, completion);
        request.build_message().unwrap();
        session.register(request).unwrap();
        (id, handle)
    }

    fn deliver_all(dispatches: Vec<Dispatch>) {
        for dispatch in dispatches {
            dispatch.deliver(None);
        }
    }

    #[test]
    fn handshake_establishes_connection() {
        let session = connected_session();

        assert_eq!(session.state(), ConnectionState::Connected);
        assert_eq!(session.node_id(), Some(Uuid::from_u128(1)));
        assert!(session.was_connected());
        assert_eq!(session.pending_requests(), 0);
    }

    #[test]
    fn request_ids_start_at_zero_and_include_handshake() {
        let mut session = Session::new(false);
        session.on_connected().unwrap();
        let _reply = start_handshake(&mut session, CURRENT_VERSION);

        assert_eq!(session.allocate_request_id(), 1);
        assert_eq!(session.allocate_request_id(), 2);
    }

    #[test]
    fn downgrade_keeps_handshaking() {
        for server in [VERSION_1_1_0, VERSION_1_2_0, VERSION_1_3_0] {
            let mut session = Session::new(false);
            session.on_connected().unwrap();
            let reply = start_handshake(&mut session, CURRENT_VERSION);
            session
                .on_data(&handshake_rejected(server), &mut Vec::new())
                .unwrap();

            assert_eq!(reply.recv().unwrap(), Ok(HandshakeReply::Retry(server)));
            assert_eq!(session.state(), ConnectionState::Handshaking);

            let reply = start_handshake(&mut session, server);
            session
                .on_data(&handshake_accepted(None), &mut Vec::new())
                .unwrap();
            assert_eq!(reply.recv().unwrap(), Ok(HandshakeReply::Established(server)));
            assert_eq!(session.protocol_version(), server);
            assert_eq!(session.node_id(), None);
        }
    }

    #[test]
    fn rejected_handshake_is_fatal() {
        let mut session = Session::new(true);
        session.on_connected().unwrap();
        let reply = start_handshake(&mut session, CURRENT_VERSION);

        let err = session
            .on_data(&handshake_rejected(VERSION_1_0_0), &mut Vec::new())
            .unwrap_err();
        assert!(matches!(err, ClientError::ProtocolVersionMismatch { .. }));
        assert_eq!(reply.recv().unwrap(), Err(err.clone()));

        let teardown = session.disconnect(Some(err)).unwrap();
        assert!(!teardown.notify);
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn requests_rejected_outside_connected_state() {
        let mut session = Session::new(false);
        assert_eq!(
            session.ensure_connected(),
            Err(ClientError::IllegalState(ConnectionState::Initial))
        );

        session.disconnect(None);
        assert_eq!(
            session.ensure_connected(),
            Err(ClientError::IllegalState(ConnectionState::Disconnected))
        );
    }

    #[test]
    fn coalesced_responses_dispatch_in_order() {
        let mut session = connected_session();
        let (first, first_handle) = register_read_i32(&mut session);
        let (second, second_handle) = register_read_i32(&mut session);

        let mut chunk = ok_response(second, 20).to_vec();
        chunk.extend_from_slice(&ok_response(first, 10));
        let mut dispatches = Vec::new();
        session.on_data(&chunk, &mut dispatches).unwrap();

        let order = dispatches.iter().map(|d| d.request_id()).collect::<Vec<_>>();
        assert_eq!(order, vec![second, first]);
        deliver_all(dispatches);

        assert_eq!(first_handle.wait().unwrap(), 10);
        assert_eq!(second_handle.wait().unwrap(), 20);
        assert_eq!(session.pending_requests(), 0);
    }

    #[test]
    fn response_split_across_reads() {
        for pieces in 1..=10 {
            let mut session = connected_session();
            let (id, handle) = register_read_i32(&mut session);
            let response = ok_response(id, 77);
            let step = response.len().div_ceil(pieces);

            let mut dispatches = Vec::new();
            for chunk in response.chunks(step) {
                session.on_data(chunk, &mut dispatches).unwrap();
            }
            assert_eq!(dispatches.len(), 1, "split into {pieces} pieces");
            deliver_all(dispatches);
            assert_eq!(handle.wait().unwrap(), 77);
        }
    }

    #[test]
    fn handshake_and_response_in_one_chunk() {
        let mut session = Session::new(false);
        session.on_connected().unwrap();
        let reply = start_handshake(&mut session, CURRENT_VERSION);

        let mut chunk = handshake_accepted(Some(Uuid::from_u128(9))).to_vec();
        chunk.extend_from_slice(&ok_response(1, 5));

        let err = session.on_data(&chunk, &mut Vec::new()).unwrap_err();
        assert_eq!(
            err,
            ClientError::InternalProtocol("no pending request with id 1".to_string())
        );
        assert!(reply.recv().unwrap().is_ok());
    }

    #[test]
    fn unknown_request_id_is_fatal() {
        let mut session = connected_session();
        let (_id, handle) = register_read_i32(&mut session);

        let err = session
            .on_data(&ok_response(42, 1), &mut Vec::new())
            .unwrap_err();
        assert!(matches!(err, ClientError::InternalProtocol(_)));

        let mut teardown = session.disconnect(Some(err)).unwrap();
        teardown.fail_requests();
        assert!(matches!(
            handle.wait(),
            Err(ClientError::LostConnection(Some(cause))) if cause.contains("id 42")
        ));
    }

    #[test]
    fn topology_update_precedes_failure() {
        let mut session = connected_session();
        let (id, handle) = register_read_i32(&mut session);
        let response = frame(|w| {
            w.write_i64(id);
            w.write_i16(FLAG_ERROR | FLAG_AFFINITY_TOPOLOGY_CHANGED);
            w.write_i64(3);
            w.write_i32(0);
            w.write_i32(1000);
            w.write_string(Some("cache not found")).unwrap();
        });

        let mut dispatches = Vec::new();
        session.on_data(&response, &mut dispatches).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&seen);
        let listener = move |version: AffinityTopologyVersion| {
            recorded.lock().unwrap().push(version);
        };
        for dispatch in dispatches {
            dispatch.deliver(Some(&listener));
            assert_eq!(seen.lock().unwrap().len(), 1);
        }

        assert_eq!(
            seen.lock().unwrap()[0],
            AffinityTopologyVersion { major: 3, minor: 0 }
        );
        assert_eq!(
            handle.wait(),
            Err(ClientError::Operation {
                code: Some(1000),
                message: "cache not found".to_string()
            })
        );
    }

    #[test]
    fn legacy_responses_use_status_code() {
        let mut session = Session::new(false);
        session.on_connected().unwrap();
        let _reply = start_handshake(&mut session, VERSION_1_2_0);
        session
            .on_data(&handshake_accepted(None), &mut Vec::new())
            .unwrap();

        let (id, handle) = register_read_i32(&mut session);
        let response = frame(|w| {
            w.write_i64(id);
            w.write_i32(0);
            w.write_i32(314);
        });
        let mut dispatches = Vec::new();
        session.on_data(&response, &mut dispatches).unwrap();
        deliver_all(dispatches);

        assert_eq!(handle.wait().unwrap(), 314);
    }

    #[test]
    fn disconnect_sweeps_every_request_once() {
        let mut session = connected_session();
        let handles = (0..5)
            .map(|_| register_read_i32(&mut session).1)
            .collect::<Vec<_>>();

        let cause = ClientError::Io("connection reset by peer".to_string());
        let mut teardown = session.disconnect(Some(cause.clone())).unwrap();
        assert_eq!(session.last_error(), Some(&cause));
        assert!(teardown.notify);
        assert_eq!(teardown.requests.len(), 5);
        assert_eq!(session.pending_requests(), 0);
        teardown.fail_requests();

        for handle in handles {
            assert_eq!(
                handle.wait(),
                Err(ClientError::LostConnection(Some(
                    "transport io error: connection reset by peer".to_string()
                )))
            );
        }
        assert!(session.disconnect(None).is_none());
        assert_eq!(session.last_error(), Some(&cause));
    }

    #[test]
    fn register_after_disconnect_reports_lost_connection() {
        let mut session = connected_session();
        session.disconnect(None);

        let (completion, _handle) = response_channel(|_| Ok(()));
        let writer: PayloadWriter = Box::new(|_: &mut MessageWriter| Ok(()));
        let request = PendingRequest::new(10, 1, writer, completion);

        assert_eq!(
            session.register(request),
            Err(ClientError::LostConnection(None))
        );
    }
}

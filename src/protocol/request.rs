use std::{
    collections::HashMap,
    fmt,
    sync::mpsc::{self, Receiver, SyncSender, TryRecvError},
};

use bytes::Bytes;

use crate::{
    buffer::{MessageReader, MessageWriter},
    error::{ClientError, Result},
};

use super::ProtocolVersion;

/// Serializes a request payload into the outgoing frame.
pub type PayloadWriter = Box<dyn FnOnce(&mut MessageWriter) -> Result<()> + Send>;

type ResponseCallback = Box<dyn FnOnce(Result<MessageReader>) + Send>;

/// Result of one handshake exchange as seen by `connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandshakeReply {
    Established(ProtocolVersion),
    Retry(ProtocolVersion),
}

pub(crate) type HandshakeSender = SyncSender<Result<HandshakeReply>>;

/// How a pending request reports its single outcome.
pub(crate) enum Completion {
    Handshake(HandshakeSender),
    /// Runs the payload reader on success, then hands the typed result to the caller.
    Response(ResponseCallback),
}

/// A request handed to the transport and waiting for its response frame.
pub struct PendingRequest {
    id: i64,
    op_code: Option<i16>,
    payload_writer: Option<PayloadWriter>,
    completion: Completion,
}

impl PendingRequest {
    pub(crate) fn new(
        id: i64,
        op_code: i16,
        payload_writer: PayloadWriter,
        completion: Completion,
    ) -> Self {
        Self {
            id,
            op_code: Some(op_code),
            payload_writer: Some(payload_writer),
            completion,
        }
    }

    pub(crate) fn handshake(
        id: i64,
        payload_writer: PayloadWriter,
        reply: HandshakeSender,
    ) -> Self {
        Self {
            id,
            op_code: None,
            payload_writer: Some(payload_writer),
            completion: Completion::Handshake(reply),
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn op_code(&self) -> Option<i16> {
        self.op_code
    }

    pub fn is_handshake(&self) -> bool {
        matches!(self.completion, Completion::Handshake(_))
    }

    /// Assembles the complete frame: length, header (non-handshake only) and payload.
    pub(crate) fn build_message(&mut self) -> Result<Bytes> {
        let mut writer = MessageWriter::framed();
        if let Some(op_code) = self.op_code {
            writer.write_i16(op_code);
            writer.write_i64(self.id);
        }
        if let Some(payload_writer) = self.payload_writer.take() {
            payload_writer(&mut writer)?;
        }
        writer.finish_frame()
    }

    pub(crate) fn resolve_handshake(self, reply: Result<HandshakeReply>) {
        match self.completion {
            Completion::Handshake(sender) => {
                let _ = sender.send(reply);
            }
            Completion::Response(callback) => callback(Err(ClientError::InternalProtocol(
                format!("request {} got a handshake response", self.id),
            ))),
        }
    }

    /// Hands the response body, positioned at the payload, to the waiting caller.
    pub(crate) fn complete(self, outcome: Result<MessageReader>) {
        match self.completion {
            Completion::Handshake(sender) => {
                let reply = match outcome {
                    Ok(_) => Err(ClientError::InternalProtocol(format!(
                        "handshake {} got a regular response",
                        self.id
                    ))),
                    Err(e) => Err(e),
                };
                let _ = sender.send(reply);
            }
            Completion::Response(callback) => callback(outcome),
        }
    }

    pub(crate) fn fail(self, error: ClientError) {
        self.complete(Err(error));
    }
}

impl fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("id", &self.id)
            .field("op_code", &self.op_code)
            .field("handshake", &self.is_handshake())
            .finish()
    }
}

/// Builds the completion for a typed request together with the caller's handle.
pub(crate) fn response_channel<T, R>(payload_reader: R) -> (Completion, ResponseHandle<T>)
where
    T: Send + 'static,
    R: FnOnce(&mut MessageReader) -> Result<T> + Send + 'static,
{
    let (sender, receiver) = mpsc::sync_channel(1);
    let callback: ResponseCallback = Box::new(move |outcome: Result<MessageReader>| {
        let result = outcome.and_then(|mut payload| payload_reader(&mut payload));
        let _ = sender.send(result);
    });
    (Completion::Response(callback), ResponseHandle { receiver })
}

/// Caller side of an in-flight request. Yields exactly one outcome.
#[derive(Debug)]
pub struct ResponseHandle<T> {
    receiver: Receiver<Result<T>>,
}

impl<T> ResponseHandle<T> {
    /// Blocks until the response arrives or the connection is lost.
    pub fn wait(self) -> Result<T> {
        self.receiver
            .recv()
            .unwrap_or(Err(ClientError::LostConnection(None)))
    }

    /// Returns the outcome if it is already available.
    pub fn try_wait(&self) -> Option<Result<T>> {
        match self.receiver.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(ClientError::LostConnection(None))),
        }
    }
}

/// Requests awaiting a response, keyed by request id.
#[derive(Debug, Default)]
pub struct RequestTable {
    pending: HashMap<i64, PendingRequest>,
}

impl RequestTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, request: PendingRequest) -> Result<()> {
        if self.pending.contains_key(&request.id) {
            return Err(ClientError::InternalProtocol(format!(
                "request id {} is already in flight",
                request.id
            )));
        }
        self.pending.insert(request.id, request);
        Ok(())
    }

    pub fn take(&mut self, id: i64) -> Option<PendingRequest> {
        self.pending.remove(&id)
    }

    /// Empties the table, oldest request first.
    pub fn drain(&mut self) -> Vec<PendingRequest> {
        let mut requests = self.pending.drain().map(|(_, r)| r).collect::<Vec<_>>();
        requests.sort_by_key(|r| r.id);
        requests
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

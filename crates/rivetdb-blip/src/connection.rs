//! A BLIP connection: multiplexes outgoing messages into interleaved
//! frames over a transport, reassembles incoming frames, matches responses
//! to requests by message number, dispatches requests to handlers by their
//! `Profile` property, and exchanges flow-control acks.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use rivetdb_core::error::{NetworkError, Result, RivetError};
use rivetdb_core::varint;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::message::{MessageBuilder, MessageIn, MessageInProgress, MessageOut, parse_frame};
use crate::protocol::*;
use crate::transport::Transport;

type RequestHandler = Arc<dyn Fn(MessageIn, Responder) + Send + Sync>;

enum Cmd {
    SendRequest {
        builder: MessageBuilder,
        reply: Option<oneshot::Sender<Result<MessageIn>>>,
    },
    SendResponse {
        builder: MessageBuilder,
        number: MessageNo,
    },
}

fn closed_error() -> RivetError {
    RivetError::Network(NetworkError::ConnectionReset("connection closed".into()))
}

/// Handle for answering one incoming request.
pub struct Responder {
    cmd_tx: mpsc::UnboundedSender<Cmd>,
    number: MessageNo,
    no_reply: bool,
}

impl Responder {
    /// True if the requester forbade a response.
    pub fn no_reply(&self) -> bool {
        self.no_reply
    }

    pub fn respond(self, mut builder: MessageBuilder) {
        if self.no_reply {
            return;
        }
        builder.make_response();
        let _ = self.cmd_tx.send(Cmd::SendResponse {
            builder,
            number: self.number,
        });
    }

    /// Sends an empty success response.
    pub fn ok(self) {
        self.respond(MessageBuilder::request());
    }

    pub fn respond_error(self, domain: &str, code: i32, message: &str) {
        let mut builder = MessageBuilder::request();
        builder.make_error(domain, code, message);
        self.respond(builder);
    }

    /// Maps a local error into the wire error envelope.
    pub fn respond_with(self, result: Result<MessageBuilder>) {
        match result {
            Ok(builder) => self.respond(builder),
            Err(e) => self.respond_error(e.domain().as_str(), e.code(), &e.to_string()),
        }
    }
}

/// One side of a BLIP session.
pub struct Connection {
    name: String,
    cmd_tx: mpsc::UnboundedSender<Cmd>,
    handlers: Arc<Mutex<HashMap<String, RequestHandler>>>,
    cancel: CancellationToken,
}

impl Connection {
    /// Starts the I/O loop for `transport` on the current tokio runtime.
    pub fn start(transport: impl Transport + 'static, name: impl Into<String>) -> Arc<Connection> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let handlers: Arc<Mutex<HashMap<String, RequestHandler>>> = Arc::default();
        let cancel = CancellationToken::new();

        let connection = Arc::new(Connection {
            name: name.into(),
            cmd_tx: cmd_tx.clone(),
            handlers: handlers.clone(),
            cancel: cancel.clone(),
        });

        let io = IoState {
            name: connection.name.clone(),
            transport: Box::new(transport),
            cmd_rx,
            cmd_tx,
            handlers,
            cancel,
            outbox: VecDeque::new(),
            next_number: 1,
            pending: HashMap::new(),
            incoming: HashMap::new(),
        };
        tokio::spawn(io.run());
        connection
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers the handler for requests carrying this `Profile`.
    pub fn on_request(
        &self,
        profile: &str,
        handler: impl Fn(MessageIn, Responder) + Send + Sync + 'static,
    ) {
        self.handlers
            .lock()
            .insert(profile.to_string(), Arc::new(handler));
    }

    /// Sends a request and waits for its response. Error responses surface
    /// as `Err`.
    pub async fn send_request(&self, builder: MessageBuilder) -> Result<MessageIn> {
        if builder.no_reply {
            return Err(RivetError::InvalidParameter(
                "no-reply request cannot await a response".into(),
            ));
        }
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Cmd::SendRequest {
                builder,
                reply: Some(tx),
            })
            .map_err(|_| closed_error())?;
        let response = rx.await.map_err(|_| closed_error())??;
        if let Some(error) = response.as_error() {
            return Err(error);
        }
        Ok(response)
    }

    /// Queues a request that must not be answered.
    pub fn send_request_no_reply(&self, mut builder: MessageBuilder) -> Result<()> {
        builder.no_reply = true;
        self.cmd_tx
            .send(Cmd::SendRequest {
                builder,
                reply: None,
            })
            .map_err(|_| closed_error())
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn wait_closed(&self) {
        self.cancel.cancelled().await;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ---------------------------------------------------------------------------
// I/O loop
// ---------------------------------------------------------------------------

struct IoState {
    name: String,
    transport: Box<dyn Transport>,
    cmd_rx: mpsc::UnboundedReceiver<Cmd>,
    cmd_tx: mpsc::UnboundedSender<Cmd>,
    handlers: Arc<Mutex<HashMap<String, RequestHandler>>>,
    cancel: CancellationToken,
    outbox: VecDeque<MessageOut>,
    next_number: MessageNo,
    pending: HashMap<MessageNo, oneshot::Sender<Result<MessageIn>>>,
    // Keyed by (is_response, number): both sides number their requests
    // independently.
    incoming: HashMap<(bool, MessageNo), MessageInProgress>,
}

impl IoState {
    async fn run(mut self) {
        loop {
            let can_send = self.outbox.iter().any(|m| !m.is_paused());
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_cmd(cmd),
                        None => break,
                    }
                }
                frame = self.transport.receive() => {
                    match frame {
                        Ok(Some(frame)) => {
                            if let Err(e) = self.handle_frame(&frame) {
                                warn!(connection = %self.name, error = %e, "dropping bad frame");
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            debug!(connection = %self.name, error = %e, "transport error");
                            break;
                        }
                    }
                }
                _ = std::future::ready(()), if can_send => {
                    if !self.pump_frame().await {
                        break;
                    }
                }
            }
        }
        let _ = self.transport.close().await;
        self.cancel.cancel();
        for (_, tx) in self.pending.drain() {
            let _ = tx.send(Err(closed_error()));
        }
        debug!(connection = %self.name, "connection closed");
    }

    fn handle_cmd(&mut self, cmd: Cmd) {
        match cmd {
            Cmd::SendRequest { builder, reply } => {
                let number = self.next_number;
                self.next_number += 1;
                match builder.build(number) {
                    Ok(message) => {
                        if let Some(reply) = reply {
                            self.pending.insert(number, reply);
                        }
                        self.enqueue(message);
                    }
                    Err(e) => {
                        if let Some(reply) = reply {
                            let _ = reply.send(Err(e));
                        }
                    }
                }
            }
            Cmd::SendResponse { builder, number } => match builder.build(number) {
                Ok(message) => self.enqueue(message),
                Err(e) => warn!(connection = %self.name, error = %e, "response build failed"),
            },
        }
    }

    fn enqueue(&mut self, message: MessageOut) {
        self.outbox.push_back(message);
    }

    // Requeues a partially sent message: urgent messages go back near the
    // front (after other urgent ones, letting one regular message slip in
    // per round), regular messages to the back.
    fn requeue(&mut self, message: MessageOut) {
        if message.is_urgent() {
            let mut pos = self
                .outbox
                .iter()
                .rposition(MessageOut::is_urgent)
                .map_or(0, |i| i + 1);
            if pos == 0 && !self.outbox.is_empty() {
                pos = 1;
            }
            self.outbox.insert(pos, message);
        } else {
            self.outbox.push_back(message);
        }
    }

    // Sends one frame of the next sendable message. False ends the loop.
    async fn pump_frame(&mut self) -> bool {
        let Some(index) = self.outbox.iter().position(|m| !m.is_paused()) else {
            return true;
        };
        let mut message = self.outbox.remove(index).unwrap();
        let max_payload = if message.is_urgent() || self.outbox.is_empty() {
            BIG_FRAME_SIZE
        } else {
            DEFAULT_FRAME_SIZE
        };
        let frame = message.next_frame(max_payload);
        if let Err(e) = self.transport.send(frame).await {
            debug!(connection = %self.name, error = %e, "send failed");
            return false;
        }
        if !message.finished() {
            self.requeue(message);
        }
        true
    }

    fn handle_frame(&mut self, frame: &[u8]) -> Result<()> {
        let (number, flags, payload) = parse_frame(frame)?;
        let Some(message_type) = MessageType::from_bits(flags) else {
            warn!(connection = %self.name, flags, "unknown message type");
            return Ok(());
        };

        if message_type.is_ack() {
            self.handle_ack(message_type, number, payload);
            return Ok(());
        }

        let key = (message_type.is_response(), number);
        let progress = self
            .incoming
            .entry(key)
            .or_insert_with(|| MessageInProgress::new(flags, number));
        let completed = progress.receive_frame(flags, payload)?;

        // Credit the sender periodically while a long message streams in.
        if completed.is_none() && progress.unacked >= ACK_INTERVAL {
            progress.unacked = 0;
            let received = progress.bytes_received;
            if let Some(ack_type) = message_type.ack_type() {
                self.outbox
                    .push_front(MessageOut::ack(ack_type, number, received));
            }
        }

        if let Some(message) = completed {
            self.incoming.remove(&key);
            if message_type.is_response() {
                match self.pending.remove(&number) {
                    Some(tx) => {
                        let _ = tx.send(Ok(message));
                    }
                    None => warn!(connection = %self.name, number, "unmatched response"),
                }
            } else {
                self.dispatch(message);
            }
        }
        Ok(())
    }

    fn handle_ack(&mut self, ack_type: MessageType, number: MessageNo, payload: &[u8]) {
        let Some((received, _)) = varint::get_uvarint(payload) else {
            return;
        };
        let want_response = ack_type == MessageType::AckResponse;
        if let Some(message) = self.outbox.iter_mut().find(|m| {
            m.number == number && m.message_type().is_response() == want_response
        }) {
            message.handle_ack(received);
        }
    }

    fn dispatch(&mut self, message: MessageIn) {
        let responder = Responder {
            cmd_tx: self.cmd_tx.clone(),
            number: message.number,
            no_reply: message.no_reply(),
        };
        let profile = message.profile().unwrap_or("").to_string();
        let handler = self.handlers.lock().get(&profile).cloned();
        match handler {
            Some(handler) => handler(message, responder),
            None => {
                warn!(connection = %self.name, profile, "no handler for request");
                responder.respond_error("BLIP", 404, "no handler for profile");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::loopback;

    fn echo_server() -> (Arc<Connection>, Arc<Connection>) {
        let (a, b) = loopback();
        let server = Connection::start(b, "server");
        server.on_request("echo", |message, responder| {
            let mut reply = MessageBuilder::request();
            reply.write(message.body());
            responder.respond(reply);
        });
        let client = Connection::start(a, "client");
        (client, server)
    }

    #[tokio::test]
    async fn request_response_roundtrip() {
        let (client, _server) = echo_server();
        let mut request = MessageBuilder::with_profile("echo");
        request.write(b"hello");
        let response = client.send_request(request).await.unwrap();
        assert_eq!(response.body(), b"hello");
        assert_eq!(response.message_type(), MessageType::Response);
    }

    #[tokio::test]
    async fn responses_match_their_requests() {
        let (client, _server) = echo_server();
        let mut handles = Vec::new();
        for i in 0..20 {
            let client = client.clone();
            handles.push(tokio::spawn(async move {
                let mut request = MessageBuilder::with_profile("echo");
                let body = format!("payload-{i}");
                request.write(body.as_bytes());
                let response = client.send_request(request).await.unwrap();
                assert_eq!(response.body(), body.as_bytes());
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
    }

    #[tokio::test]
    async fn large_message_flows_with_acks() {
        // Bigger than MAX_UNACKED_BYTES: completion requires ack credits.
        let (client, _server) = echo_server();
        let big: Vec<u8> = (0..400_000u32).map(|i| (i % 251) as u8).collect();
        let mut request = MessageBuilder::with_profile("echo");
        request.write(&big);
        let response = client.send_request(request).await.unwrap();
        assert_eq!(response.body(), big.as_slice());
    }

    #[tokio::test]
    async fn compressed_request() {
        let (client, _server) = echo_server();
        let mut request = MessageBuilder::with_profile("echo");
        request.compressed = true;
        request.write(&vec![b'z'; 50_000]);
        let response = client.send_request(request).await.unwrap();
        assert_eq!(response.body().len(), 50_000);
    }

    #[tokio::test]
    async fn unknown_profile_yields_error() {
        let (client, _server) = echo_server();
        let request = MessageBuilder::with_profile("nonexistent");
        let err = client.send_request(request).await.unwrap_err();
        match err {
            RivetError::RemoteError { domain, code, .. } => {
                assert_eq!(domain, "BLIP");
                assert_eq!(code, 404);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn error_responses_surface_as_errors() {
        let (a, b) = loopback();
        let server = Connection::start(b, "server");
        server.on_request("fail", |_message, responder| {
            responder.respond_error("RivetDB", 2, "conflict");
        });
        let client = Connection::start(a, "client");

        let err = client
            .send_request(MessageBuilder::with_profile("fail"))
            .await
            .unwrap_err();
        match err {
            RivetError::RemoteError { domain, code, message } => {
                assert_eq!(domain, "RivetDB");
                assert_eq!(code, 2);
                assert_eq!(message, "conflict");
            }
            other => panic!("unexpected {other:?}"),
        }
        drop(server);
    }

    #[tokio::test]
    async fn no_reply_requests_get_no_response() {
        let (a, b) = loopback();
        let server = Connection::start(b, "server");
        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let hits2 = hits.clone();
        server.on_request("notify", move |_message, responder| {
            hits2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            assert!(responder.no_reply());
            responder.ok(); // silently dropped
        });
        let client = Connection::start(a, "client");

        client
            .send_request_no_reply(MessageBuilder::with_profile("notify"))
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);
        drop(server);
    }

    #[tokio::test]
    async fn closing_fails_pending_requests() {
        let (a, _b) = loopback();
        let client = Connection::start(a, "client");
        let pending = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .send_request(MessageBuilder::with_profile("void"))
                    .await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        client.close();
        let result = pending.await.unwrap();
        assert!(result.is_err());
    }
}

//! Client connection state machine
//!
//! Each connection runs as one tokio task that owns the transport, the frame
//! engine and all protocol state. The application talks to it through a
//! cloneable [`ConnectionHandle`] and reads [`Event`]s from [`Events`].
//!
//! ```text
//! Connecting -> Handshaking -> Open -> Closing -> Closed
//!      \             \          \________________/
//!       \_____________\______________ Cancelled
//! ```

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, trace, warn};

use crate::Config;
use crate::MAX_CONTROL_PAYLOAD;
use crate::deflate::DeflateConfig;
#[cfg(feature = "permessage-deflate")]
use crate::deflate::PerMessageDeflate;
use crate::engine::{FrameEngine, Message, Role};
use crate::error::{CloseReason, Error, Result};
use crate::handshake::{
    AcceptKeyValidator, CertificatePinning, ClientRequest, HandshakeResponse, HeaderValidator,
    Http1Handshake, HttpHandler, generate_key, negotiate_compression, negotiate_protocol,
};
use crate::transport::{TcpTransport, Transport, TransportEvent};

/// Buffered transport notifications per connection
const TRANSPORT_EVENT_CAPACITY: usize = 64;

/// Longest close reason that fits a control frame next to the status code
const MAX_CLOSE_REASON: usize = MAX_CONTROL_PAYLOAD - 2;

/// Lifecycle state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Transport is being opened
    Connecting,
    /// Upgrade request sent, waiting for the response
    Handshaking,
    /// Messages flow both ways
    Open,
    /// Close frame sent, waiting for the peer
    Closing,
    /// Finished
    Closed,
    /// Cancelled locally, no further events
    Cancelled,
}

impl ConnectionState {
    /// Whether the connection has ended
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Cancelled)
    }

    /// Whether application writes are accepted
    #[inline]
    pub fn can_send(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Handshaking => "handshaking",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
            ConnectionState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Something the application should know about
#[derive(Debug)]
pub enum Event {
    /// Handshake completed; `protocol` is the selected sub-protocol
    Connected {
        /// Sub-protocol chosen by the server
        protocol: Option<String>,
    },
    /// The connection ended after it was open
    Disconnected {
        /// Close reason or a description of the failure
        reason: String,
        /// Close status code
        code: u16,
    },
    /// Text message
    Text(String),
    /// Binary message
    Binary(Bytes),
    /// Ping received (already answered when auto-pong is on)
    Ping(Bytes),
    /// Pong received
    Pong(Bytes),
    /// The connection failed before it opened
    Error(Error),
    /// Transport path viability changed
    ViabilityChanged(bool),
    /// The transport suggests reconnecting over a better path
    ReconnectSuggested(bool),
    /// The connection was cancelled
    Cancelled,
}

/// Stream of events for one connection. Ends after the terminal event.
#[derive(Debug)]
pub struct Events {
    rx: mpsc::Receiver<Event>,
}

impl Events {
    /// Receive the next event
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}

impl Stream for Events {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        self.rx.poll_recv(cx)
    }
}

#[derive(Debug)]
enum Command {
    Write(Message),
    WriteRaw(Bytes),
    Disconnect { code: u16, reason: String },
    ForceDisconnect,
    Cancel,
}

/// Cloneable handle for driving a connection from any task
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    /// Raised by `cancel`, seen even while the task is blocked on `Events`
    cancel: Arc<watch::Sender<bool>>,
}

impl ConnectionHandle {
    fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| match self.state() {
            ConnectionState::Cancelled => Error::Cancelled,
            _ => Error::ConnectionClosed,
        })
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Whether messages can currently be written
    pub fn is_open(&self) -> bool {
        self.state().can_send()
    }

    /// Queue a message. Writes reaching the connection while it is not open
    /// are dropped. A close message starts the close handshake.
    pub fn write(&self, message: Message) -> Result<()> {
        match message {
            Message::Close(reason) => match reason {
                Some(reason) => self.close(reason.code, &reason.reason),
                None => self.disconnect(None),
            },
            Message::Ping(ref payload) | Message::Pong(ref payload)
                if payload.len() > MAX_CONTROL_PAYLOAD =>
            {
                Err(Error::Protocol("control frame payload exceeds 125 bytes"))
            }
            other => self.send(Command::Write(other)),
        }
    }

    /// Queue a text message
    pub fn write_text(&self, text: impl Into<String>) -> Result<()> {
        self.write(Message::text(text))
    }

    /// Queue a binary message
    pub fn write_binary(&self, data: impl Into<Bytes>) -> Result<()> {
        self.write(Message::binary(data))
    }

    /// Queue a ping
    pub fn write_ping(&self, data: impl Into<Bytes>) -> Result<()> {
        self.write(Message::ping(data))
    }

    /// Queue an unsolicited pong
    pub fn write_pong(&self, data: impl Into<Bytes>) -> Result<()> {
        self.write(Message::pong(data))
    }

    /// Start the close handshake with `code` (1000 when `None`)
    pub fn disconnect(&self, code: Option<u16>) -> Result<()> {
        self.close(code.unwrap_or(CloseReason::NORMAL), "")
    }

    /// Start the close handshake with a status code and reason
    pub fn close(&self, code: u16, reason: &str) -> Result<()> {
        if !CloseReason::is_valid_code(code) {
            return Err(Error::InvalidCloseCode(code));
        }
        if reason.len() > MAX_CLOSE_REASON {
            return Err(Error::Protocol("close reason exceeds 123 bytes"));
        }
        self.send(Command::Disconnect {
            code,
            reason: reason.to_string(),
        })
    }

    /// Drop the transport without a close handshake
    pub fn force_disconnect(&self) -> Result<()> {
        self.send(Command::ForceDisconnect)
    }

    /// Abort the connection. Emits a single `Cancelled` event and nothing after.
    pub fn cancel(&self) -> Result<()> {
        self.cancel.send_replace(true);
        self.send(Command::Cancel)
    }

    /// Write pre-encoded bytes straight to the transport while open.
    ///
    /// For conformance harnesses that need frames the engine would never
    /// produce on its own.
    pub fn write_raw_frames(&self, frames: Bytes) -> Result<()> {
        self.send(Command::WriteRaw(frames))
    }
}

/// A client connection ready to be started
pub struct Connection<T> {
    request: ClientRequest,
    transport: T,
    config: Config,
    http: Box<dyn HttpHandler>,
    validator: Box<dyn HeaderValidator>,
    pinning: Option<Box<dyn CertificatePinning>>,
}

impl Connection<TcpTransport> {
    /// Plain-TCP connection to a `ws://` URL
    pub fn tcp(url: &str, config: Config) -> Result<Self> {
        Ok(Self::new(ClientRequest::parse(url)?, TcpTransport::new(), config))
    }
}

impl<T: Transport> Connection<T> {
    /// Connection to `request` over `transport`, using the HTTP/1.1 upgrade
    /// and accept-key validation
    pub fn new(request: ClientRequest, transport: T, config: Config) -> Self {
        let http = Box::new(Http1Handshake::new(config.max_handshake_size));
        Self {
            request,
            transport,
            config,
            http,
            validator: Box::new(AcceptKeyValidator),
            pinning: None,
        }
    }

    /// Replace the HTTP upgrade implementation
    pub fn with_http_handler(mut self, handler: impl HttpHandler + 'static) -> Self {
        self.http = Box::new(handler);
        self
    }

    /// Replace the response validator
    pub fn with_header_validator(mut self, validator: impl HeaderValidator + 'static) -> Self {
        self.validator = Box::new(validator);
        self
    }

    /// Check the transport's peer certificates before the upgrade
    pub fn with_certificate_pinning(mut self, pinning: impl CertificatePinning + 'static) -> Self {
        self.pinning = Some(Box::new(pinning));
        self
    }

    /// Spawn the connection task. Must be called within a tokio runtime.
    pub fn connect(self) -> (ConnectionHandle, Events) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(self.config.event_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let actor = Actor {
            engine: FrameEngine::new(Role::Client, &self.config),
            request: self.request,
            transport: self.transport,
            config: self.config,
            http: self.http,
            validator: self.validator,
            pinning: self.pinning,
            state: ConnectionState::Connecting,
            events: event_tx,
            state_tx,
            close_sent: None,
            close_deadline: None,
            cancel_rx,
            stalled: None,
        };
        tokio::spawn(actor.run(command_rx));

        (
            ConnectionHandle {
                commands: command_tx,
                state: state_rx,
                cancel: Arc::new(cancel_tx),
            },
            Events { rx: event_rx },
        )
    }
}

impl<T> fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("request", &self.request)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Reason to stop before the connection opened
enum Interrupt {
    Cancel,
    Disconnect(u16),
}

/// Why an event was dropped instead of delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stall {
    Cancelled,
    CloseTimedOut,
}

/// Map a command received before `Open`
fn pre_open(command: Option<Command>) -> Option<Interrupt> {
    match command {
        Some(Command::Cancel) => Some(Interrupt::Cancel),
        Some(Command::Disconnect { code, .. }) => Some(Interrupt::Disconnect(code)),
        Some(Command::ForceDisconnect) | None => Some(Interrupt::Disconnect(CloseReason::NORMAL)),
        Some(Command::Write(_)) | Some(Command::WriteRaw(_)) => {
            debug!("dropping write issued before the connection opened");
            None
        }
    }
}

struct Actor<T> {
    request: ClientRequest,
    transport: T,
    config: Config,
    http: Box<dyn HttpHandler>,
    validator: Box<dyn HeaderValidator>,
    pinning: Option<Box<dyn CertificatePinning>>,
    engine: FrameEngine,
    state: ConnectionState,
    events: mpsc::Sender<Event>,
    state_tx: watch::Sender<ConnectionState>,
    /// Status code of the close frame we sent
    close_sent: Option<u16>,
    close_deadline: Option<Instant>,
    cancel_rx: watch::Receiver<bool>,
    /// Set when a full event queue was abandoned; acted on by the main loop
    stalled: Option<Stall>,
}

impl<T: Transport> Actor<T> {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let (transport_tx, mut transport_rx) = mpsc::channel(TRANSPORT_EVENT_CAPACITY);

        debug!(host = %self.request.host, path = %self.request.path, "connecting");
        let connected = {
            let connect = self.transport.connect(&self.request, transport_tx);
            tokio::pin!(connect);
            loop {
                tokio::select! {
                    result = &mut connect => break Ok(result),
                    command = commands.recv() => {
                        if let Some(interrupt) = pre_open(command) {
                            break Err(interrupt);
                        }
                    }
                }
            }
        };
        match connected {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return self.fail_before_open(e.into()).await,
            Err(interrupt) => return self.interrupt(interrupt).await,
        }

        if let Err(e) = self.check_pinning() {
            return self.fail_before_open(e).await;
        }

        self.set_state(ConnectionState::Handshaking);
        let key = generate_key();
        let offer = self.compression_offer();
        let offer_header = offer.as_ref().map(DeflateConfig::to_offer_header);
        let upgrade = self
            .http
            .build_request(&self.request, &key, offer_header.as_deref());
        if let Err(e) = self.transport.write(upgrade).await {
            return self.fail_before_open(e.into()).await;
        }

        let mut head = BytesMut::new();
        let (protocol, leftover) = loop {
            tokio::select! {
                event = transport_rx.recv() => match event {
                    Some(TransportEvent::Received(bytes)) => {
                        head.extend_from_slice(&bytes);
                        let parsed = match self.http.parse_response(&head) {
                            Ok(parsed) => parsed,
                            Err(e) => return self.fail_before_open(e).await,
                        };
                        let Some((response, len)) = parsed else {
                            continue;
                        };
                        match self.accept_response(&response, &key, offer.as_ref()) {
                            Ok(protocol) => break (protocol, head.split_off(len)),
                            Err(e) => return self.fail_before_open(e).await,
                        }
                    }
                    Some(TransportEvent::Viability(_)) | Some(TransportEvent::BetterPath(_)) => {}
                    Some(TransportEvent::Closed) | None => {
                        return self.fail_before_open(Error::ConnectionClosed).await;
                    }
                    Some(TransportEvent::Failed(e)) => return self.fail_before_open(e.into()).await,
                },
                command = commands.recv() => {
                    if let Some(interrupt) = pre_open(command) {
                        return self.interrupt(interrupt).await;
                    }
                }
            }
        };

        self.set_state(ConnectionState::Open);
        self.emit(Event::Connected { protocol }).await;
        if !leftover.is_empty() {
            self.handle_incoming(&leftover).await;
        }

        let mut commands_open = true;
        let mut transport_open = true;
        while !self.state.is_terminal() {
            match self.stalled.take() {
                Some(Stall::Cancelled) => {
                    self.cancel().await;
                    break;
                }
                Some(Stall::CloseTimedOut) => {
                    self.on_close_timeout().await;
                    break;
                }
                None => {}
            }
            let deadline = self.close_deadline;
            tokio::select! {
                event = transport_rx.recv(), if transport_open => match event {
                    Some(event) => self.on_transport_event(event).await,
                    None => {
                        transport_open = false;
                        self.on_transport_event(TransportEvent::Closed).await;
                    }
                },
                command = commands.recv(), if commands_open => match command {
                    Some(command) => self.on_command(command).await,
                    None => {
                        // every handle is gone; close politely
                        commands_open = false;
                        self.start_close(CloseReason::NORMAL, String::new()).await;
                    }
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.on_close_timeout().await;
                }
                else => break,
            }
        }
        trace!(state = %self.state, "connection task finished");
    }

    fn set_state(&mut self, state: ConnectionState) {
        debug!(from = %self.state, to = %state, "connection state");
        self.state = state;
        self.state_tx.send_replace(state);
    }

    /// Deliver an event, giving up if a cancel or the close deadline arrives
    /// while the application is not draining `Events`
    async fn emit(&mut self, event: Event) {
        if self.stalled.is_some() {
            return;
        }
        let deadline = self.close_deadline;
        tokio::select! {
            biased;
            _ = cancel_requested(&mut self.cancel_rx) => {
                debug!("dropping event, connection cancelled");
                self.stalled = Some(Stall::Cancelled);
            }
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                debug!("dropping event, close handshake timed out");
                self.stalled = Some(Stall::CloseTimedOut);
            }
            result = self.events.send(event) => {
                if result.is_err() {
                    trace!("event receiver dropped");
                }
            }
        }
    }

    /// Deliver the last event of the connection
    async fn emit_final(&mut self, event: Event) {
        if self.events.send(event).await.is_err() {
            trace!("event receiver dropped");
        }
    }

    fn check_pinning(&self) -> Result<()> {
        let Some(pinning) = self.pinning.as_ref() else {
            return Ok(());
        };
        let certificates = self.transport.peer_certificates().unwrap_or_default();
        if pinning.evaluate_trust(&certificates, &self.request.host) {
            Ok(())
        } else {
            Err(Error::HandshakeFailed("peer certificate rejected"))
        }
    }

    #[cfg(feature = "permessage-deflate")]
    fn compression_offer(&self) -> Option<DeflateConfig> {
        self.config.compression.clone()
    }

    #[cfg(not(feature = "permessage-deflate"))]
    fn compression_offer(&self) -> Option<DeflateConfig> {
        None
    }

    #[cfg(feature = "permessage-deflate")]
    fn install_compression(&mut self, negotiated: Option<DeflateConfig>) {
        if let Some(config) = negotiated {
            debug!(?config, "permessage-deflate negotiated");
            self.engine
                .set_extension(Some(Box::new(PerMessageDeflate::client(config))));
        }
    }

    #[cfg(not(feature = "permessage-deflate"))]
    fn install_compression(&mut self, _negotiated: Option<DeflateConfig>) {}

    fn accept_response(
        &mut self,
        response: &HandshakeResponse,
        key: &str,
        offer: Option<&DeflateConfig>,
    ) -> Result<Option<String>> {
        self.validator.validate(response, key)?;
        let protocol = negotiate_protocol(&self.request, response)?;
        let compression = negotiate_compression(offer, response)?;
        self.install_compression(compression);
        Ok(protocol)
    }

    async fn handle_incoming(&mut self, data: &[u8]) {
        let results: Vec<Result<Message>> = self.engine.received_data(data).collect();
        for result in results {
            if self.state.is_terminal() || self.stalled.is_some() {
                break;
            }
            match result {
                Ok(message) => self.on_message(message).await,
                Err(e) => {
                    self.fail_protocol(e).await;
                    break;
                }
            }
        }
    }

    async fn on_message(&mut self, message: Message) {
        match message {
            Message::Text(payload) => {
                // already validated unless lenient_utf8 is set
                let text = String::from_utf8_lossy(&payload).into_owned();
                self.emit(Event::Text(text)).await;
            }
            Message::Binary(payload) => self.emit(Event::Binary(payload)).await,
            Message::Ping(payload) => {
                if self.config.auto_pong && self.state == ConnectionState::Open {
                    self.send(&Message::Pong(payload.clone())).await;
                }
                if !self.state.is_terminal() {
                    self.emit(Event::Ping(payload)).await;
                }
            }
            Message::Pong(payload) => self.emit(Event::Pong(payload)).await,
            Message::Close(reason) => self.on_close_frame(reason).await,
        }
    }

    async fn on_close_frame(&mut self, reason: Option<CloseReason>) {
        let (code, text) = match reason {
            Some(reason) => (reason.code, reason.reason),
            None => (CloseReason::NORMAL, String::new()),
        };

        match self.state {
            ConnectionState::Open => {
                debug!(code, "close received, echoing");
                self.set_state(ConnectionState::Closing);
                let echo = Message::Close(Some(CloseReason::new(code, "")));
                if self.send(&echo).await {
                    self.close_sent = Some(code);
                    self.finish(text, code).await;
                }
            }
            ConnectionState::Closing => {
                debug!(code, "close handshake complete");
                self.finish(text, code).await;
            }
            _ => {}
        }
    }

    /// Encode and write one message; false if the connection died doing so
    async fn send(&mut self, message: &Message) -> bool {
        let mut buf = BytesMut::new();
        if let Err(e) = self.engine.encode_message(message, &mut buf) {
            warn!(error = %e, "failed to encode outgoing message");
            let code = e.close_code();
            self.finish(e.to_string(), code).await;
            return false;
        }
        match self.transport.write(buf.freeze()).await {
            Ok(()) => true,
            Err(e) => {
                self.on_transport_failed(e).await;
                false
            }
        }
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Received(bytes) => self.handle_incoming(&bytes).await,
            TransportEvent::Viability(viable) => {
                if self.state == ConnectionState::Open {
                    self.emit(Event::ViabilityChanged(viable)).await;
                }
            }
            TransportEvent::BetterPath(better) => {
                if self.state == ConnectionState::Open {
                    self.emit(Event::ReconnectSuggested(better)).await;
                }
            }
            TransportEvent::Closed => match self.state {
                ConnectionState::Closing => {
                    let code = self.close_sent.unwrap_or(CloseReason::NORMAL);
                    self.finish("connection closed".to_string(), code).await;
                }
                ConnectionState::Open => {
                    debug!("transport closed without a close frame");
                    self.finish("connection closed by peer".to_string(), CloseReason::ABNORMAL)
                        .await;
                }
                _ => {}
            },
            TransportEvent::Failed(e) => self.on_transport_failed(e).await,
        }
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Write(message) => {
                if !self.state.can_send() {
                    debug!(state = %self.state, "dropping write, connection not open");
                    return;
                }
                self.send(&message).await;
            }
            Command::WriteRaw(frames) => {
                if !self.state.can_send() {
                    debug!(state = %self.state, "dropping raw write, connection not open");
                    return;
                }
                if let Err(e) = self.transport.write(frames).await {
                    self.on_transport_failed(e).await;
                }
            }
            Command::Disconnect { code, reason } => self.start_close(code, reason).await,
            Command::ForceDisconnect => {
                if !self.state.is_terminal() {
                    self.finish("force disconnected".to_string(), CloseReason::NORMAL)
                        .await;
                }
            }
            Command::Cancel => self.cancel().await,
        }
    }

    /// Send our close frame and wait for the peer, bounded by `close_timeout`
    async fn start_close(&mut self, code: u16, reason: String) {
        if self.state != ConnectionState::Open {
            return;
        }
        debug!(code, "starting close handshake");
        self.set_state(ConnectionState::Closing);
        if self
            .send(&Message::Close(Some(CloseReason::new(code, reason))))
            .await
        {
            self.close_sent = Some(code);
            self.close_deadline = Some(Instant::now() + self.config.close_timeout);
        }
    }

    async fn on_close_timeout(&mut self) {
        warn!(timeout = ?self.config.close_timeout, "peer did not answer close frame");
        self.finish(
            "close handshake timed out".to_string(),
            CloseReason::ABNORMAL,
        )
        .await;
    }

    async fn fail_protocol(&mut self, err: Error) {
        let code = err.close_code();
        warn!(error = %err, code, "protocol violation, closing connection");
        if self.state == ConnectionState::Open && CloseReason::is_valid_code(code) {
            let mut buf = BytesMut::new();
            let close = Message::Close(Some(CloseReason::new(code, "")));
            if self.engine.encode_message(&close, &mut buf).is_ok() {
                match self.transport.write(buf.freeze()).await {
                    Ok(()) => self.close_sent = Some(code),
                    Err(e) => trace!(error = %e, "failed to send close frame"),
                }
            }
        }
        self.finish(err.to_string(), code).await;
    }

    async fn on_transport_failed(&mut self, err: io::Error) {
        if self.state.is_terminal() {
            return;
        }
        debug!(error = %err, "transport failed");
        self.finish(err.to_string(), CloseReason::ABNORMAL).await;
    }

    /// Tear down and report `Disconnected`
    async fn finish(&mut self, reason: String, code: u16) {
        self.transport.disconnect().await;
        self.close_deadline = None;
        self.set_state(ConnectionState::Closed);
        self.emit_final(Event::Disconnected { reason, code }).await;
    }

    async fn fail_before_open(&mut self, err: Error) {
        warn!(error = %err, "connection failed before opening");
        self.transport.disconnect().await;
        self.set_state(ConnectionState::Closed);
        self.emit_final(Event::Error(err)).await;
    }

    async fn interrupt(&mut self, interrupt: Interrupt) {
        match interrupt {
            Interrupt::Cancel => self.cancel().await,
            Interrupt::Disconnect(code) => {
                self.finish("disconnected before open".to_string(), code)
                    .await;
            }
        }
    }

    async fn cancel(&mut self) {
        debug!(state = %self.state, "cancelled");
        self.transport.disconnect().await;
        self.engine.reset();
        self.close_deadline = None;
        self.set_state(ConnectionState::Cancelled);
        self.emit_final(Event::Cancelled).await;
    }
}

/// Resolves once the handle raised the cancel flag. Never resolves if every
/// handle is gone without cancelling.
async fn cancel_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        let cancelled = *rx.borrow_and_update();
        if cancelled {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

//! In-memory transport and a scripted server for integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use sockudo_wsengine::handshake::{
    ClientRequest, UpgradeRequest, build_response, generate_accept_key, parse_request,
};
use sockudo_wsengine::{
    CloseReason, Config, Connection, ConnectionHandle, Event, Events, FrameEngine, Message,
    OpCode, Transport, TransportEvent,
};

pub const URL: &str = "ws://mock.test/ws";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Client side of an in-memory byte pipe
pub struct MockTransport {
    outgoing: Option<mpsc::UnboundedSender<Bytes>>,
    events: Option<oneshot::Sender<mpsc::Sender<TransportEvent>>>,
    refuse: bool,
}

impl MockTransport {
    /// A transport whose connect always fails
    pub fn refusing() -> Self {
        Self {
            outgoing: None,
            events: None,
            refuse: true,
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(
        &mut self,
        _request: &ClientRequest,
        events: mpsc::Sender<TransportEvent>,
    ) -> io::Result<()> {
        if self.refuse {
            return Err(io::Error::from(io::ErrorKind::ConnectionRefused));
        }
        if let Some(slot) = self.events.take() {
            let _ = slot.send(events);
        }
        Ok(())
    }

    async fn write(&mut self, data: Bytes) -> io::Result<()> {
        match &self.outgoing {
            Some(tx) => tx
                .send(data)
                .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe)),
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }

    async fn disconnect(&mut self) {
        self.outgoing = None;
    }
}

/// Server end of the pipe, speaking WebSocket through a server-role engine
pub struct MockServer {
    incoming: mpsc::UnboundedReceiver<Bytes>,
    events_slot: Option<oneshot::Receiver<mpsc::Sender<TransportEvent>>>,
    events: Option<mpsc::Sender<TransportEvent>>,
    buf: BytesMut,
    pub engine: FrameEngine,
    pending: VecDeque<Message>,
}

pub fn mock_pair() -> (MockTransport, MockServer) {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (slot_tx, slot_rx) = oneshot::channel();
    let transport = MockTransport {
        outgoing: Some(out_tx),
        events: Some(slot_tx),
        refuse: false,
    };
    let server = MockServer {
        incoming: out_rx,
        events_slot: Some(slot_rx),
        events: None,
        buf: BytesMut::new(),
        engine: FrameEngine::server(),
        pending: VecDeque::new(),
    };
    (transport, server)
}

impl MockServer {
    async fn events(&mut self) -> mpsc::Sender<TransportEvent> {
        if let Some(slot) = self.events_slot.take() {
            self.events = Some(slot.await.expect("client never connected"));
        }
        self.events.clone().expect("client never connected")
    }

    /// Read the client's upgrade request without answering it
    pub async fn read_request(&mut self) -> UpgradeRequest {
        loop {
            if let Some((request, len)) = parse_request(&self.buf).expect("malformed upgrade request")
            {
                let _ = self.buf.split_to(len);
                return request;
            }
            let chunk = self
                .incoming
                .recv()
                .await
                .expect("client went away before upgrading");
            self.buf.extend_from_slice(&chunk);
        }
    }

    /// Complete the handshake with a plain 101
    pub async fn accept(&mut self) -> UpgradeRequest {
        self.accept_with(None, None).await
    }

    pub async fn accept_with(
        &mut self,
        protocol: Option<&str>,
        extensions: Option<&str>,
    ) -> UpgradeRequest {
        let request = self.read_request().await;
        let response = build_response(&generate_accept_key(&request.key), protocol, extensions);
        self.send_raw(response).await;
        request
    }

    pub async fn notify(&mut self, event: TransportEvent) {
        let events = self.events().await;
        let _ = events.send(event).await;
    }

    /// Deliver bytes to the client as one transport read
    pub async fn send_raw(&mut self, data: impl Into<Bytes>) {
        self.notify(TransportEvent::Received(data.into())).await;
    }

    pub async fn send(&mut self, message: Message) {
        let mut buf = BytesMut::new();
        self.engine
            .encode_message(&message, &mut buf)
            .expect("server failed to encode");
        self.send_raw(buf.freeze()).await;
    }

    /// One unmasked frame, no checks on opcode or size
    pub fn frame(&mut self, opcode: OpCode, payload: &[u8], fin: bool) -> Bytes {
        self.engine
            .create_write_frame(opcode, payload, fin, false)
            .expect("server failed to build frame")
    }

    pub async fn send_frame(&mut self, opcode: OpCode, payload: &[u8], fin: bool) {
        let frame = self.frame(opcode, payload, fin);
        self.send_raw(frame).await;
    }

    /// Next message from the client, `None` once it has disconnected
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            if let Some(message) = self.pending.pop_front() {
                return Some(message);
            }
            let chunk = if self.buf.is_empty() {
                self.incoming.recv().await?
            } else {
                self.buf.split().freeze()
            };
            let messages = self
                .engine
                .process(&chunk)
                .expect("client sent an invalid frame");
            self.pending.extend(messages);
        }
    }

    /// Skip to the client's close frame
    pub async fn expect_close(&mut self) -> Option<CloseReason> {
        loop {
            match self.recv().await {
                Some(Message::Close(reason)) => return reason,
                Some(_) => continue,
                None => panic!("client disconnected without a close frame"),
            }
        }
    }

    /// Stop reading; every later client write fails with `BrokenPipe`
    pub fn stop_reading(&mut self) {
        let (_tx, closed) = mpsc::unbounded_channel();
        self.incoming = closed;
    }

    /// Wait for the client to drop the transport
    pub async fn wait_disconnect(&mut self) {
        while self.incoming.recv().await.is_some() {}
    }
}

pub fn connect_with(
    request: ClientRequest,
    transport: MockTransport,
    config: Config,
) -> (ConnectionHandle, Events) {
    Connection::new(request, transport, config).connect()
}

pub fn connect(transport: MockTransport, config: Config) -> (ConnectionHandle, Events) {
    connect_with(
        ClientRequest::parse(URL).expect("valid url"),
        transport,
        config,
    )
}

/// Open a connection against a fresh mock server
pub async fn open(config: Config) -> (ConnectionHandle, Events, MockServer) {
    init_tracing();
    let (transport, mut server) = mock_pair();
    let (handle, mut events) = connect(transport, config);
    server.accept().await;
    match events.recv().await {
        Some(Event::Connected { .. }) => {}
        other => panic!("expected Connected, got {:?}", other),
    }
    (handle, events, server)
}

/// Application that echoes every data message and records all events
pub fn echo(handle: ConnectionHandle, mut events: Events) -> JoinHandle<Vec<Event>> {
    tokio::spawn(async move {
        let mut seen = Vec::new();
        while let Some(event) = events.recv().await {
            match &event {
                Event::Text(text) => {
                    let _ = handle.write_text(text.clone());
                }
                Event::Binary(data) => {
                    let _ = handle.write_binary(data.clone());
                }
                _ => {}
            }
            seen.push(event);
        }
        seen
    })
}

/// Last event must be `Disconnected` with `code`
pub fn assert_disconnected(events: &[Event], code: u16) {
    match events.last() {
        Some(Event::Disconnected { code: got, .. }) => assert_eq!(*got, code, "{:?}", events),
        other => panic!("expected Disconnected({}), got {:?}", code, other),
    }
    let terminal = events
        .iter()
        .filter(|e| matches!(e, Event::Disconnected { .. } | Event::Error(_)))
        .count();
    assert_eq!(terminal, 1, "exactly one terminal event: {:?}", events);
}

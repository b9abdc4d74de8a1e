//! # Sockudo-WSEngine: RFC 6455 client protocol engine
//!
//! A transport-agnostic WebSocket engine built on Tokio.
//!
//! ## Layers
//!
//! - **Frame codec** ([`frame`]): header parsing with every length branch,
//!   masking, close payloads
//! - **Frame engine** ([`engine`]): chunk-independent reassembly, streaming
//!   UTF-8 validation, interleaved control frames, the outbound writer
//! - **permessage-deflate** ([`deflate`]): RFC 7692 negotiation and
//!   per-direction context takeover
//! - **Connection** ([`connection`]): the lifecycle state machine with
//!   auto-pong, close handshake timeout and viability signals
//!
//! ## Example
//!
//! ```no_run
//! use sockudo_wsengine::{Config, Connection, Event};
//!
//! # async fn run() -> sockudo_wsengine::Result<()> {
//! let (handle, mut events) = Connection::tcp("ws://127.0.0.1:9001/", Config::default())?.connect();
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         Event::Connected { .. } => handle.write_text("hello")?,
//!         Event::Text(text) => println!("{text}"),
//!         Event::Disconnected { code, .. } => println!("closed with {code}"),
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

pub mod connection;
pub mod deflate;
pub mod engine;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod mask;
pub mod transport;
pub mod utf8;

pub use connection::{Connection, ConnectionHandle, ConnectionState, Event, Events};
pub use deflate::DeflateConfig;
pub use engine::{FrameEngine, Message, Role};
pub use error::{CloseReason, Error, Result};
pub use frame::{Frame, OpCode};
pub use handshake::ClientRequest;
pub use transport::{TcpTransport, Transport, TransportEvent};

#[cfg(feature = "permessage-deflate")]
pub use deflate::PerMessageDeflate;

/// Default receive buffer size (64KB for high throughput)
pub const RECV_BUFFER_SIZE: usize = 64 * 1024;

/// Maximum WebSocket frame header size (2 + 8 + 4 = 14 bytes)
pub const MAX_FRAME_HEADER_SIZE: usize = 14;

/// Small message threshold (< 126 bytes uses the 7-bit length)
pub const SMALL_MESSAGE_THRESHOLD: usize = 125;

/// Medium message threshold (< 64KB uses the 16-bit length)
pub const MEDIUM_MESSAGE_THRESHOLD: usize = 65535;

/// Largest payload a control frame may carry
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// WebSocket GUID for handshake
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Configuration for WebSocket connections
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use sockudo_wsengine::{Config, DeflateConfig};
///
/// let config = Config::builder()
///     .max_message_size(16 * 1024)
///     .close_timeout(Duration::from_secs(2))
///     .compression(DeflateConfig::default())
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum reassembled message size (default: 64MB)
    pub max_message_size: usize,
    /// Maximum frame size (default: 16MB)
    pub max_frame_size: usize,
    /// Outgoing data messages larger than this are split into
    /// continuation frames (default: 1MB, 0 = never split)
    pub fragment_size: usize,
    /// How long a locally initiated close waits for the peer (default: 5s)
    pub close_timeout: Duration,
    /// Answer pings automatically (default: true)
    pub auto_pong: bool,
    /// Events buffered before the connection task waits on the
    /// application (default: 64)
    pub event_capacity: usize,
    /// Skip UTF-8 validation of text messages (default: false).
    /// Non-conformant; only for testing against broken peers.
    pub lenient_utf8: bool,
    /// permessage-deflate offer (default: None = no compression)
    pub compression: Option<DeflateConfig>,
    /// Largest accepted HTTP upgrade response head (default: 8KB)
    pub max_handshake_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_message_size: 64 * 1024 * 1024,
            max_frame_size: 16 * 1024 * 1024,
            fragment_size: 1024 * 1024,
            close_timeout: Duration::from_secs(5),
            auto_pong: true,
            event_capacity: 64,
            lenient_utf8: false,
            compression: None,
            max_handshake_size: handshake::MAX_HEADER_SIZE,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }
}

/// Builder for WebSocket configuration
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Offer permessage-deflate with these parameters
    pub fn compression(mut self, compression: DeflateConfig) -> Self {
        self.config.compression = Some(compression);
        self
    }

    /// Do not offer compression
    pub fn no_compression(mut self) -> Self {
        self.config.compression = None;
        self
    }

    /// Set maximum payload length for both frames and messages
    pub fn max_payload_length(mut self, size: usize) -> Self {
        self.config.max_message_size = size;
        self.config.max_frame_size = size;
        self
    }

    /// Set maximum message size
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.config.max_message_size = size;
        self
    }

    /// Set maximum frame size
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Set the outgoing fragmentation threshold (0 disables)
    pub fn fragment_size(mut self, size: usize) -> Self {
        self.config.fragment_size = size;
        self
    }

    /// Set the close handshake timeout
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.config.close_timeout = timeout;
        self
    }

    /// Enable/disable automatic pong replies
    pub fn auto_pong(mut self, enabled: bool) -> Self {
        self.config.auto_pong = enabled;
        self
    }

    /// Set the event channel capacity
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    /// Skip UTF-8 validation of text messages
    pub fn lenient_utf8(mut self, enabled: bool) -> Self {
        self.config.lenient_utf8 = enabled;
        self
    }

    /// Set the largest accepted upgrade response head
    pub fn max_handshake_size(mut self, size: usize) -> Self {
        self.config.max_handshake_size = size;
        self
    }

    /// Build the configuration
    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::Config;
    pub use crate::connection::{Connection, ConnectionHandle, ConnectionState, Event, Events};
    pub use crate::engine::{FrameEngine, Message, Role};
    pub use crate::error::{CloseReason, Error, Result};
    pub use crate::frame::{Frame, OpCode};
    pub use crate::transport::{Transport, TransportEvent};
}

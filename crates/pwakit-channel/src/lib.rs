//! # PwaKit Channel
//!
//! Message ports and the cache control protocol spoken between a page and
//! its offline worker.
//!
//! ## Features
//!
//! - **MessageChannel**: two entangled ports
//! - **Port transfer**: ports travel inside a [`WorkerMessage`] and are owned
//!   by whoever receives them
//! - **Single-use replies**: [`MessagePort::reply`] consumes the port
//! - **Control protocol**: `GET_CACHE_CONTENTS` / `CLEAR_CACHE`
//!
//! ## Architecture
//!
//! ```text
//! Page (ControlClient)                         Worker
//!     │
//!     ├── MessageChannel
//!     │       ├── port1  (kept, awaits reply)
//!     │       └── port2 ──── postMessage(tag, [port2]) ───→ on_control_message
//!     │                                                          │
//!     └── port1 ◄─────────────── reply(data) ────────────────────┘
//! ```

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod client;
pub mod protocol;

pub use client::ControlClient;
pub use protocol::{ControlCommand, ControlReply};

// ==================== Errors ====================

/// Channel errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChannelError {
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("No active controller")]
    NoController,

    #[error("Reply port closed without a reply")]
    NoReply,

    #[error("No reply within {0:?}")]
    Timeout(Duration),

    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),
}

// ==================== Types ====================

/// Unique identifier for a message port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortId(u64);

impl PortId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// A message posted to a worker or a port.
#[derive(Debug)]
pub struct WorkerMessage {
    /// Message data (structured-clone stand-in).
    pub data: JsonValue,

    /// Transferred ports, moved to the receiver.
    pub ports: Vec<MessagePort>,
}

impl WorkerMessage {
    /// Create a new message.
    pub fn new(data: JsonValue) -> Self {
        Self {
            data,
            ports: Vec::new(),
        }
    }

    /// Create with transferred ports.
    pub fn with_ports(data: JsonValue, ports: Vec<MessagePort>) -> Self {
        Self { data, ports }
    }

    /// Take the first transferred port, if any.
    pub fn take_reply_port(&mut self) -> Option<MessagePort> {
        if self.ports.is_empty() {
            None
        } else {
            Some(self.ports.remove(0))
        }
    }
}

// ==================== MessagePort ====================

/// One end of a message channel.
#[derive(Debug)]
pub struct MessagePort {
    /// Port ID.
    pub id: PortId,

    tx: mpsc::UnboundedSender<WorkerMessage>,

    rx: Option<mpsc::UnboundedReceiver<WorkerMessage>>,

    /// Whether started (messages flow).
    started: bool,

    closed: bool,

    entangled_port: PortId,
}

impl MessagePort {
    /// Create a new port pair.
    pub fn create_pair() -> (Self, Self) {
        let (tx1, rx1) = mpsc::unbounded_channel();
        let (tx2, rx2) = mpsc::unbounded_channel();

        let id1 = PortId::new();
        let id2 = PortId::new();

        let port1 = Self {
            id: id1,
            tx: tx2,
            rx: Some(rx1),
            started: false,
            closed: false,
            entangled_port: id2,
        };

        let port2 = Self {
            id: id2,
            tx: tx1,
            rx: Some(rx2),
            started: false,
            closed: false,
            entangled_port: id1,
        };

        (port1, port2)
    }

    /// ID of the port on the other end.
    pub fn entangled_port(&self) -> PortId {
        self.entangled_port
    }

    /// Post a message to the entangled port.
    pub fn post_message(&self, message: WorkerMessage) -> Result<(), ChannelError> {
        if self.closed {
            return Err(ChannelError::InvalidState("Port is closed".to_string()));
        }

        self.tx
            .send(message)
            .map_err(|_| ChannelError::InvalidState("Entangled port is closed".to_string()))
    }

    /// Post exactly one message and give the port up.
    pub fn reply(mut self, data: JsonValue) -> Result<(), ChannelError> {
        let result = self.post_message(WorkerMessage::new(data));
        self.close();
        result
    }

    /// Receive a message (non-blocking).
    pub fn try_receive(&mut self) -> Option<WorkerMessage> {
        if !self.started || self.closed {
            return None;
        }

        self.rx.as_mut()?.try_recv().ok()
    }

    /// Wait for the next message. Starts the port.
    ///
    /// Returns `None` once the entangled port is gone and the queue is drained.
    pub async fn recv(&mut self) -> Option<WorkerMessage> {
        self.start();
        if self.closed {
            return None;
        }
        self.rx.as_mut()?.recv().await
    }

    /// Start the port (enable message flow).
    pub fn start(&mut self) {
        self.started = true;
    }

    /// Close the port.
    pub fn close(&mut self) {
        self.closed = true;
        self.rx = None;
    }

    /// Check if closed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

// ==================== MessageChannel ====================

/// A message channel with two entangled ports.
#[derive(Debug)]
pub struct MessageChannel {
    pub port1: MessagePort,
    pub port2: MessagePort,
}

impl MessageChannel {
    /// Create a new message channel.
    pub fn new() -> Self {
        let (port1, port2) = MessagePort::create_pair();
        Self { port1, port2 }
    }
}

impl Default for MessageChannel {
    fn default() -> Self {
        Self::new()
    }
}

// ==================== MessageTarget ====================

/// Something a page can post messages to (the active worker).
#[async_trait]
pub trait MessageTarget: Send + Sync {
    /// Whether a controller is there to receive messages.
    async fn has_controller(&self) -> bool;

    /// Deliver a message. Resolves once the receiver has handled it.
    async fn post_message(&self, message: WorkerMessage) -> Result<(), ChannelError>;
}

//! # Channel Contracts
//!
//! The shelf core never implements a transport. It consumes two factories:
//!
//! - **ControlChannelFactory**: opens the supervisor-side endpoint a shelf
//!   talks back to (handshake, lifecycle events).
//! - **OutboundChannelFactory**: connects to the endpoint a running shelf
//!   listens on, once the shelf has reported it.
//!
//! Channels are byte-oriented. They know nothing about what a message means.

use std::fmt;
use std::sync::Arc;

/// Errors raised by channel implementations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// No endpoint is listening at the address.
    EndpointNotFound { address: ChannelAddress, channel_name: String },
    /// Another endpoint is already bound at the address.
    AddressInUse { address: ChannelAddress, channel_name: String },
    /// The other side went away.
    ConnectionLost(String),
    /// The channel was already closed by its owner.
    Closed,
    /// Generic I/O or transport failure.
    Io(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EndpointNotFound { address, channel_name } => {
                write!(f, "No endpoint at {}({})", address, channel_name)
            }
            Self::AddressInUse { address, channel_name } => {
                write!(f, "Endpoint already bound at {}({})", address, channel_name)
            }
            Self::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            Self::Closed => write!(f, "Channel closed"),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// URI of a channel endpoint, e.g. `local://billing`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ChannelAddress(String);

impl ChannelAddress {
    pub fn new(uri: impl Into<String>) -> Self {
        Self(uri.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The part before `://`, if any.
    pub fn scheme(&self) -> Option<&str> {
        self.0.split_once("://").map(|(scheme, _)| scheme)
    }
}

impl fmt::Display for ChannelAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelAddress {
    fn from(uri: &str) -> Self {
        Self::new(uri)
    }
}

impl From<String> for ChannelAddress {
    fn from(uri: String) -> Self {
        Self::new(uri)
    }
}

/// Supervisor logic receiving what shelves send over their control channel.
///
/// Opaque to the shelf core: it is only handed to the control channel factory.
pub trait Controller: Send + Sync + 'static {
    fn deliver(&self, service_name: &str, payload: Vec<u8>) -> Result<()>;
}

pub type ControllerChannel = Arc<dyn Controller>;

/// Supervisor-side endpoint bound to a single shelf.
pub trait HostChannel: Send + Sync {
    fn address(&self) -> &ChannelAddress;

    fn channel_name(&self) -> &str;

    /// Stops accepting traffic and frees the endpoint.
    fn close(&mut self) -> Result<()>;
}

/// Creates supervisor-side control endpoints.
#[async_trait::async_trait]
pub trait ControlChannelFactory: Send + Sync + 'static {
    async fn create(
        &self,
        controller: ControllerChannel,
        service_name: &str,
    ) -> Result<Box<dyn HostChannel>>;
}

/// Supervisor-owned handle pushing messages into a running shelf.
#[async_trait::async_trait]
pub trait OutboundChannel: Send + Sync {
    /// Delivers one payload. Blocks on the transport's own send semantics.
    async fn send(&self, payload: &[u8]) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}

/// Connects to endpoints that shelves report during their handshake.
#[async_trait::async_trait]
pub trait OutboundChannelFactory: Send + Sync + 'static {
    async fn create(
        &self,
        address: &ChannelAddress,
        channel_name: &str,
    ) -> Result<Box<dyn OutboundChannel>>;
}

/// Anything that can be sent to a shelf.
pub trait Message {
    fn encode(&self) -> Vec<u8>;
}

impl Message for [u8] {
    fn encode(&self) -> Vec<u8> {
        self.to_vec()
    }
}

impl Message for Vec<u8> {
    fn encode(&self) -> Vec<u8> {
        self.clone()
    }
}

impl Message for str {
    fn encode(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }
}

impl Message for String {
    fn encode(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }
}

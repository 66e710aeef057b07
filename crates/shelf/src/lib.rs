//! # shelf
//!
//! Supervisor-side hosting of service units ("shelves"). A [`ShelfReference`]
//! creates the isolation context a shelf runs in, constructs the shelf inside
//! it, wires the control and outbound channels, and owns teardown.

pub mod bootstrap;
pub mod bus;
pub mod channel;
pub mod isolation;
pub mod reference;
pub mod settings;

pub use bootstrap::BootstrapRequest;
pub use bootstrap::BootstrapperIdentity;
pub use bootstrap::ModuleIdentity;
pub use bootstrap::ShelfReady;
pub use channel::ChannelAddress;
pub use channel::ControllerChannel;
pub use reference::Collaborators;
pub use reference::Delivery;
pub use reference::ShelfBuilder;
pub use reference::ShelfReference;
pub use reference::ShelfState;
pub use settings::IsolationSettings;
pub use settings::ShelfConfig;
pub use settings::ShelfType;

#[cfg(test)]
mod mock;

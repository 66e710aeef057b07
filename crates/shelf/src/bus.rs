//! # Local Bus
//!
//! In-memory channels for shelves running inside the supervisor process, and
//! for tests. Endpoints are keyed by `(address, channel_name)`; addresses use
//! the `local://` scheme.
//!
//! The bus implements both channel factories:
//!
//! - As a [`ControlChannelFactory`] it binds `local://<service>` and pumps
//!   every payload a shelf sends there into the supervisor's controller.
//! - As an [`OutboundChannelFactory`] it connects to an endpoint a shelf has
//!   bound with [`LocalBus::listen`].

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::channel;
use crate::channel::ChannelAddress;
use crate::channel::ControlChannelFactory;
use crate::channel::ControllerChannel;
use crate::channel::HostChannel;
use crate::channel::OutboundChannel;
use crate::channel::OutboundChannelFactory;

pub const SCHEME: &str = "local";

type Key = (ChannelAddress, String);
type Endpoints = Arc<DashMap<Key, mpsc::UnboundedSender<Vec<u8>>>>;

/// Registry of in-memory endpoints.
#[derive(Clone, Default)]
pub struct LocalBus {
    endpoints: Endpoints,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Address of the control endpoint bound for a service.
    pub fn control_address(service_name: &str) -> ChannelAddress {
        ChannelAddress::new(format!("{}://{}", SCHEME, service_name))
    }

    fn bind(&self, key: Key) -> channel::Result<mpsc::UnboundedReceiver<Vec<u8>>> {
        match self.endpoints.entry(key) {
            Entry::Occupied(entry) => Err(channel::Error::AddressInUse {
                address: entry.key().0.clone(),
                channel_name: entry.key().1.clone(),
            }),
            Entry::Vacant(entry) => {
                let (tx, rx) = mpsc::unbounded_channel();
                entry.insert(tx);
                Ok(rx)
            }
        }
    }

    /// Binds a receiving endpoint. The endpoint is freed when the listener drops.
    pub fn listen(
        &self,
        address: impl Into<ChannelAddress>,
        channel_name: impl Into<String>,
    ) -> channel::Result<LocalListener> {
        let key = (address.into(), channel_name.into());
        let rx = self.bind(key.clone())?;
        Ok(LocalListener {
            key,
            rx,
            endpoints: self.endpoints.clone(),
        })
    }

    /// Connects to a bound endpoint.
    pub fn connect(
        &self,
        address: &ChannelAddress,
        channel_name: &str,
    ) -> channel::Result<LocalSender> {
        let key = (address.clone(), channel_name.to_string());
        let tx = self
            .endpoints
            .get(&key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| channel::Error::EndpointNotFound {
                address: address.clone(),
                channel_name: channel_name.to_string(),
            })?;
        Ok(LocalSender { tx: Some(tx) })
    }

    pub fn is_bound(&self, address: &ChannelAddress, channel_name: &str) -> bool {
        self.endpoints
            .contains_key(&(address.clone(), channel_name.to_string()))
    }
}

/// Receiving side of a bound endpoint.
pub struct LocalListener {
    key: Key,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    endpoints: Endpoints,
}

impl LocalListener {
    pub fn address(&self) -> &ChannelAddress {
        &self.key.0
    }

    pub fn channel_name(&self) -> &str {
        &self.key.1
    }

    /// Next payload, or `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }
}

impl Drop for LocalListener {
    fn drop(&mut self) {
        self.endpoints.remove(&self.key);
    }
}

/// Sending side of a connection to a bound endpoint.
pub struct LocalSender {
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

impl LocalSender {
    pub fn send(&self, payload: &[u8]) -> channel::Result<()> {
        let tx = self.tx.as_ref().ok_or(channel::Error::Closed)?;
        tx.send(payload.to_vec())
            .map_err(|_| channel::Error::ConnectionLost("endpoint dropped".into()))
    }
}

#[async_trait::async_trait]
impl OutboundChannel for LocalSender {
    async fn send(&self, payload: &[u8]) -> channel::Result<()> {
        LocalSender::send(self, payload)
    }

    fn close(&mut self) -> channel::Result<()> {
        self.tx = None;
        Ok(())
    }
}

#[async_trait::async_trait]
impl OutboundChannelFactory for LocalBus {
    async fn create(
        &self,
        address: &ChannelAddress,
        channel_name: &str,
    ) -> channel::Result<Box<dyn OutboundChannel>> {
        Ok(Box::new(self.connect(address, channel_name)?))
    }
}

/// Supervisor-side control endpoint on the bus.
pub struct LocalHostChannel {
    key: Key,
    endpoints: Endpoints,
    pump: Option<JoinHandle<()>>,
}

impl HostChannel for LocalHostChannel {
    fn address(&self) -> &ChannelAddress {
        &self.key.0
    }

    fn channel_name(&self) -> &str {
        &self.key.1
    }

    fn close(&mut self) -> channel::Result<()> {
        if let Some(pump) = self.pump.take() {
            self.endpoints.remove(&self.key);
            pump.abort();
        }
        Ok(())
    }
}

impl Drop for LocalHostChannel {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[async_trait::async_trait]
impl ControlChannelFactory for LocalBus {
    async fn create(
        &self,
        controller: ControllerChannel,
        service_name: &str,
    ) -> channel::Result<Box<dyn HostChannel>> {
        let key = (
            Self::control_address(service_name),
            format!("{}.control", service_name),
        );
        let mut rx = self.bind(key.clone())?;

        let service_name = service_name.to_string();
        let pump = tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                if let Err(e) = controller.deliver(&service_name, payload) {
                    tracing::warn!(service = %service_name, error = %e, "controller rejected payload");
                }
            }
        });

        Ok(Box::new(LocalHostChannel {
            key,
            endpoints: self.endpoints.clone(),
            pump: Some(pump),
        }))
    }
}

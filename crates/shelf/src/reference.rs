//! # Shelf Reference
//!
//! Supervisor-side handle to one hosted shelf. Owns the shelf's isolation
//! context, the host (control) channel the shelf talks back to, and the
//! outbound channel used to push messages into it.
//!
//! ## Lifecycle
//!
//! ```text
//! Created --create--> HostChannelOpen --create_shelf_channel--> Connected
//!                          ^                                      |
//!                          +--------------- unload ---------------+
//!
//! any state --dispose--> Disposed (terminal)
//! ```
//!
//! ## Invariants
//!
//! - Exactly one isolation context per reference, created in the constructor.
//! - `create` runs at most once unless `unload` was called since; a repeated
//!   call is rejected with [`Error::AlreadyCreated`] rather than opening a
//!   second control channel.
//! - `dispose` closes the host channel, then the outbound channel, then
//!   releases the context. It runs once, never fails, and keeps going past
//!   individual teardown errors.
//! - Sending without an outbound channel drops the message and logs a
//!   warning. There is no queue and no retry.

use std::sync::Arc;

use tracing::Instrument;

use crate::bootstrap::BootstrapRequest;
use crate::bootstrap::BootstrapperIdentity;
use crate::bootstrap::ModuleIdentity;
use crate::channel;
use crate::channel::ChannelAddress;
use crate::channel::ControlChannelFactory;
use crate::channel::ControllerChannel;
use crate::channel::HostChannel;
use crate::channel::Message;
use crate::channel::OutboundChannel;
use crate::channel::OutboundChannelFactory;
use crate::isolation;
use crate::isolation::IsolationContext;
use crate::isolation::IsolationContextFactory;
use crate::settings;
use crate::settings::IsolationSettings;
use crate::settings::ShelfConfig;
use crate::settings::ShelfType;
use crate::settings::SupervisorSettings;

#[derive(Debug)]
pub enum Error {
    /// The supervisor's own settings could not be determined.
    Settings(settings::Error),
    /// The isolation context could not be created.
    ContextCreation(isolation::Error),
    /// A module could not be loaded into the context.
    ModuleLoad(isolation::Error),
    /// The control channel could not be opened.
    ControlChannel(channel::Error),
    /// The bootstrap object could not be constructed inside the context.
    InstanceCreation(isolation::Error),
    /// The channel reported by the shelf could not be connected.
    OutboundChannel(channel::Error),
    /// The outbound channel failed to deliver.
    Send(channel::Error),
    /// `create` was called again without an intervening `unload`.
    AlreadyCreated,
    /// The reference was disposed.
    Disposed,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Settings(e) => write!(f, "Settings error: {}", e),
            Self::ContextCreation(e) => write!(f, "Context creation failed: {}", e),
            Self::ModuleLoad(e) => write!(f, "Module load failed: {}", e),
            Self::ControlChannel(e) => write!(f, "Control channel error: {}", e),
            Self::InstanceCreation(e) => write!(f, "Instance creation failed: {}", e),
            Self::OutboundChannel(e) => write!(f, "Outbound channel error: {}", e),
            Self::Send(e) => write!(f, "Send failed: {}", e),
            Self::AlreadyCreated => write!(f, "Shelf instance already created"),
            Self::Disposed => write!(f, "Shelf reference disposed"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Settings(e) => Some(e),
            Self::ContextCreation(e) | Self::ModuleLoad(e) | Self::InstanceCreation(e) => Some(e),
            Self::ControlChannel(e) | Self::OutboundChannel(e) | Self::Send(e) => Some(e),
            Self::AlreadyCreated | Self::Disposed => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Where a reference is in its lifecycle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ShelfState {
    Created,
    HostChannelOpen,
    Connected,
    Disposed,
}

/// Outcome of [`ShelfReference::send`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// No outbound channel was established; the message was discarded.
    Dropped,
}

/// The factories a reference draws its context and channels from.
#[derive(Clone)]
pub struct Collaborators {
    pub isolation: Arc<dyn IsolationContextFactory>,
    pub control: Arc<dyn ControlChannelFactory>,
    pub outbound: Arc<dyn OutboundChannelFactory>,
}

impl Collaborators {
    pub fn new(
        isolation: Arc<dyn IsolationContextFactory>,
        control: Arc<dyn ControlChannelFactory>,
        outbound: Arc<dyn OutboundChannelFactory>,
    ) -> Self {
        Self {
            isolation,
            control,
            outbound,
        }
    }
}

/// Fluent construction of a [`ShelfReference`].
pub struct ShelfBuilder {
    service_name: String,
    shelf_type: ShelfType,
    controller: ControllerChannel,
    supervisor: Option<SupervisorSettings>,
    config: Option<ShelfConfig>,
}

impl ShelfBuilder {
    pub fn new(
        service_name: impl Into<String>,
        shelf_type: ShelfType,
        controller: ControllerChannel,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            shelf_type,
            controller,
            supervisor: None,
            config: None,
        }
    }

    /// Overrides the supervisor settings. Defaults to the running process.
    pub fn supervisor(mut self, supervisor: SupervisorSettings) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    /// Overrides the configuration. Defaults to the process environment.
    pub fn config(mut self, config: ShelfConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Computes the isolation settings and creates the isolation context.
    pub fn build(self, collaborators: &Collaborators) -> Result<ShelfReference> {
        let supervisor = match self.supervisor {
            Some(supervisor) => supervisor,
            None => IsolationSettings::current().map_err(Error::Settings)?,
        };
        let config = self.config.unwrap_or_else(ShelfConfig::from_env);

        ShelfReference::new(
            self.service_name,
            self.shelf_type,
            self.controller,
            &supervisor,
            &config,
            collaborators,
        )
    }
}

/// Supervisor-side handle to a hosted shelf.
pub struct ShelfReference {
    service_name: String,
    shelf_type: ShelfType,
    controller: ControllerChannel,
    settings: IsolationSettings,
    control_factory: Arc<dyn ControlChannelFactory>,
    outbound_factory: Arc<dyn OutboundChannelFactory>,
    context: Option<Box<dyn IsolationContext>>,
    host_channel: Option<Box<dyn HostChannel>>,
    outbound: Option<Box<dyn OutboundChannel>>,
    unloaded: bool,
    disposed: bool,
    span: tracing::Span,
}

impl ShelfReference {
    pub fn builder(
        service_name: impl Into<String>,
        shelf_type: ShelfType,
        controller: ControllerChannel,
    ) -> ShelfBuilder {
        ShelfBuilder::new(service_name, shelf_type, controller)
    }

    /// Creates the reference and its isolation context.
    ///
    /// May block on the isolation backend. A context that cannot be created
    /// fails the whole construction.
    pub fn new(
        service_name: impl Into<String>,
        shelf_type: ShelfType,
        controller: ControllerChannel,
        supervisor: &SupervisorSettings,
        config: &ShelfConfig,
        collaborators: &Collaborators,
    ) -> Result<Self> {
        let service_name = service_name.into();
        let span = tracing::info_span!("shelf", service = %service_name, kind = %shelf_type);
        let (settings, context) = {
            let _enter = span.enter();
            let settings = IsolationSettings::configure(&service_name, shelf_type, supervisor, config);
            let context = collaborators
                .isolation
                .create_context(&service_name, shelf_type, &settings)
                .map_err(Error::ContextCreation)?;
            tracing::debug!("isolation context created");
            (settings, context)
        };

        Ok(Self {
            service_name,
            shelf_type,
            controller,
            settings,
            control_factory: collaborators.control.clone(),
            outbound_factory: collaborators.outbound.clone(),
            context: Some(context),
            host_channel: None,
            outbound: None,
            unloaded: false,
            disposed: false,
            span,
        })
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn shelf_type(&self) -> ShelfType {
        self.shelf_type
    }

    pub fn settings(&self) -> &IsolationSettings {
        &self.settings
    }

    /// Address of the host channel, once `create` has opened it.
    pub fn host_address(&self) -> Option<&ChannelAddress> {
        self.host_channel.as_ref().map(|channel| channel.address())
    }

    pub fn state(&self) -> ShelfState {
        if self.disposed {
            ShelfState::Disposed
        } else if self.outbound.is_some() {
            ShelfState::Connected
        } else if self.host_channel.is_some() {
            ShelfState::HostChannelOpen
        } else {
            ShelfState::Created
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Whether the shelf's code is still running inside its context.
    ///
    /// Takes `&mut self` because a process context has to reap its worker
    /// to observe an exit.
    pub fn is_running(&mut self) -> bool {
        self.context.as_mut().is_some_and(|context| context.is_running())
    }

    /// Sends a message to the shelf.
    ///
    /// Without an outbound channel the message is dropped and a warning is
    /// logged; this is not an error. Transport failures are returned as-is.
    pub async fn send<M: Message + ?Sized>(&self, message: &M) -> Result<Delivery> {
        let Some(outbound) = &self.outbound else {
            tracing::warn!(
                parent: &self.span,
                message_type = short_type_name::<M>(),
                "unable to send service message due to missing channel"
            );
            return Ok(Delivery::Dropped);
        };

        outbound
            .send(&message.encode())
            .instrument(self.span.clone())
            .await
            .map_err(Error::Send)?;
        Ok(Delivery::Delivered)
    }

    /// Loads an additional module into the isolation context.
    ///
    /// Meant to be called before `create`.
    pub fn load_module(&mut self, module: &ModuleIdentity) -> Result<()> {
        if self.disposed {
            return Err(Error::Disposed);
        }
        let context = self.context.as_mut().ok_or(Error::Disposed)?;
        let _enter = self.span.enter();
        context.load_module(module).map_err(Error::ModuleLoad)
    }

    /// Opens the control channel and constructs the shelf with its default
    /// bootstrapper.
    pub async fn create(&mut self) -> Result<()> {
        self.create_instance(None).await
    }

    /// Opens the control channel and constructs the shelf with the named
    /// bootstrapper.
    pub async fn create_with(&mut self, bootstrapper: BootstrapperIdentity) -> Result<()> {
        tracing::debug!(parent: &self.span, bootstrapper = %bootstrapper.name, "bootstrapper type");
        tracing::debug!(parent: &self.span, package = ?bootstrapper.package, "bootstrapper package");
        tracing::debug!(parent: &self.span, version = ?bootstrapper.version, "bootstrapper version");
        self.create_instance(Some(bootstrapper)).await
    }

    async fn create_instance(&mut self, bootstrapper: Option<BootstrapperIdentity>) -> Result<()> {
        let span = self.span.clone();
        async move {
            if self.disposed {
                return Err(Error::Disposed);
            }

            if let Some(mut previous) = self.host_channel.take() {
                if !self.unloaded {
                    self.host_channel = Some(previous);
                    return Err(Error::AlreadyCreated);
                }
                if let Err(e) = previous.close() {
                    tracing::warn!(error = %e, "failed to close previous host channel");
                }
            }

            // The outbound channel belongs to the instance being replaced.
            if let Some(mut outbound) = self.outbound.take() {
                if let Err(e) = outbound.close() {
                    tracing::warn!(error = %e, "failed to close outbound channel");
                }
            }

            tracing::debug!("creating host channel");
            let host = self
                .control_factory
                .create(self.controller.clone(), &self.service_name)
                .await
                .map_err(Error::ControlChannel)?;
            tracing::info!(address = %host.address(), channel = host.channel_name(), "created host channel");

            let request = BootstrapRequest {
                service_name: self.service_name.clone(),
                bootstrapper,
                control_address: host.address().clone(),
                control_channel: host.channel_name().to_string(),
                modules: Vec::new(),
            };
            self.host_channel = Some(host);
            self.unloaded = false;

            tracing::debug!("creating shelf instance");
            let context = self.live_context()?;
            context
                .instantiate(request)
                .await
                .map_err(Error::InstanceCreation)
        }
        .instrument(span)
        .await
    }

    /// Handshake callback: the shelf reports where it receives messages.
    ///
    /// Replaces, and closes, any outbound channel still in place. A
    /// successful reconnect after `unload` makes `create` unavailable again.
    pub async fn create_shelf_channel(
        &mut self,
        address: ChannelAddress,
        channel_name: &str,
    ) -> Result<()> {
        let span = self.span.clone();
        async move {
            if self.disposed {
                return Err(Error::Disposed);
            }

            tracing::debug!(%address, channel = channel_name, "creating shelf proxy");
            let channel = self
                .outbound_factory
                .create(&address, channel_name)
                .await
                .map_err(Error::OutboundChannel)?;

            if let Some(mut previous) = self.outbound.replace(channel) {
                if let Err(e) = previous.close() {
                    tracing::warn!(error = %e, "failed to close previous outbound channel");
                }
            }
            self.unloaded = false;
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Drops the outbound channel, keeping the context and host channel.
    ///
    /// The shelf may reconnect through `create_shelf_channel`, and `create`
    /// becomes callable again.
    pub fn unload(&mut self) {
        let _enter = self.span.enter();
        if let Some(mut outbound) = self.outbound.take() {
            if let Err(e) = outbound.close() {
                tracing::warn!(error = %e, "failed to close outbound channel");
            }
        }
        self.unloaded = true;
    }

    /// Tears everything down. Idempotent and infallible.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }

        let _enter = self.span.enter();

        if let Some(mut host) = self.host_channel.take() {
            if let Err(e) = host.close() {
                tracing::warn!(error = %e, "failed to close host channel");
            }
        }

        if let Some(mut outbound) = self.outbound.take() {
            if let Err(e) = outbound.close() {
                tracing::warn!(error = %e, "failed to close outbound channel");
            }
        }

        if let Some(mut context) = self.context.take() {
            tracing::debug!("releasing isolation context");
            match context.release() {
                Ok(()) => tracing::info!("isolation context released"),
                Err(e) => tracing::warn!(error = %e, "isolation context was not released cleanly"),
            }
        }

        self.disposed = true;
    }

    fn live_context(&mut self) -> Result<&mut Box<dyn IsolationContext>> {
        if self.disposed {
            return Err(Error::Disposed);
        }
        self.context.as_mut().ok_or(Error::Disposed)
    }
}

impl Drop for ShelfReference {
    fn drop(&mut self) {
        if !self.disposed {
            tracing::warn!(parent: &self.span, "shelf reference dropped without dispose");
            self.dispose();
        }
    }
}

fn short_type_name<M: ?Sized>() -> &'static str {
    let name = std::any::type_name::<M>();
    let base = name.split('<').next().unwrap_or(name);
    match base.rfind("::") {
        Some(idx) => &name[idx + 2..],
        None => name,
    }
}

//! # Isolation Contexts
//!
//! An isolation context is the boundary a shelf's code runs in. The shelf
//! core only sees the [`IsolationContext`] trait; where the boundary actually
//! lies is up to the factory:
//!
//! - [`ProcessIsolation`] runs each shelf as a separate OS process.
//! - [`LocalIsolation`] runs trusted shelves as tasks inside the supervisor.
//! - [`IsolationRouter`] picks one of the two by [`ShelfType`].

pub mod local;
pub mod process;

use std::path::PathBuf;
use std::sync::Arc;

use crate::bootstrap::BootstrapRequest;
use crate::bootstrap::ModuleIdentity;
use crate::settings::IsolationSettings;
use crate::settings::ShelfType;

pub use local::Bootstrapper;
pub use local::LocalIsolation;
pub use process::ProcessIsolation;

#[derive(Debug)]
pub enum Error {
    /// The shelf's application base does not exist.
    BaseDirectoryMissing(PathBuf),
    /// A module could not be resolved inside the context.
    ModuleNotFound(ModuleIdentity),
    /// No bootstrapper is known under the requested name.
    TypeNotFound(String),
    /// No bootstrapper was named and none is registered.
    NoBootstrapper,
    /// No bootstrapper was named and several are registered.
    AmbiguousBootstrapper(usize),
    /// The worker process could not be started.
    Spawn(std::io::Error),
    /// The worker binaries could not be shadow copied.
    ShadowCopy(std::io::Error),
    /// The worker process could not be stopped.
    Kill(std::io::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BaseDirectoryMissing(path) => {
                write!(f, "Application base does not exist: {}", path.display())
            }
            Self::ModuleNotFound(module) => write!(f, "Module not found: {}", module),
            Self::TypeNotFound(name) => write!(f, "Bootstrapper not found: {}", name),
            Self::NoBootstrapper => write!(f, "No bootstrapper registered"),
            Self::AmbiguousBootstrapper(count) => {
                write!(f, "No bootstrapper named and {} are registered", count)
            }
            Self::Spawn(e) => write!(f, "Failed to start worker: {}", e),
            Self::ShadowCopy(e) => write!(f, "Failed to shadow copy worker: {}", e),
            Self::Kill(e) => write!(f, "Failed to stop worker: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Spawn(e) | Self::ShadowCopy(e) | Self::Kill(e) => Some(e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A live execution boundary owned by exactly one shelf reference.
#[async_trait::async_trait]
pub trait IsolationContext: Send + Sync {
    /// Makes an additional code unit available to the shelf.
    ///
    /// Only affects instances created afterwards.
    fn load_module(&mut self, module: &ModuleIdentity) -> Result<()>;

    /// Constructs the shelf's bootstrap object inside the boundary.
    ///
    /// The context fills `request.modules` with the modules it has loaded.
    /// Returns once construction has been accepted; the shelf reports back
    /// over the control channel when it is ready to receive.
    async fn instantiate(&mut self, request: BootstrapRequest) -> Result<()>;

    /// Tears the boundary down. Safe to call when nothing is running.
    fn release(&mut self) -> Result<()>;

    /// Mutable so implementations can poll and reap what they run, as
    /// `tokio::process::Child::try_wait` requires.
    fn is_running(&mut self) -> bool;
}

/// Creates isolation contexts from computed settings.
pub trait IsolationContextFactory: Send + Sync + 'static {
    fn create_context(
        &self,
        service_name: &str,
        shelf_type: ShelfType,
        settings: &IsolationSettings,
    ) -> Result<Box<dyn IsolationContext>>;
}

/// Dispatches context creation by shelf type.
#[derive(Clone)]
pub struct IsolationRouter {
    internal: Arc<dyn IsolationContextFactory>,
    isolated: Arc<dyn IsolationContextFactory>,
}

impl IsolationRouter {
    pub fn new(
        internal: Arc<dyn IsolationContextFactory>,
        isolated: Arc<dyn IsolationContextFactory>,
    ) -> Self {
        Self { internal, isolated }
    }
}

impl IsolationContextFactory for IsolationRouter {
    fn create_context(
        &self,
        service_name: &str,
        shelf_type: ShelfType,
        settings: &IsolationSettings,
    ) -> Result<Box<dyn IsolationContext>> {
        let factory = match shelf_type {
            ShelfType::Internal => &self.internal,
            ShelfType::Isolated => &self.isolated,
        };
        factory.create_context(service_name, shelf_type, settings)
    }
}

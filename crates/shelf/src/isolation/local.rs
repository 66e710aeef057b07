//! # Local Isolation
//!
//! Trusted shelves run as tokio tasks inside the supervisor. There is no
//! real boundary: the "context" is a registry lookup plus the task running
//! the bootstrapper. Bootstrappers and modules are registered up front,
//! the way a process worker would find them on disk.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::DashSet;
use tokio::task::JoinHandle;

use crate::bootstrap::BootstrapRequest;
use crate::bootstrap::ModuleIdentity;
use crate::isolation::Error;
use crate::isolation::IsolationContext;
use crate::isolation::IsolationContextFactory;
use crate::isolation::Result;
use crate::settings::IsolationSettings;
use crate::settings::ShelfType;

/// Initializes a shelf's service logic once it is constructed.
///
/// The bootstrapper owns the shelf side of the handshake: it is expected to
/// start listening and then report its address over the control channel
/// named in the request.
#[async_trait::async_trait]
pub trait Bootstrapper: Send + Sync + 'static {
    async fn bootstrap(&self, request: BootstrapRequest) -> anyhow::Result<()>;
}

/// Registry of in-process bootstrappers and modules.
#[derive(Clone, Default)]
pub struct LocalIsolation {
    bootstrappers: Arc<DashMap<String, Arc<dyn Bootstrapper>>>,
    modules: Arc<DashSet<String>>,
}

impl LocalIsolation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a bootstrapper under the name shelves request it by.
    pub fn register(&self, name: impl Into<String>, bootstrapper: Arc<dyn Bootstrapper>) {
        self.bootstrappers.insert(name.into(), bootstrapper);
    }

    /// Registers a module name that contexts may load.
    pub fn register_module(&self, name: impl Into<String>) {
        self.modules.insert(name.into());
    }

    fn resolve(&self, request: &BootstrapRequest) -> Result<Arc<dyn Bootstrapper>> {
        if let Some(identity) = &request.bootstrapper {
            return self
                .bootstrappers
                .get(&identity.name)
                .map(|entry| entry.value().clone())
                .ok_or_else(|| Error::TypeNotFound(identity.to_string()));
        }

        match self.bootstrappers.len() {
            0 => Err(Error::NoBootstrapper),
            1 => self
                .bootstrappers
                .iter()
                .next()
                .map(|entry| entry.value().clone())
                .ok_or(Error::NoBootstrapper),
            count => Err(Error::AmbiguousBootstrapper(count)),
        }
    }
}

impl IsolationContextFactory for LocalIsolation {
    fn create_context(
        &self,
        service_name: &str,
        _shelf_type: ShelfType,
        _settings: &IsolationSettings,
    ) -> Result<Box<dyn IsolationContext>> {
        Ok(Box::new(LocalContext {
            service_name: service_name.to_string(),
            registry: self.clone(),
            modules: Vec::new(),
            task: None,
        }))
    }
}

/// A trusted shelf's bootstrap task.
pub struct LocalContext {
    service_name: String,
    registry: LocalIsolation,
    modules: Vec<String>,
    task: Option<JoinHandle<()>>,
}

#[async_trait::async_trait]
impl IsolationContext for LocalContext {
    fn load_module(&mut self, module: &ModuleIdentity) -> Result<()> {
        if !self.registry.modules.contains(module.as_str()) {
            return Err(Error::ModuleNotFound(module.clone()));
        }
        self.modules.push(module.0.clone());
        Ok(())
    }

    async fn instantiate(&mut self, mut request: BootstrapRequest) -> Result<()> {
        let bootstrapper = self.registry.resolve(&request)?;
        request.modules = self.modules.clone();

        if let Some(task) = self.task.take() {
            task.abort();
        }

        let service_name = self.service_name.clone();
        self.task = Some(tokio::spawn(async move {
            if let Err(e) = bootstrapper.bootstrap(request).await {
                tracing::warn!(service = %service_name, error = %e, "bootstrap failed");
            }
        }));
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        Ok(())
    }

    fn is_running(&mut self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

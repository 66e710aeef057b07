//! Recording collaborators for testing.
//!
//! Every mock appends to a shared journal so tests can assert on the exact
//! order of lifecycle calls across factories.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use crate::bootstrap::BootstrapRequest;
use crate::bootstrap::ModuleIdentity;
use crate::channel;
use crate::channel::ChannelAddress;
use crate::channel::ControlChannelFactory;
use crate::channel::Controller;
use crate::channel::ControllerChannel;
use crate::channel::HostChannel;
use crate::channel::OutboundChannel;
use crate::channel::OutboundChannelFactory;
use crate::isolation;
use crate::isolation::IsolationContext;
use crate::isolation::IsolationContextFactory;
use crate::reference::Collaborators;
use crate::reference::ShelfReference;
use crate::settings::IsolationSettings;
use crate::settings::ShelfConfig;
use crate::settings::ShelfType;

/// Ordered record of lifecycle calls.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn record(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.events().iter().filter(|e| e.starts_with(prefix)).count()
    }
}

/// Switches for making individual mock calls fail.
#[derive(Clone, Copy, Default)]
pub struct Failures {
    pub create_context: bool,
    pub instantiate: bool,
    pub release: bool,
    pub control: bool,
    pub outbound: bool,
    pub send: bool,
    pub close_host: bool,
    pub close_outbound: bool,
}

pub struct MockIsolation {
    journal: Journal,
    failures: Failures,
    requests: Arc<Mutex<Vec<BootstrapRequest>>>,
}

impl IsolationContextFactory for MockIsolation {
    fn create_context(
        &self,
        service_name: &str,
        _shelf_type: ShelfType,
        settings: &IsolationSettings,
    ) -> isolation::Result<Box<dyn IsolationContext>> {
        self.journal.record(format!("context:create:{}", service_name));
        if self.failures.create_context {
            return Err(isolation::Error::BaseDirectoryMissing(settings.application_base.clone()));
        }
        Ok(Box::new(MockContext {
            journal: self.journal.clone(),
            failures: self.failures,
            requests: self.requests.clone(),
            modules: Vec::new(),
            running: false,
        }))
    }
}

struct MockContext {
    journal: Journal,
    failures: Failures,
    requests: Arc<Mutex<Vec<BootstrapRequest>>>,
    modules: Vec<String>,
    running: bool,
}

#[async_trait::async_trait]
impl IsolationContext for MockContext {
    fn load_module(&mut self, module: &ModuleIdentity) -> isolation::Result<()> {
        if module.as_str().starts_with("missing") {
            return Err(isolation::Error::ModuleNotFound(module.clone()));
        }
        self.journal.record(format!("context:load:{}", module));
        self.modules.push(module.0.clone());
        Ok(())
    }

    async fn instantiate(&mut self, mut request: BootstrapRequest) -> isolation::Result<()> {
        self.journal.record("context:instantiate");
        if self.failures.instantiate {
            let name = request
                .bootstrapper
                .map(|b| b.to_string())
                .unwrap_or_default();
            return Err(isolation::Error::TypeNotFound(name));
        }
        request.modules = self.modules.clone();
        self.requests.lock().unwrap().push(request);
        self.running = true;
        Ok(())
    }

    fn release(&mut self) -> isolation::Result<()> {
        self.journal.record("context:release");
        self.running = false;
        if self.failures.release {
            return Err(isolation::Error::Kill(std::io::Error::other("already unloaded")));
        }
        Ok(())
    }

    fn is_running(&mut self) -> bool {
        self.running
    }
}

pub struct MockControl {
    journal: Journal,
    failures: Failures,
    seq: AtomicU64,
}

#[async_trait::async_trait]
impl ControlChannelFactory for MockControl {
    async fn create(
        &self,
        _controller: ControllerChannel,
        service_name: &str,
    ) -> channel::Result<Box<dyn HostChannel>> {
        if self.failures.control {
            return Err(channel::Error::Io("pipe unavailable".into()));
        }
        let n = self.seq.fetch_add(1, Ordering::Relaxed);
        let address = ChannelAddress::new(format!("mock://{}/{}", service_name, n));
        self.journal.record(format!("host:create:{}", address));
        Ok(Box::new(MockHost {
            address,
            channel_name: format!("{}.control", service_name),
            journal: self.journal.clone(),
            fail_close: self.failures.close_host,
        }))
    }
}

struct MockHost {
    address: ChannelAddress,
    channel_name: String,
    journal: Journal,
    fail_close: bool,
}

impl HostChannel for MockHost {
    fn address(&self) -> &ChannelAddress {
        &self.address
    }

    fn channel_name(&self) -> &str {
        &self.channel_name
    }

    fn close(&mut self) -> channel::Result<()> {
        self.journal.record(format!("host:close:{}", self.address));
        if self.fail_close {
            return Err(channel::Error::Io("close failed".into()));
        }
        Ok(())
    }
}

/// Messages delivered through any mock outbound channel, tagged with the
/// address the channel was created for.
pub type Deliveries = Arc<Mutex<Vec<(ChannelAddress, String, Vec<u8>)>>>;

pub struct MockOutbound {
    journal: Journal,
    failures: Failures,
    deliveries: Deliveries,
}

#[async_trait::async_trait]
impl OutboundChannelFactory for MockOutbound {
    async fn create(
        &self,
        address: &ChannelAddress,
        channel_name: &str,
    ) -> channel::Result<Box<dyn OutboundChannel>> {
        if self.failures.outbound {
            return Err(channel::Error::EndpointNotFound {
                address: address.clone(),
                channel_name: channel_name.to_string(),
            });
        }
        self.journal.record(format!("outbound:create:{}", address));
        Ok(Box::new(MockOutboundChannel {
            address: address.clone(),
            channel_name: channel_name.to_string(),
            journal: self.journal.clone(),
            fail_send: self.failures.send,
            fail_close: self.failures.close_outbound,
            deliveries: self.deliveries.clone(),
        }))
    }
}

struct MockOutboundChannel {
    address: ChannelAddress,
    channel_name: String,
    journal: Journal,
    fail_send: bool,
    fail_close: bool,
    deliveries: Deliveries,
}

#[async_trait::async_trait]
impl OutboundChannel for MockOutboundChannel {
    async fn send(&self, payload: &[u8]) -> channel::Result<()> {
        if self.fail_send {
            return Err(channel::Error::ConnectionLost("shelf exited".into()));
        }
        self.deliveries.lock().unwrap().push((
            self.address.clone(),
            self.channel_name.clone(),
            payload.to_vec(),
        ));
        Ok(())
    }

    fn close(&mut self) -> channel::Result<()> {
        self.journal.record(format!("outbound:close:{}", self.address));
        if self.fail_close {
            return Err(channel::Error::ConnectionLost("shelf exited".into()));
        }
        Ok(())
    }
}

/// Controller that ignores everything.
pub struct NullController;

impl Controller for NullController {
    fn deliver(&self, _service_name: &str, _payload: Vec<u8>) -> channel::Result<()> {
        Ok(())
    }
}

/// All mocks wired together.
pub struct Harness {
    pub journal: Journal,
    pub requests: Arc<Mutex<Vec<BootstrapRequest>>>,
    pub deliveries: Deliveries,
    pub collaborators: Collaborators,
}

impl Harness {
    pub fn new() -> Self {
        Self::failing(Failures::default())
    }

    pub fn failing(failures: Failures) -> Self {
        let journal = Journal::default();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let deliveries = Deliveries::default();

        let collaborators = Collaborators::new(
            Arc::new(MockIsolation {
                journal: journal.clone(),
                failures,
                requests: requests.clone(),
            }),
            Arc::new(MockControl {
                journal: journal.clone(),
                failures,
                seq: AtomicU64::new(1),
            }),
            Arc::new(MockOutbound {
                journal: journal.clone(),
                failures,
                deliveries: deliveries.clone(),
            }),
        );

        Self {
            journal,
            requests,
            deliveries,
            collaborators,
        }
    }

    pub fn supervisor() -> IsolationSettings {
        IsolationSettings {
            application_base: "/srv/supervisor".into(),
            configuration_file: "/srv/supervisor/supervisor.config".into(),
            shadow_copy: false,
        }
    }

    pub fn shelf(&self, service_name: &str, shelf_type: ShelfType) -> ShelfReference {
        ShelfReference::builder(service_name, shelf_type, Arc::new(NullController))
            .supervisor(Self::supervisor())
            .config(ShelfConfig::default())
            .build(&self.collaborators)
            .expect("shelf reference")
    }
}

/// Captures formatted tracing output for the current thread.
#[derive(Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    /// Installs a debug-level subscriber writing into this capture until the
    /// guard drops.
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let sink = self.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || sink.clone())
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }

    /// Number of WARN lines containing `needle`.
    pub fn warnings(&self, needle: &str) -> usize {
        self.contents()
            .lines()
            .filter(|line| line.contains("WARN") && line.contains(needle))
            .count()
    }
}

impl std::io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

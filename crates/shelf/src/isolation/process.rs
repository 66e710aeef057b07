//! # Process Isolation
//!
//! Each shelf runs as its own worker process, started from the shelf's
//! application base. The construct command is passed as arguments (see
//! [`BootstrapRequest::to_args`]); the worker parses them, starts its service
//! and reports back over the control channel.
//!
//! With shadow copying enabled the worker program is copied into a private
//! directory first, so the deployed binary is never held open and can be
//! replaced while the shelf runs.

use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use tokio::process::Child;
use tokio::process::Command;

use crate::bootstrap::BootstrapRequest;
use crate::bootstrap::ModuleIdentity;
use crate::isolation::Error;
use crate::isolation::IsolationContext;
use crate::isolation::IsolationContextFactory;
use crate::isolation::Result;
use crate::settings::IsolationSettings;
use crate::settings::ShelfType;

/// Environment variable telling the worker which shelf it hosts.
pub const SERVICE_NAME_ENV: &str = "SHELF_SERVICE_NAME";

/// Environment variable pointing the worker at its configuration file.
pub const CONFIGURATION_FILE_ENV: &str = "SHELF_CONFIGURATION_FILE";

static SHADOW_SEQ: AtomicU64 = AtomicU64::new(1);

/// Factory starting shelves as worker processes.
#[derive(Clone, Debug)]
pub struct ProcessIsolation {
    program: PathBuf,
    args: Vec<String>,
    shadow_root: PathBuf,
}

impl ProcessIsolation {
    /// Workers run `program`, resolved against the application base when
    /// relative.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            shadow_root: std::env::temp_dir().join("shelf-shadow"),
        }
    }

    /// Adds an argument placed before the construct command.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Directory under which shadow copies are made.
    pub fn shadow_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.shadow_root = dir.into();
        self
    }
}

impl IsolationContextFactory for ProcessIsolation {
    fn create_context(
        &self,
        service_name: &str,
        _shelf_type: ShelfType,
        settings: &IsolationSettings,
    ) -> Result<Box<dyn IsolationContext>> {
        if !settings.application_base.is_dir() {
            return Err(Error::BaseDirectoryMissing(settings.application_base.clone()));
        }

        let program = resolve(&settings.application_base, &self.program);
        tracing::debug!(service = service_name, program = %program.display(), "process context ready");

        Ok(Box::new(ProcessContext {
            service_name: service_name.to_string(),
            settings: settings.clone(),
            program,
            args: self.args.clone(),
            shadow_root: self.shadow_root.clone(),
            modules: Vec::new(),
            child: None,
            shadow_dir: None,
        }))
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// A shelf's worker process and the files it runs from.
pub struct ProcessContext {
    service_name: String,
    settings: IsolationSettings,
    program: PathBuf,
    args: Vec<String>,
    shadow_root: PathBuf,
    modules: Vec<String>,
    child: Option<Child>,
    shadow_dir: Option<PathBuf>,
}

impl ProcessContext {
    /// Copies the worker program into a fresh shadow directory.
    async fn shadow_copy(&mut self) -> Result<PathBuf> {
        let file_name = self
            .program
            .file_name()
            .ok_or_else(|| Error::ShadowCopy(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("worker program has no file name: {}", self.program.display()),
            )))?;

        let dir = self.shadow_root.join(format!(
            "{}-{}-{}",
            self.service_name,
            std::process::id(),
            SHADOW_SEQ.fetch_add(1, Ordering::Relaxed),
        ));
        tokio::fs::create_dir_all(&dir).await.map_err(Error::ShadowCopy)?;
        self.shadow_dir = Some(dir.clone());

        let target = dir.join(file_name);
        tokio::fs::copy(&self.program, &target)
            .await
            .map_err(Error::ShadowCopy)?;

        tracing::debug!(service = %self.service_name, path = %target.display(), "shadow copied worker");
        Ok(target)
    }

    /// Stops the worker and removes its shadow copy. Attempts both steps and
    /// reports the first failure.
    fn stop(&mut self) -> Result<()> {
        let mut first_error = None;

        if let Some(mut child) = self.child.take() {
            match child.start_kill() {
                Ok(()) => {}
                // already reaped
                Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => {}
                Err(e) => first_error = Some(Error::Kill(e)),
            }
        }

        if let Some(dir) = self.shadow_dir.take() {
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    first_error.get_or_insert(Error::ShadowCopy(e));
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl IsolationContext for ProcessContext {
    fn load_module(&mut self, module: &ModuleIdentity) -> Result<()> {
        let path = resolve(&self.settings.application_base, Path::new(module.as_str()));
        if !path.is_file() {
            return Err(Error::ModuleNotFound(module.clone()));
        }

        tracing::debug!(service = %self.service_name, module = %path.display(), "module loaded");
        self.modules.push(path.to_string_lossy().into_owned());
        Ok(())
    }

    async fn instantiate(&mut self, mut request: BootstrapRequest) -> Result<()> {
        if self.child.is_some() || self.shadow_dir.is_some() {
            tracing::debug!(service = %self.service_name, "replacing previous worker");
            if let Err(e) = self.stop() {
                tracing::warn!(service = %self.service_name, error = %e, "failed to stop previous worker");
            }
        }

        let program = if self.settings.shadow_copy {
            self.shadow_copy().await?
        } else {
            self.program.clone()
        };

        request.modules = self.modules.clone();

        let child = Command::new(&program)
            .args(&self.args)
            .args(request.to_args())
            .current_dir(&self.settings.application_base)
            .env(SERVICE_NAME_ENV, &self.service_name)
            .env(CONFIGURATION_FILE_ENV, &self.settings.configuration_file)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(Error::Spawn)?;

        tracing::info!(service = %self.service_name, pid = ?child.id(), "worker started");
        self.child = Some(child);
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        self.stop()
    }

    fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }
}

impl Drop for ProcessContext {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

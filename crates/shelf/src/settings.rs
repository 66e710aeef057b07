//! # Isolation Settings
//!
//! Computes where a shelf runs from and how its files are treated, based on
//! the supervisor's own settings and the shelf's type.
//!
//! Internal shelves share the supervisor's boundary, so their settings are
//! the supervisor's settings unchanged. Isolated shelves get a dedicated
//! directory under the services directory and always run from a shadow copy.

use std::path::Path;
use std::path::PathBuf;

/// Name of the services directory when no override is configured.
pub const DEFAULT_SERVICES_DIRECTORY: &str = "Services";

/// Environment variable holding the services directory override.
pub const SERVICES_DIRECTORY_ENV: &str = "SHELF_MONITOR_DIRECTORY";

#[derive(Debug)]
pub enum Error {
    CurrentExe(std::io::Error),
    NoBaseDirectory(PathBuf),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CurrentExe(e) => write!(f, "Unable to locate supervisor executable: {}", e),
            Self::NoBaseDirectory(path) => {
                write!(f, "Supervisor executable has no parent directory: {}", path.display())
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::CurrentExe(e) => Some(e),
            Self::NoBaseDirectory(_) => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// How strongly a shelf is separated from its supervisor.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ShelfType {
    /// Trusted shelf sharing the supervisor's execution boundary.
    Internal,
    /// Shelf running in its own boundary, from its own directory.
    Isolated,
}

impl std::fmt::Display for ShelfType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Internal => write!(f, "internal"),
            Self::Isolated => write!(f, "isolated"),
        }
    }
}

/// Settings of an execution boundary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IsolationSettings {
    pub application_base: PathBuf,
    pub configuration_file: PathBuf,
    pub shadow_copy: bool,
}

/// The supervisor's own boundary settings.
pub type SupervisorSettings = IsolationSettings;

impl IsolationSettings {
    /// Settings of the currently running supervisor process.
    ///
    /// The base directory is the directory of the executable, and the
    /// configuration file sits next to it as `<executable>.config`.
    pub fn current() -> Result<Self> {
        let exe = std::env::current_exe().map_err(Error::CurrentExe)?;
        let application_base = exe
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| Error::NoBaseDirectory(exe.clone()))?;

        let mut configuration_file = exe.into_os_string();
        configuration_file.push(".config");

        Ok(Self {
            application_base,
            configuration_file: PathBuf::from(configuration_file),
            shadow_copy: false,
        })
    }

    /// Computes the settings for a shelf.
    ///
    /// Deterministic in its inputs: the same service name, type, supervisor
    /// settings and config always yield the same settings.
    pub fn configure(
        service_name: &str,
        shelf_type: ShelfType,
        supervisor: &SupervisorSettings,
        config: &ShelfConfig,
    ) -> Self {
        if shelf_type == ShelfType::Internal {
            return supervisor.clone();
        }

        let application_base = supervisor
            .application_base
            .join(config.services_directory())
            .join(service_name);
        tracing::debug!(service = service_name, path = %application_base.display(), "application base");

        let configuration_file = application_base.join(format!("{}.config", service_name));
        tracing::debug!(service = service_name, path = %configuration_file.display(), "configuration file");

        Self {
            application_base,
            configuration_file,
            shadow_copy: true,
        }
    }
}

/// Supervisor configuration consumed by the shelf core.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShelfConfig {
    /// Directory, relative to the supervisor base, holding isolated shelves.
    pub services_directory: Option<String>,
}

impl ShelfConfig {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the configuration through an arbitrary key lookup.
    ///
    /// Surrounding whitespace is ignored; empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let services_directory = lookup(SERVICES_DIRECTORY_ENV)
            .map(|dir| dir.trim().to_string())
            .filter(|dir| !dir.is_empty());
        Self { services_directory }
    }

    /// The services directory, falling back to [`DEFAULT_SERVICES_DIRECTORY`].
    pub fn services_directory(&self) -> &str {
        self.services_directory
            .as_deref()
            .unwrap_or(DEFAULT_SERVICES_DIRECTORY)
    }
}

//! # Bootstrap Protocol
//!
//! Construction of a shelf is a two-phase handshake:
//!
//! 1. The supervisor issues a construct command ([`BootstrapRequest`]) to the
//!    isolation context, carrying the bootstrapper identity and the
//!    coordinates of the supervisor's control channel.
//! 2. Once the shelf is ready to receive, it sends [`ShelfReady`] back over
//!    the control channel, reporting where it listens.
//!
//! For process workers the construct command travels as command line
//! arguments; `to_args` and `from_args` are exact inverses.

use crate::channel::ChannelAddress;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    UnknownArgument(String),
    MissingValue(&'static str),
    MissingArgument(&'static str),
    MalformedHandshake(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownArgument(arg) => write!(f, "Unknown argument: {}", arg),
            Self::MissingValue(flag) => write!(f, "Missing value for {}", flag),
            Self::MissingArgument(flag) => write!(f, "Missing required argument {}", flag),
            Self::MalformedHandshake(msg) => write!(f, "Malformed handshake: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

const SERVICE: &str = "--service";
const CONTROL_ADDRESS: &str = "--control-address";
const CONTROL_CHANNEL: &str = "--control-channel";
const BOOTSTRAPPER: &str = "--bootstrapper";
const BOOTSTRAPPER_PACKAGE: &str = "--bootstrapper-package";
const BOOTSTRAPPER_VERSION: &str = "--bootstrapper-version";
const MODULE: &str = "--module";

/// Names the type that initializes a shelf's service logic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BootstrapperIdentity {
    pub name: String,
    pub package: Option<String>,
    pub version: Option<String>,
}

impl BootstrapperIdentity {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            package: None,
            version: None,
        }
    }

    pub fn package(mut self, package: impl Into<String>) -> Self {
        self.package = Some(package.into());
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

impl std::fmt::Display for BootstrapperIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.package {
            Some(package) => write!(f, "{}::{}", package, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// An additional code unit loaded into an isolation context.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModuleIdentity(pub String);

impl ModuleIdentity {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ModuleIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The construct command handed to an isolation context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapRequest {
    pub service_name: String,
    pub bootstrapper: Option<BootstrapperIdentity>,
    pub control_address: ChannelAddress,
    pub control_channel: String,
    /// Modules loaded before construction, as resolved by the context.
    pub modules: Vec<String>,
}

impl BootstrapRequest {
    /// Encodes the request as worker command line arguments.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            SERVICE.to_string(),
            self.service_name.clone(),
            CONTROL_ADDRESS.to_string(),
            self.control_address.to_string(),
            CONTROL_CHANNEL.to_string(),
            self.control_channel.clone(),
        ];

        if let Some(bootstrapper) = &self.bootstrapper {
            args.push(BOOTSTRAPPER.to_string());
            args.push(bootstrapper.name.clone());
            if let Some(package) = &bootstrapper.package {
                args.push(BOOTSTRAPPER_PACKAGE.to_string());
                args.push(package.clone());
            }
            if let Some(version) = &bootstrapper.version {
                args.push(BOOTSTRAPPER_VERSION.to_string());
                args.push(version.clone());
            }
        }

        for module in &self.modules {
            args.push(MODULE.to_string());
            args.push(module.clone());
        }

        args
    }

    /// Parses worker command line arguments, excluding the program name.
    pub fn from_args<I>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut service_name = None;
        let mut control_address = None;
        let mut control_channel = None;
        let mut name = None;
        let mut package = None;
        let mut version = None;
        let mut modules = Vec::new();

        let mut args = args.into_iter();
        while let Some(flag) = args.next() {
            let (known, slot) = match flag.as_str() {
                SERVICE => (SERVICE, &mut service_name),
                CONTROL_ADDRESS => (CONTROL_ADDRESS, &mut control_address),
                CONTROL_CHANNEL => (CONTROL_CHANNEL, &mut control_channel),
                BOOTSTRAPPER => (BOOTSTRAPPER, &mut name),
                BOOTSTRAPPER_PACKAGE => (BOOTSTRAPPER_PACKAGE, &mut package),
                BOOTSTRAPPER_VERSION => (BOOTSTRAPPER_VERSION, &mut version),
                MODULE => {
                    modules.push(args.next().ok_or(Error::MissingValue(MODULE))?);
                    continue;
                }
                _ => return Err(Error::UnknownArgument(flag.clone())),
            };
            let value = args.next().ok_or(Error::MissingValue(known))?;
            *slot = Some(value);
        }

        let bootstrapper = match name {
            Some(name) => Some(BootstrapperIdentity { name, package, version }),
            None if package.is_some() || version.is_some() => {
                return Err(Error::MissingArgument(BOOTSTRAPPER));
            }
            None => None,
        };

        Ok(Self {
            service_name: service_name.ok_or(Error::MissingArgument(SERVICE))?,
            bootstrapper,
            control_address: ChannelAddress::new(
                control_address.ok_or(Error::MissingArgument(CONTROL_ADDRESS))?,
            ),
            control_channel: control_channel.ok_or(Error::MissingArgument(CONTROL_CHANNEL))?,
            modules,
        })
    }
}

/// Handshake sent by a shelf once it is ready to receive.
///
/// Wire form is a single line: `ready <address> <channel_name>`. Neither
/// field may contain whitespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShelfReady {
    pub address: ChannelAddress,
    pub channel_name: String,
}

impl ShelfReady {
    pub fn new(address: impl Into<ChannelAddress>, channel_name: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            channel_name: channel_name.into(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        format!("ready {} {}", self.address, self.channel_name).into_bytes()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(payload)
            .map_err(|e| Error::MalformedHandshake(e.to_string()))?;

        let mut parts = text.split_whitespace();
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some("ready"), Some(address), Some(channel_name), None) => {
                Ok(Self::new(ChannelAddress::new(address), channel_name))
            }
            _ => Err(Error::MalformedHandshake(text.to_string())),
        }
    }
}

//! Server configuration.
//!
//! Values come from an optional JSON file; command-line flags override it.

use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, RustStkError};
use crate::rpc::portmap::PMAP_PORT;

pub const DEFAULT_CSI_PORT: u16 = 4400;
pub const DEFAULT_TAPE_SERVER_PORT: u16 = 4401;
pub const DEFAULT_CALLBACK_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_CELLS: u32 = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    /// Directory the catalog's image paths are relative to.
    pub library_root: PathBuf,
    /// Volume catalog; `<library_root>/catalog.json` when unset.
    pub catalog: Option<PathBuf>,
    pub bind_address: IpAddr,
    /// Run the local port mapper. Without it programs register with
    /// `foreign_portmapper` only.
    pub portmapper: bool,
    pub portmapper_port: u16,
    pub csi_port: u16,
    pub tape_server_port: u16,
    /// `host[:port]` of a system port mapper to mirror registrations to.
    pub foreign_portmapper: Option<String>,
    pub callback_timeout_secs: u64,
    /// Storage cells in the emulated library.
    pub cells: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            library_root: PathBuf::from("."),
            catalog: None,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            portmapper: true,
            portmapper_port: PMAP_PORT,
            csi_port: DEFAULT_CSI_PORT,
            tape_server_port: DEFAULT_TAPE_SERVER_PORT,
            foreign_portmapper: None,
            callback_timeout_secs: DEFAULT_CALLBACK_TIMEOUT_SECS,
            cells: DEFAULT_CELLS,
        }
    }
}

/// Values given on the command line; `None` leaves the file value alone.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub library_root: Option<PathBuf>,
    pub catalog: Option<PathBuf>,
    pub bind_address: Option<IpAddr>,
    pub no_portmapper: bool,
    pub portmapper_port: Option<u16>,
    pub csi_port: Option<u16>,
    pub tape_server_port: Option<u16>,
    pub foreign_portmapper: Option<String>,
    pub callback_timeout_secs: Option<u64>,
    pub cells: Option<u32>,
}

impl ServerConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .map_err(|e| RustStkError::config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: ServerConfig = serde_json::from_str(&json)
            .map_err(|e| RustStkError::config(format!("invalid {}: {}", path.display(), e)))?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// The file configuration if a path is given, otherwise the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn apply(&mut self, overrides: ConfigOverrides) {
        if let Some(root) = overrides.library_root {
            self.library_root = root;
        }
        if overrides.catalog.is_some() {
            self.catalog = overrides.catalog;
        }
        if let Some(address) = overrides.bind_address {
            self.bind_address = address;
        }
        if overrides.no_portmapper {
            self.portmapper = false;
        }
        if let Some(port) = overrides.portmapper_port {
            self.portmapper_port = port;
        }
        if let Some(port) = overrides.csi_port {
            self.csi_port = port;
        }
        if let Some(port) = overrides.tape_server_port {
            self.tape_server_port = port;
        }
        if overrides.foreign_portmapper.is_some() {
            self.foreign_portmapper = overrides.foreign_portmapper;
        }
        if let Some(secs) = overrides.callback_timeout_secs {
            self.callback_timeout_secs = secs;
        }
        if let Some(cells) = overrides.cells {
            self.cells = cells;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.callback_timeout_secs == 0 {
            return Err(RustStkError::parameter_validation(
                "callback timeout must be at least one second",
            ));
        }
        if !self.portmapper && self.foreign_portmapper.is_none() {
            return Err(RustStkError::parameter_validation(
                "without the local port mapper a foreign port mapper is required",
            ));
        }
        if self.portmapper && self.csi_port != 0 && self.portmapper_port == self.csi_port {
            return Err(RustStkError::parameter_validation(format!(
                "port mapper and CSI cannot share UDP port {}",
                self.csi_port
            )));
        }
        Ok(())
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.catalog
            .clone()
            .unwrap_or_else(|| self.library_root.join("catalog.json"))
    }

    pub fn callback_timeout(&self) -> Duration {
        Duration::from_secs(self.callback_timeout_secs)
    }

    pub fn portmapper_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.portmapper_port)
    }

    pub fn csi_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.csi_port)
    }

    pub fn tape_server_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.tape_server_port)
    }
}

use clap::{Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;

use crate::config::ConfigOverrides;

#[derive(Parser)]
#[command(name = "ruststk")]
#[command(about = "StorageTek ACSLS tape library emulator with ONC RPC port mapper and tape server")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Specify configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the port mapper, the ACSLS server and the tape server
    Serve {
        /// Directory holding the tape images
        #[arg(short = 'r', long, value_name = "DIR")]
        library_root: Option<PathBuf>,

        /// Volume catalog (defaults to catalog.json in the library root)
        #[arg(long, value_name = "FILE")]
        catalog: Option<PathBuf>,

        /// Address to bind all listeners to
        #[arg(long, value_name = "ADDR")]
        bind: Option<IpAddr>,

        /// Do not start the local port mapper
        #[arg(long)]
        no_portmapper: bool,

        /// UDP port of the port mapper
        #[arg(long, value_name = "PORT")]
        portmapper_port: Option<u16>,

        /// UDP port of the ACSLS CSI program
        #[arg(long, value_name = "PORT")]
        csi_port: Option<u16>,

        /// TCP port of the tape server
        #[arg(long, value_name = "PORT")]
        tape_server_port: Option<u16>,

        /// System port mapper to mirror registrations to (host[:port])
        #[arg(long, value_name = "HOST")]
        foreign_portmapper: Option<String>,

        /// Seconds to wait for each callback reply
        #[arg(long, value_name = "SECS")]
        callback_timeout: Option<u64>,

        /// Storage cells in the library
        #[arg(long)]
        cells: Option<u32>,
    },

    /// List the programs registered with a port mapper
    Rpcinfo {
        /// Port mapper host (host[:port])
        #[arg(value_name = "HOST", default_value = "127.0.0.1")]
        host: String,

        /// Seconds to wait for the reply
        #[arg(short, long, default_value = "5")]
        timeout: u64,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

impl Commands {
    /// The configuration overrides carried by `serve`.
    pub fn overrides(&self) -> Option<ConfigOverrides> {
        match self {
            Commands::Serve {
                library_root,
                catalog,
                bind,
                no_portmapper,
                portmapper_port,
                csi_port,
                tape_server_port,
                foreign_portmapper,
                callback_timeout,
                cells,
            } => Some(ConfigOverrides {
                library_root: library_root.clone(),
                catalog: catalog.clone(),
                bind_address: *bind,
                no_portmapper: *no_portmapper,
                portmapper_port: *portmapper_port,
                csi_port: *csi_port,
                tape_server_port: *tape_server_port,
                foreign_portmapper: foreign_portmapper.clone(),
                callback_timeout_secs: *callback_timeout,
                cells: *cells,
            }),
            Commands::Rpcinfo { .. } => None,
        }
    }
}

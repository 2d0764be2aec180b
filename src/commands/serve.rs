//! Serve Command Handler
//!
//! Handles the `serve` subcommand: loads the catalog, starts the port
//! mapper, the CSI_ACSLM program and the tape server, and runs until
//! interrupted.

use std::sync::Arc;

use rust_stk::config::ServerConfig;
use rust_stk::error::{Result, RustStkError};
use rust_stk::rpc::portmap::PortMapper;
use rust_stk::rpc::{ProgramRegistry, Registration, RpcCaller, UdpServer};
use rust_stk::stk::catalog;
use rust_stk::stk::{CallbackDispatcher, Library, StkCsi, TapeServer};
use tokio::task::JoinSet;
use tracing::{error, info};

pub async fn execute(config: ServerConfig) -> Result<()> {
    config.validate()?;
    info!("Starting StorageTek library emulator");
    info!("Library root: {}", config.library_root.display());

    let mut library = Library::new(&config.library_root, config.cells);
    library.merge_catalog(catalog::load_catalog(config.catalog_path())?);
    let library = library.into_shared();

    let caller = RpcCaller::new(config.callback_timeout());
    let foreign = config
        .foreign_portmapper
        .as_deref()
        .map(ProgramRegistry::resolve_foreign_address)
        .transpose()?;
    if let Some(addr) = foreign {
        info!("Mirroring registrations to port mapper at {}", addr);
    }
    let registry = Arc::new(ProgramRegistry::new(foreign, caller.clone()));

    let mut tasks = JoinSet::new();

    if config.portmapper {
        let portmapper = Arc::new(
            PortMapper::new(Arc::clone(&registry)).with_bind_address(config.bind_address),
        );
        let server = UdpServer::bind(Arc::clone(&registry), "portmapper", config.portmapper_addr()).await?;
        registry.register_program(Registration::local(portmapper, Some(server.local_port()), None));
        tasks.spawn(server.run());
    }

    let (dispatcher, responses) = CallbackDispatcher::new(caller);
    let csi = Arc::new(StkCsi::new(Arc::clone(&library), responses));
    let server = UdpServer::bind(Arc::clone(&registry), "CSI_ACSLM", config.csi_addr()).await?;
    registry.register_program(Registration::local(csi, Some(server.local_port()), None));
    tasks.spawn(server.run());
    tasks.spawn(async move {
        dispatcher.run().await;
        Ok(())
    });

    let tape_server = TapeServer::bind(config.tape_server_addr(), library).await?;
    tasks.spawn(tape_server.run());

    info!("Library ready");
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Interrupted, shutting down");
            Ok(())
        }
        Some(joined) = tasks.join_next() => {
            let outcome = joined.map_err(|e| RustStkError::Generic(e.into()))?;
            if let Err(e) = &outcome {
                error!("Server task failed: {}", e);
            }
            outcome
        }
    }
}

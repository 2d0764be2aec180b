//! Rpcinfo Command Handler
//!
//! Handles the `rpcinfo` subcommand: dumps a port mapper's table.

use std::time::Duration;

use rust_stk::error::{Result, RustStkError};
use rust_stk::rpc::portmap::{decode_dump, PMAPPROC_DUMP, PMAP_PROG, PMAP_VERS};
use rust_stk::rpc::{CallResult, ProgramRegistry, RpcCaller};
use rust_stk::stk::constants::CSI_PROGRAM;
use tracing::info;

pub async fn execute(host: String, timeout: u64) -> Result<()> {
    let addr = ProgramRegistry::resolve_foreign_address(&host)?;
    info!("Querying port mapper at {}", addr);

    let caller = RpcCaller::new(Duration::from_secs(timeout.max(1)));
    let body = match caller.call(addr, PMAP_PROG, PMAP_VERS, PMAPPROC_DUMP, &[]).await {
        CallResult::Success(body) => body,
        other => {
            return Err(RustStkError::rpc(format!(
                "DUMP from {} failed: {}",
                addr, other
            )))
        }
    };

    let mappings = decode_dump(&body)?;
    println!("   program vers proto   port  service");
    for mapping in &mappings {
        println!(
            "{:>10} {:>4} {:>5} {:>6}  {}",
            mapping.program,
            mapping.version,
            mapping.protocol.to_string(),
            mapping.port,
            service_name(mapping.program)
        );
    }
    info!("{} mappings", mappings.len());
    Ok(())
}

fn service_name(program: u32) -> &'static str {
    match program {
        PMAP_PROG => "portmapper",
        CSI_PROGRAM => "csi_acslm",
        _ => "",
    }
}

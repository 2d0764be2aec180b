mod commands;

use rust_stk::cli::{Cli, Commands};
use rust_stk::config::ServerConfig;
use rust_stk::error::Result;
use rust_stk::logger;
use tracing::{debug, error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse_args();

    // Initialize logging system
    logger::init(args.verbose)?;

    debug!("ruststk starting");

    match run(args).await {
        Ok(_) => {
            info!("Operation completed successfully");
            Ok(())
        }
        Err(e) => {
            error!("Operation failed: {}", e);
            std::process::exit(1);
        }
    }
}

async fn run(args: Cli) -> Result<()> {
    let overrides = args.command.overrides();
    match args.command {
        Commands::Serve { .. } => {
            let mut config = ServerConfig::load_or_default(args.config.as_deref())?;
            if let Some(overrides) = overrides {
                config.apply(overrides);
            }
            commands::serve::execute(config).await
        }

        Commands::Rpcinfo { host, timeout } => commands::rpcinfo::execute(host, timeout).await,
    }
}

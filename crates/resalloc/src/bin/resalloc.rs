use std::path::Path;

use clap::{CommandFactory, FromArgMatches};
use tokio_util::sync::CancellationToken;

use resalloc::allocation::bootstrap::create_allocation_manager;
use resalloc::allocation::manager::AllocationManager;
use resalloc::common::cli::{AllocateOpts, RateOpts, RootOptions, SubCommand, WorkerStartOpts};
use resalloc::common::config::ResAllocConfig;
use resalloc::common::setup::setup_logging;
use resalloc::transport::ssh::SshTransport;
use resalloc::worker::start::run_worker;

async fn create_manager(config: Option<&Path>) -> anyhow::Result<AllocationManager> {
    let config = match config {
        Some(path) => {
            log::debug!("Loading configuration from {}", path.display());
            ResAllocConfig::load(path)?
        }
        None => ResAllocConfig::default(),
    };
    create_allocation_manager(&config, &SshTransport::new()).await
}

// Commands

async fn command_worker(opts: WorkerStartOpts) -> anyhow::Result<()> {
    run_worker(opts.name).await
}

async fn command_rate(config: Option<&Path>, opts: RateOpts) -> anyhow::Result<()> {
    let request = opts.request.load_request()?;
    let manager = create_manager(config).await?;
    let ratings: serde_json::Map<String, serde_json::Value> = manager
        .rate_all(&request)
        .await
        .into_iter()
        .map(|(name, rating)| Ok((name, serde_json::to_value(rating)?)))
        .collect::<anyhow::Result<_>>()?;
    println!("{}", serde_json::to_string_pretty(&ratings)?);
    Ok(())
}

async fn command_allocate(config: Option<&Path>, opts: AllocateOpts) -> anyhow::Result<()> {
    let request = opts.request.load_request()?;
    let manager = create_manager(config).await?;

    let cancel = CancellationToken::new();
    if let Some(timeout) = opts.timeout {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            cancel.cancel();
        });
    }
    let worker = manager.allocate_with_cancel(&request, &cancel).await?;
    println!("{}", serde_json::to_string(&worker.info)?);

    if opts.hold {
        log::info!("Holding worker {}, press Ctrl-C to release it", worker.info.name);
        tokio::signal::ctrl_c().await?;
    }
    manager.release(worker.handle).await;
    Ok(())
}

#[tokio::main]
async fn main() -> resalloc::Result<()> {
    let matches = RootOptions::command().get_matches();
    let top_opts = match RootOptions::from_arg_matches(&matches) {
        Ok(opts) => opts,
        Err(error) => error.exit(),
    };

    let worker = match &top_opts.subcmd {
        SubCommand::Worker(opts) => Some(opts.name.as_str()),
        _ => None,
    };
    setup_logging(top_opts.common.debug, worker);

    let config = top_opts.common.config.as_deref();
    let result = match top_opts.subcmd {
        SubCommand::Worker(opts) => command_worker(opts).await,
        SubCommand::Allocate(opts) => command_allocate(config, opts).await,
        SubCommand::Rate(opts) => command_rate(config, opts).await,
    };

    if let Err(error) = result {
        log::error!("{error:?}");
        std::process::exit(1);
    }

    Ok(())
}

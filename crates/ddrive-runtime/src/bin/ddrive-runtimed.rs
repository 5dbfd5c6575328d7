use clap::Parser;
use lloggs::{LoggingArgs, PreArgs, WorkerGuard};
use miette::{miette, IntoDiagnostic, Result, WrapErr};
use tracing::{debug, info};

use ddrive_runtime::{Runtime, RuntimeConfig};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// D-Drive storage runtime: cron scheduler, backup worker, and reconciler
/// sweeps for a chat-service-backed personal cloud.
#[derive(Debug, Clone, Parser)]
pub struct Args {
	#[command(flatten)]
	logging: LoggingArgs,
}

fn get_args() -> Result<(Args, WorkerGuard)> {
	let log_guard = PreArgs::parse().setup().map_err(|err| miette!("{err}"))?;

	debug!("parsing arguments");
	let args = Args::parse();

	let log_guard = match log_guard {
		Some(g) => g,
		None => args
			.logging
			.setup(|v| match v {
				0 => "ddrive_runtime=info,ddrive_core=info,ddrive_backup=info",
				1 => "info,ddrive_runtime=debug,ddrive_core=debug,ddrive_backup=debug",
				2 => "debug",
				_ => "trace",
			})
			.map_err(|err| miette!("{err}"))?,
	};

	debug!(?args, "got arguments");
	Ok((args, log_guard))
}

#[tokio::main]
async fn main() -> Result<()> {
	let (_args, _guard) = get_args()?;

	let config = RuntimeConfig::from_env().wrap_err("loading runtime configuration from environment")?;
	let runtime = Runtime::new(config).await.map_err(|err| miette!("{err}")).wrap_err("starting runtime")?;

	runtime.start().await.map_err(|err| miette!("{err}"))?;
	info!("ddrive-runtimed is running");

	tokio::signal::ctrl_c().await.into_diagnostic()?;
	info!("received shutdown signal");
	runtime.stop().await;

	Ok(())
}

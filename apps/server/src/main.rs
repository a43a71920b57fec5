use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::Parser;
use fleetway_core::{Core, CoreConfig};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "fleetway-server", about = "Fleet update distribution server")]
struct Args {
	/// Root directory for update, device and directory storage.
	#[arg(long, env = "DATA_DIR", default_value = "fleetway_data")]
	data_dir: PathBuf,

	#[arg(long, env = "PORT", default_value_t = 8080)]
	port: u16,

	/// Idle seconds before a tail connection gets a keep-alive frame.
	#[arg(long, env = "KEEPALIVE_SECS", default_value_t = 30)]
	keepalive_secs: u64,

	/// Journal growth poll interval for tail readers.
	#[arg(long, env = "POLL_INTERVAL_MS", default_value_t = 500)]
	poll_interval_ms: u64,

	/// Retention cap for per-device raw event files.
	#[arg(long, env = "MAX_EVENT_FILES", default_value_t = 20)]
	max_event_files: usize,

	/// Seconds between device directory reconciliation passes.
	#[arg(long, env = "RECONCILE_SECS", default_value_t = 300)]
	reconcile_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
			EnvFilter::new("info,fleetway_core=debug,fleetway_server=debug")
		}))
		.init();

	let args = Args::parse();
	let mut config = CoreConfig::new(&args.data_dir);
	config.keepalive = Duration::from_secs(args.keepalive_secs);
	config.poll_interval = Duration::from_millis(args.poll_interval_ms);
	config.max_event_files = args.max_event_files;
	config.reconcile_interval = Duration::from_secs(args.reconcile_secs);

	let core = Core::new(config).await?;
	let shutdown = CancellationToken::new();
	let reconciler = core.spawn_reconciler(shutdown.clone());

	// Listens on IPv6 and IPv4.
	let mut addr: SocketAddr = "[::]:8080".parse()?;
	addr.set_port(args.port);
	info!("listening on http://localhost:{}", args.port);

	axum::Server::bind(&addr)
		.serve(fleetway_server::router(core).into_make_service())
		.with_graceful_shutdown(async {
			let _ = tokio::signal::ctrl_c().await;
			info!("shutting down");
		})
		.await?;

	shutdown.cancel();
	let _ = reconciler.await;
	Ok(())
}

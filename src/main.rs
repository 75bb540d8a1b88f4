//! Process bootstrap for the osquery↔Bro bridge.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use osquery_bro_bridge::{
	BridgeConfig, BrokerManager, DispatchLoop, FileConfigSink,
	FileResultSink, MqttEndpoint, NodeIdentity, OsqueryiEngine, QueryEngine,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Client name presented to the broker.
const ENDPOINT_NAME: &str = "osquery-bro-bridge";
/// Capacity of the inbound dispatch work queue.
const DISPATCH_QUEUE_CAPACITY: usize = 100;
/// Query the announce addresses are sourced from.
const ADDRESS_QUERY: &str = "SELECT address FROM interface_addresses";

#[derive(Parser, Debug)]
#[command(version, about = "Bridge osquery hosts to a Bro/Zeek monitor")]
struct Cli {
	/// osquery config file carrying the `bro` section
	#[arg(long, default_value = "/etc/osquery/osquery.conf")]
	config: PathBuf,

	/// Where merged config (with the live schedule) is written back
	#[arg(long, default_value = "osquery_bro.conf")]
	config_out: PathBuf,

	/// Where snapshot result records go; `-` for stdout
	#[arg(long, default_value = "-")]
	result_log: PathBuf,

	/// osqueryi binary used to execute queries
	#[arg(long, default_value = "osqueryi")]
	osqueryi: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
	tracing_subscriber::fmt()
		.with_env_filter(
			EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| EnvFilter::new("info")),
		)
		.init();

	match run(Cli::parse()).await {
		| Ok(()) => ExitCode::SUCCESS,
		| Err(err) => {
			error!(error = %err, "fatal error");
			ExitCode::FAILURE
		}
	}
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
	let config = BridgeConfig::load(&cli.config)?;
	info!(endpoint = %config.endpoint, "retrieved broker endpoint");

	let node_id = NodeIdentity::from_host()
		.ok_or("cannot derive a node identity from this host")?;
	info!(node_id = %node_id, groups = ?config.groups, "node identity");

	let engine = OsqueryiEngine::new(&cli.osqueryi);

	info!(addr = %config.endpoint, "connecting to broker");
	let (endpoint, driver) = MqttEndpoint::connect(
		ENDPOINT_NAME,
		&config.endpoint,
		&config.connect_retry,
	)
	.await?;

	let mut manager = BrokerManager::new(
		endpoint.clone(),
		node_id,
		config.groups.clone(),
		config.schedule_interval,
	);
	manager.open_default_queues().await?;

	// Announce this host; addresses come from the query engine, and a
	// failure here is a fatal startup error.
	let addresses: Vec<String> = engine
		.query(ADDRESS_QUERY)
		.await?
		.into_iter()
		.filter_map(|mut row| row.remove("address"))
		.collect();
	manager.announce(&addresses).await?;

	let mut static_sources = HashMap::new();
	static_sources
		.insert("filesystem".to_owned(), config.raw().to_owned());
	let (dispatch, queue, controller) = DispatchLoop::new(
		manager,
		engine,
		FileResultSink::new(&cli.result_log),
		FileConfigSink::new(&cli.config_out),
		static_sources,
		config.sink_retry.clone(),
		DISPATCH_QUEUE_CAPACITY,
	);
	let driver_handle = driver.spawn(queue);
	let mut dispatch_handle = tokio::spawn(dispatch.run());

	// On interrupt, ask the dispatch loop to stop and let it finish the
	// message it is on before tearing the connection down.
	let dispatch_result = tokio::select! {
		res = &mut dispatch_handle => res,
		_ = tokio::signal::ctrl_c() => {
			info!("interrupt signal received");
			controller.shutdown();
			(&mut dispatch_handle).await
		}
	};

	// Teardown: disconnect lets the driver task observe the outgoing
	// disconnect and terminate on its own.
	if let Err(err) = endpoint.disconnect().await {
		error!(error = %err, "failed to disconnect from broker");
	}
	let _ = driver_handle.await;
	dispatch_result??;
	Ok(())
}

//! cors-relay: streaming CORS gateway that relays browser requests to a
//! target URL carried in the request, optionally through a resolver hop.

mod config;
mod cors;
mod error;
mod proxy;
mod server;

use config::RelayConfig;
use server::AppState;

fn main() -> anyhow::Result<()> {
    // Parse CLI args
    let args: Vec<String> = std::env::args().collect();
    let config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1).cloned())
        .or_else(|| args.get(1).filter(|a| !a.starts_with('-')).cloned())
        .or_else(|| std::env::var("RELAY_CONFIG").ok())
        .unwrap_or_else(|| "cors-relay.toml".to_string());

    let config = RelayConfig::load(&config_path)?;

    // The OTLP gRPC exporter needs a reactor, so build the runtime first
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let tracing_guard = relay_tracing::init_tracing(&config.tracing);

        tracing::info!(
            config_path = %config_path,
            listen_address = %config.server.listen_address(),
            resolver = config.resolver.enabled,
            allowed_hosts = config.policy.allowed_hosts.len(),
            denied_hosts = config.policy.denied_hosts.len(),
            otlp = tracing_guard.exporting(),
            "Starting cors-relay"
        );

        let state = AppState::from_config(config)?;
        server::run(state).await
    })
}

// broker: Library entry point.
// Exposes modules for integration testing.

pub mod actions;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod listener;
pub mod relay;
pub mod router;

use tracing::info;

/// Wire the subsystems together and serve until a shutdown signal.
pub async fn run(config: config::BrokerConfig) -> Result<(), listener::StartupError> {
    use discovery::DiscoveryOracle;

    let actions = actions::parse_actions(&config.actions);
    info!(actions = actions.len(), relays = config.relays.len(), "broker starting");

    let router = router::spawn_router(actions, config.limits.queue_capacity);
    let mut relays = relay::RelayManager::start(config.relays.clone(), router.clone());

    let mut oracle = discovery::StaticOracle::new(
        config
            .discovery_peers
            .iter()
            .map(|peer| (peer.name.clone(), peer.uri.clone()))
            .collect(),
    );
    if !config.discovery_peers.is_empty() {
        oracle.start(relays.discovery_sink());
    }

    let _listeners = listener::start_listeners(&config, router).await?;

    shutdown_signal().await;
    info!("shutting down");
    oracle.stop();
    relays.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

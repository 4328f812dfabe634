use anyhow::Result;
use lib_common::{redact_url_password, CacheHandler, RedisSettings};
use tokio::signal;
use tokio::sync::{broadcast, mpsc};

mod scanner_logic;
use scanner_logic::{
    catalyst, config, consumers, downstream, logger, monitor, pubsub, sampler, state, upstream,
};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Explicitly install the default crypto provider for rustls
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = config::load_config();
    logger::setup_logging(&config.log_dir, &config.log_level)?;

    let settings = RedisSettings {
        host: config.redis_host.clone(),
        port: config.redis_port,
        password: config.redis_password.clone(),
    };
    log::info!(
        "Scanner gateway booting; redis at {}",
        redact_url_password(&settings.url())
    );
    let redis = CacheHandler::connect(&settings).await?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let app_state = state::AppState::new(config.clone(), redis, command_tx);

    let mut handles = vec![
        tokio::spawn(consumers::run_ranking(
            app_state.clone(),
            shutdown_tx.subscribe(),
        )),
        tokio::spawn(consumers::run_aggregates(
            app_state.clone(),
            shutdown_tx.subscribe(),
        )),
        tokio::spawn(consumers::run_quotes(
            app_state.clone(),
            shutdown_tx.subscribe(),
        )),
        tokio::spawn(consumers::run_filings(
            app_state.clone(),
            shutdown_tx.subscribe(),
        )),
        tokio::spawn(consumers::run_news(
            app_state.clone(),
            shutdown_tx.subscribe(),
        )),
        tokio::spawn(upstream::run(
            app_state.clone(),
            command_rx,
            shutdown_tx.subscribe(),
        )),
        tokio::spawn(sampler::run(app_state.clone(), shutdown_tx.subscribe())),
        tokio::spawn(pubsub::run(app_state.clone(), shutdown_tx.subscribe())),
        tokio::spawn(catalyst::run(app_state.clone(), shutdown_tx.subscribe())),
        tokio::spawn(monitor::run(app_state.clone(), shutdown_tx.subscribe())),
    ];
    handles.push(tokio::spawn(downstream::run(
        config.clone(),
        app_state.clone(),
        shutdown_tx.subscribe(),
    )));

    // Wait for shutdown signal
    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = async {
            #[cfg(unix)]
            {
                let mut term_signal = signal::unix::signal(signal::unix::SignalKind::terminate()).unwrap();
                term_signal.recv().await;
                log::info!("SIGTERM received, initiating shutdown.");
            }
            #[cfg(not(unix))]
            {
                // On non-unix platforms, just wait forever.
                std::future::pending::<()>().await;
            }
        } => {}
    }

    // Send shutdown signal to all components
    let _ = shutdown_tx.send(());

    // Close every open client socket so the downstream server can finish
    // its graceful shutdown.
    for conn in app_state.registry.handles() {
        app_state.disconnect(conn.id);
    }

    // Wait for components to shut down
    for handle in handles {
        let _ = handle.await;
    }

    log::info!("Shutdown complete.");
    Ok(())
}

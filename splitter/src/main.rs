use clap::Parser;
use splitter::{Application, Config, telemetry};

/// Resolves on Ctrl+C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let received = tokio::select! {
        _ = ctrl_c => "Ctrl+C",
        _ = terminate => "SIGTERM",
    };
    tracing::info!("{received} received, finishing in-flight separations before exit");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let args = splitter::config::Args::parse();
    let config = Config::load(&args)?;

    if args.validate {
        println!(
            "Configuration OK: {:?} storage, up to {} concurrent separation(s)",
            config.storage.backend, config.separation.max_concurrent
        );
        return Ok(());
    }

    telemetry::init_telemetry(config.enable_otel_export)?;

    tracing::debug!(?args, "Parsed arguments");

    Application::new(config).await?.serve(shutdown_signal()).await
}

use std::net::SocketAddr;

use tracing_subscriber::EnvFilter;

use syncparty_server::config::ServerConfig;

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if std::env::var("SYNCPARTY_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json")) {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = ServerConfig::load();
    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "Invalid configuration");
        std::process::exit(1);
    }
    let listen_addr = config.listen_addr().to_string();

    let (app, state) = match syncparty_server::build_app(config) {
        Ok(built) => built,
        Err(e) => {
            tracing::error!(error = %e, "Failed to set up party records");
            std::process::exit(1);
        },
    };
    syncparty_server::spawn_maintenance(state);

    let listener = match tokio::net::TcpListener::bind(&listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %listen_addr, error = %e, "Failed to bind");
            std::process::exit(1);
        },
    };
    tracing::info!(addr = %listen_addr, "SyncParty hub listening");

    if let Err(e) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    {
        tracing::error!(error = %e, "Server error");
    }
    tracing::info!("SyncParty hub stopped");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

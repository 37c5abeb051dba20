use anyhow::Context;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    courier_observability::init();

    let bind_addr =
        std::env::var("COURIER_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

    let services = courier_api::app::services::build_services()
        .await
        .context("failed to build gateway services")?;
    services
        .gateway
        .start()
        .await
        .context("failed to start gateway")?;

    let app = courier_api::app::build_app(services.clone());

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;

    tracing::info!(addr = %listener.local_addr()?, mode = services.mode.as_str(), "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    services.gateway.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

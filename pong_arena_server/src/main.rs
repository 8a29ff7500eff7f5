use std::net::SocketAddr;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pong_arena_server::{state, AppState, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pong_arena_server=info,tower_http=info".into()),
        )
        .init();

    let cfg = Config::parse();
    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port).parse()?;
    let tls = match (cfg.domain.clone(), cfg.acme_email.clone()) {
        (Some(domain), Some(email)) => Some((domain, email)),
        _ => None,
    };
    let acme_cache = cfg.acme_cache.clone();
    let acme_staging = cfg.acme_staging;

    let state = AppState::new(cfg);
    let shutdown = state.shutdown.clone();
    let app = state::router(state);

    match tls {
        Some((domain, email)) => {
            serve_tls(app, addr, domain, email, acme_cache, acme_staging).await
        }
        None => {
            tracing::info!("listening on http://{}", addr);
            let listener = tokio::net::TcpListener::bind(addr).await?;
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = tokio::signal::ctrl_c().await;
                    tracing::info!("shutdown signal received");
                    let _ = shutdown.send(());
                })
                .await?;
            Ok(())
        }
    }
}

/// Terminate WSS/HTTPS in-process, with certificates obtained and renewed
/// over ACME. Only used when a domain and contact email are configured;
/// otherwise the server binds plain HTTP behind whatever fronts it.
async fn serve_tls(
    app: axum::Router,
    addr: SocketAddr,
    domain: String,
    email: String,
    cache_dir: String,
    staging: bool,
) -> anyhow::Result<()> {
    use rustls_acme::{caches::DirCache, AcmeConfig};
    use tokio_stream::StreamExt;

    tokio::fs::create_dir_all(&cache_dir).await?;
    let mut acme = AcmeConfig::new([domain.clone()])
        .contact([format!("mailto:{email}")])
        .cache(DirCache::new(cache_dir))
        .directory_lets_encrypt(staging)
        .state();
    let acceptor = acme.axum_acceptor(acme.default_rustls_config());

    tokio::spawn(async move {
        while let Some(event) = acme.next().await {
            match event {
                Ok(ok) => tracing::info!(event = ?ok, "certificate event"),
                Err(err) => tracing::error!(error = %err, "certificate renewal failed"),
            }
        }
    });

    tracing::info!(%addr, domain = %domain, staging, "listening with TLS");
    axum_server::bind(addr)
        .acceptor(acceptor)
        .serve(app.into_make_service())
        .await?;
    Ok(())
}

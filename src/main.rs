use anyhow::{Context, Result};
use ember_proxy::config::Config;
use ember_proxy::health::HealthState;
use ember_proxy::http::{self, HttpState};
use ember_proxy::metrics;
use ember_proxy::policy::PolicyEngine;
use ember_proxy::pow::{self, EthashLight};
use ember_proxy::shares::{Backend, RedisBackend, SharePipeline};
use ember_proxy::stratum::StratumServer;
use ember_proxy::template::{TemplateCache, TemplateRefresher};
use ember_proxy::upstream::{RpcClient, UpstreamApi, UpstreamSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.json".to_string());
    let config = Config::load(&config_path)?;
    tracing::info!("🚀 ember-proxy starting as instance {}", config.name);

    let backend = Arc::new(
        RedisBackend::new(
            &config.redis_url,
            Duration::from_secs(config.proxy.hashrate_expiration_secs),
        )
        .context("failed to set up redis backend")?,
    );

    let policy = PolicyEngine::new(
        config.proxy.policy.clone(),
        Some(backend.clone() as Arc<dyn Backend>),
    );
    policy.clone().start();

    let nodes: Vec<Arc<dyn UpstreamApi>> = config
        .upstream
        .iter()
        .map(|u| {
            tracing::info!("upstream: {} => {}", u.name, u.url);
            Arc::new(RpcClient::new(
                u.name.clone(),
                u.url.clone(),
                Duration::from_secs(u.timeout_secs),
            )) as Arc<dyn UpstreamApi>
        })
        .collect();
    let upstreams = UpstreamSet::new(nodes);
    tokio::spawn(
        upstreams
            .clone()
            .run(Duration::from_secs(config.upstream_check_interval_secs)),
    );

    let health = Arc::new(HealthState::new(config.proxy.health_check, config.proxy.max_fails));
    let cache = Arc::new(TemplateCache::new());

    let refresher = TemplateRefresher::new(
        upstreams.clone(),
        cache.clone(),
        health.clone(),
        Duration::from_millis(config.proxy.block_refresh_interval_ms),
    );
    // prime the cache once before serving miners
    refresher.refresh().await;
    tokio::spawn(refresher.run());

    let verifier = Arc::new(EthashLight::new());
    let pipeline = Arc::new(SharePipeline::new(
        cache.clone(),
        upstreams.clone(),
        policy.clone(),
        backend.clone() as Arc<dyn Backend>,
        verifier,
        config.proxy.difficulty,
    ));

    if config.proxy.stratum.enabled {
        let stratum = StratumServer::new(
            &config,
            policy.clone(),
            cache.clone(),
            pipeline.clone(),
            health.clone(),
        );
        tokio::spawn(async move {
            if let Err(e) = stratum.run().await {
                tracing::error!("stratum server failed: {}", e);
            }
        });
    }

    // Node-state heartbeat; its failures drive sickness, success clears it.
    {
        let cache = cache.clone();
        let backend = backend.clone();
        let health = health.clone();
        let name = config.name.clone();
        let interval = Duration::from_secs(config.proxy.state_update_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(template) = cache.current() else { continue };
                match backend
                    .write_node_state(&name, template.height, &template.difficulty.to_string())
                    .await
                {
                    Ok(()) => {
                        metrics::set_redis_up(true);
                        health.mark_ok();
                    }
                    Err(e) => {
                        tracing::error!("failed to write node state to backend: {}", e);
                        metrics::set_redis_up(false);
                        health.mark_sick();
                    }
                }
            }
        });
    }

    let http_state = HttpState {
        pipeline,
        policy,
        cache,
        health,
        backend: backend as Arc<dyn Backend>,
        diff_hex: pow::target_hex(config.proxy.difficulty),
        limit_headers_size: config.proxy.limit_headers_size,
        limit_body_size: config.proxy.limit_body_size,
        behind_reverse_proxy: config.proxy.behind_reverse_proxy,
    };
    let app = http::router(http_state);
    let listener = tokio::net::TcpListener::bind(&config.proxy.listen)
        .await
        .with_context(|| format!("failed to bind http listener on {}", config.proxy.listen))?;
    tracing::info!("📡 http dispatcher listening on {}", config.proxy.listen);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")?;

    tracing::info!("ember-proxy shut down");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("SIGTERM — shutting down"),
            _ = tokio::signal::ctrl_c() => tracing::info!("SIGINT — shutting down"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("failed to register ctrl-c handler");
        tracing::info!("ctrl-c — shutting down");
    }
}

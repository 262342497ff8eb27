mod api;
mod config;
mod error;
mod handlers;
mod manager;
mod reconciler;
mod routes;
mod store;
mod upstream;
mod worker;

mod server {
    pub mod infra;
    pub mod state;
}

use anyhow::Context;
use clap::Parser;
use config::{Cli, Commands, Settings};
use manager::RouteManager;
use reconciler::ScheduleReconciler;
use server::state::AppState;
use std::sync::Arc;
use store::Store;
use tokio::sync::watch;
use tracing::{info, warn};
use upstream::UpstreamClient;

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}

fn build_upstream(settings: &Settings) -> anyhow::Result<Arc<UpstreamClient>> {
    let client = reqwest::Client::builder()
        .build()
        .context("building http client")?;
    Ok(Arc::new(UpstreamClient::new(
        client,
        settings.api_url.clone(),
        settings.agency.clone(),
    )))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            shared_options,
            route,
            port,
            assets_path,
        } => {
            let settings: Settings = shared_options.into();
            let upstream = build_upstream(&settings)?;
            let store = Arc::new(Store::open(&settings.db_url)?);

            let (shutdown_tx, shutdown_rx) = watch::channel(false);

            match route {
                Some(route_tag) => {
                    run_single_route(settings, upstream, store, route_tag, shutdown_rx).await
                }
                None => {
                    run_supervisor(
                        settings,
                        upstream,
                        store,
                        port,
                        assets_path,
                        shutdown_tx,
                        shutdown_rx,
                    )
                    .await
                }
            }
        }
        Commands::UpdateSchedules {
            shared_options,
            route,
        } => {
            let settings: Settings = shared_options.into();
            let upstream = build_upstream(&settings)?;
            let store = Arc::new(Store::open(&settings.db_url)?);
            let reconciler = ScheduleReconciler::new(upstream, store);

            match route {
                Some(route_tag) => reconciler.reconcile_route(&route_tag).await?,
                None => reconciler.reconcile_all().await?,
            }
            Ok(())
        }
        Commands::UpdateRoutes { shared_options } => {
            let settings: Settings = shared_options.into();
            let upstream = build_upstream(&settings)?;
            let store = Store::open(&settings.db_url)?;

            let routes = upstream.list_routes().await?;
            let rows = routes
                .into_iter()
                .map(|r| store::RouteUpsert {
                    tag: r.tag,
                    title: r.title,
                })
                .collect::<Vec<_>>();
            store.bulk_upsert_routes(&rows)?;
            info!(count = rows.len(), "upserted routes");
            Ok(())
        }
    }
}

/// Diagnostic mode: run a single `RouteWorker` in the foreground, bypassing
/// `RouteManager`. Exits non-zero if `route_tag` isn't among the currently
/// active routes for today's service class, since there'd be nothing to
/// poll against.
async fn run_single_route(
    settings: Settings,
    upstream: Arc<UpstreamClient>,
    store: Arc<Store>,
    route_tag: String,
    shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let service_class = manager::current_service_class();
    let active = store.load_active_route_tags(&service_class)?;
    if !active.contains(&route_tag) {
        anyhow::bail!(
            "route {route_tag} is not active for service class {service_class}; \
             run update-schedules first"
        );
    }

    let worker = worker::RouteWorker::new(
        route_tag,
        service_class,
        std::time::Duration::from_secs(settings.prediction_update_seconds),
        settings.duplicate_arrival_threshold,
        settings.single_scheduled_arrival_threshold,
        upstream,
        store,
    );
    worker.run(shutdown_rx).await
}

async fn run_supervisor(
    settings: Settings,
    upstream: Arc<UpstreamClient>,
    store: Arc<Store>,
    port: u16,
    assets_path: String,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let last_reconcile_unix = Arc::new(std::sync::RwLock::new(None));

    let mut manager = RouteManager::new(
        settings,
        upstream,
        store.clone(),
        last_reconcile_unix.clone(),
    );
    let manager_shutdown = shutdown_rx.clone();
    let manager_handle = tokio::spawn(async move { manager.run(manager_shutdown).await });

    let state = AppState::new(store, assets_path, last_reconcile_unix);
    let app = routes::create_router(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding to port {port}"))?;
    info!(port, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(server::infra::shutdown_signal(shutdown_tx))
        .await
        .context("http server failed")?;

    match manager_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(error = %err, "route manager exited with an error"),
        Err(err) => warn!(error = %err, "route manager task panicked"),
    }

    Ok(())
}

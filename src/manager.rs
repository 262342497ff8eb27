// Supervises one RouteWorker per currently-active route, rotating the
// schedule at the configured service-day boundary (spec ยง4.4).
use crate::config::Settings;
use crate::reconciler::ScheduleReconciler;
use crate::store::Store;
use crate::upstream::UpstreamClient;
use crate::worker::RouteWorker;
use chrono::{Datelike, Local, Timelike, Weekday};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument};

/// Classifies today's service class from the local wall clock
/// ("sat" / "sun" / "wkd" — spec ยง4.4 step 2).
pub fn current_service_class() -> String {
    match Local::now().weekday() {
        Weekday::Sat => "sat",
        Weekday::Sun => "sun",
        _ => "wkd",
    }
    .to_string()
}

struct RunningWorker {
    route_tag: String,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<anyhow::Result<()>>,
}

pub struct RouteManager {
    settings: Settings,
    upstream: Arc<UpstreamClient>,
    store: Arc<Store>,
    reconciler: ScheduleReconciler,
    service_class: String,
    workers: Vec<RunningWorker>,
    last_reconcile_unix: Arc<RwLock<Option<i64>>>,
}

impl RouteManager {
    pub fn new(
        settings: Settings,
        upstream: Arc<UpstreamClient>,
        store: Arc<Store>,
        last_reconcile_unix: Arc<RwLock<Option<i64>>>,
    ) -> Self {
        let reconciler = ScheduleReconciler::new(upstream.clone(), store.clone());
        Self {
            settings,
            upstream,
            store,
            reconciler,
            service_class: current_service_class(),
            workers: Vec::new(),
            last_reconcile_unix,
        }
    }

    /// Runs `switch_day` once at start, then checks every ~60s whether the
    /// calendar date has advanced *and* we're past `day_switch_time`
    /// seconds-since-midnight, rotating when both hold (spec ยง4.4 step 2).
    #[instrument(skip(self, shutdown))]
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        self.switch_day(None).await;

        let mut current_day = Local::now().date_naive();
        let mut ticker = tokio::time::interval(Duration::from_secs(60));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let today = Local::now().date_naive();
                    if today != current_day {
                        let seconds_since_midnight = Local::now()
                            .num_seconds_from_midnight() as u32;
                        if seconds_since_midnight > self.settings.day_switch_time {
                            let previous = self.service_class.clone();
                            self.switch_day(Some(previous)).await;
                            current_day = today;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("route manager stopping");
                        break;
                    }
                }
            }
        }

        self.stop_workers().await;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn switch_day(&mut self, previous: Option<String>) {
        info!(?previous, "switching service day");

        match self.reconciler.reconcile_all().await {
            Ok(()) => {
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs() as i64;
                *self.last_reconcile_unix.write().unwrap() = Some(now);
            }
            Err(err) => error!(error = %err, "schedule reconciliation failed during day switch"),
        }

        self.service_class = current_service_class();

        let active_routes = match self.store.load_active_route_tags(&self.service_class) {
            Ok(routes) => routes,
            Err(err) => {
                error!(error = %err, "failed to load active routes, keeping previous worker set");
                return;
            }
        };

        self.stop_workers().await;
        self.start_workers(active_routes);
    }

    fn start_workers(&mut self, route_tags: Vec<String>) {
        info!(count = route_tags.len(), "starting workers");
        for route_tag in route_tags {
            let (tx, rx) = watch::channel(false);
            let worker = RouteWorker::new(
                route_tag.clone(),
                self.service_class.clone(),
                Duration::from_secs(self.settings.prediction_update_seconds),
                self.settings.duplicate_arrival_threshold,
                self.settings.single_scheduled_arrival_threshold,
                self.upstream.clone(),
                self.store.clone(),
            );
            let route_tag_for_log = route_tag.clone();
            let handle = tokio::spawn(async move {
                let result = worker.run(rx).await;
                if let Err(ref err) = result {
                    error!(route = %route_tag_for_log, error = %err, "worker terminated with an error");
                }
                result
            });
            self.workers.push(RunningWorker {
                route_tag,
                shutdown: tx,
                handle,
            });
        }
    }

    /// Signals every worker to stop and joins them. A worker panicking or
    /// erroring out never takes down the manager (spec ยง4.4 "Failure
    /// semantics"): it's just logged and dropped from the set until the
    /// next rotation respawns it.
    #[instrument(skip(self))]
    async fn stop_workers(&mut self) {
        info!(count = self.workers.len(), "stopping workers");
        for worker in &self.workers {
            let _ = worker.shutdown.send(true);
        }
        for worker in self.workers.drain(..) {
            if let Err(err) = worker.handle.await {
                error!(route = %worker.route_tag, error = %err, "worker task panicked");
            }
        }
    }
}

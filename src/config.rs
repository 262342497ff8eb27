// CLI argument definitions and the Settings they resolve to.
use clap::{Parser, Subcommand};

#[derive(Parser, Clone)]
pub struct SharedOptions {
    /// Agency identifier passed to the upstream provider as `a=`.
    #[arg(long = "agency", env = "AGENCY")]
    pub agency: String,
    /// Base URL of the upstream prediction/schedule provider.
    #[arg(long = "api-url", env = "API_URL", default_value = crate::upstream::DEFAULT_API_URL)]
    pub api_url: String,
    /// DuckDB file to connect to. Uses an in-memory database if not given.
    #[arg(short = 'd', long = "db-url", env = "DB_URL")]
    pub db_url: Option<String>,
    /// Seconds-since-midnight after which a calendar-date change triggers a
    /// service-day rotation. Keeps the supervisor from rotating while
    /// late-night service from the previous day is still running.
    #[arg(long = "day-switch-time", env = "DAY_SWITCH_TIME", default_value = "10800")]
    pub day_switch_time: u32,
    /// Seconds between prediction polls for a single route.
    #[arg(long = "prediction-update-seconds", env = "PREDICTION_UPDATE_SECONDS", default_value = "60")]
    pub prediction_update_seconds: u64,
    /// Window, in seconds, within which a repeated observation for the same
    /// (stop, scheduled_arrival) updates the existing row instead of
    /// inserting a new one.
    #[arg(long = "duplicate-arrival-threshold", env = "DUPLICATE_ARRIVAL_THRESHOLD", default_value = "600")]
    pub duplicate_arrival_threshold: i64,
    /// Maximum |observed - scheduled| seconds allowed when a stop/block has
    /// only one scheduled arrival for the whole day.
    #[arg(long = "single-scheduled-arrival-threshold", env = "SINGLE_SCHEDULED_ARRIVAL_THRESHOLD", default_value = "1800")]
    pub single_scheduled_arrival_threshold: i64,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the full route supervisor, or a single RouteWorker for diagnostics.
    Run {
        #[command(flatten)]
        shared_options: SharedOptions,
        /// Run only this route's worker instead of the full supervisor.
        #[arg(long = "route")]
        route: Option<String>,
        /// Host the read API on this port.
        #[arg(short = 'p', long = "port", env = "PORT", default_value = "4500")]
        port: u16,
        #[arg(long = "assets-path", default_value = "static")]
        assets_path: String,
    },
    /// Run ScheduleReconciler once and exit.
    UpdateSchedules {
        #[command(flatten)]
        shared_options: SharedOptions,
        #[arg(long = "route")]
        route: Option<String>,
    },
    /// Upsert the route list only, and exit.
    UpdateRoutes {
        #[command(flatten)]
        shared_options: SharedOptions,
    },
}

#[derive(Parser)]
#[command(name = "transit-arrivals")]
#[command(about = "Infer realtime transit arrivals and schedule deviation from a polled prediction feed")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Immutable settings resolved once at startup, shared by every component
/// that needs a config knob (spec calls these out as "read once at
/// startup").
#[derive(Clone)]
pub struct Settings {
    pub agency: String,
    pub api_url: String,
    pub db_url: Option<String>,
    pub day_switch_time: u32,
    pub prediction_update_seconds: u64,
    pub duplicate_arrival_threshold: i64,
    pub single_scheduled_arrival_threshold: i64,
}

impl From<SharedOptions> for Settings {
    fn from(opts: SharedOptions) -> Self {
        Self {
            agency: opts.agency,
            api_url: opts.api_url,
            db_url: opts.db_url,
            day_switch_time: opts.day_switch_time,
            prediction_update_seconds: opts.prediction_update_seconds,
            duplicate_arrival_threshold: opts.duplicate_arrival_threshold,
            single_scheduled_arrival_threshold: opts.single_scheduled_arrival_threshold,
        }
    }
}

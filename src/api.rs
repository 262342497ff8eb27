// Response DTOs for the read API.
use serde::Serialize;

#[derive(Serialize)]
pub struct RouteSummary {
    pub tag: String,
    pub title: String,
}

#[derive(Serialize)]
pub struct StopSummary {
    pub tag: String,
    pub title: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

#[derive(Serialize)]
pub struct DeviationBucket {
    pub bucket_seconds: i32,
    pub count: i64,
}

#[derive(Serialize)]
pub struct Healthy {
    pub healthy: bool,
    pub last_reconcile_unix: Option<i64>,
}

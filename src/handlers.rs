// HTTP request handlers for the read API.
use crate::api::{DeviationBucket, Healthy, RouteSummary, StopSummary};
use crate::server::infra::WebappError;
use crate::server::state::AppState;
use axum::Json;
use axum::extract::{Path, Query, State};
use serde::Deserialize;
use tracing::instrument;

pub async fn root() -> &'static str {
    "transit-arrivals"
}

pub async fn healthy(State(state): State<AppState>) -> Json<Healthy> {
    let last_reconcile_unix = *state.last_reconcile_unix.read().unwrap();
    Json(Healthy {
        healthy: last_reconcile_unix.is_some(),
        last_reconcile_unix,
    })
}

#[instrument(skip(state))]
pub async fn list_routes(
    State(state): State<AppState>,
) -> Result<Json<Vec<RouteSummary>>, WebappError> {
    let routes = state.store.list_routes()?;
    Ok(Json(
        routes
            .into_iter()
            .map(|r| RouteSummary {
                tag: r.tag,
                title: r.title,
            })
            .collect(),
    ))
}

#[instrument(skip(state))]
pub async fn list_stops(
    State(state): State<AppState>,
    Path(route_tag): Path<String>,
) -> Result<Json<Vec<StopSummary>>, WebappError> {
    let stops = state.store.list_stops(&route_tag)?;
    Ok(Json(
        stops
            .into_iter()
            .map(|s| StopSummary {
                tag: s.tag,
                title: s.title,
                latitude: s.lat,
                longitude: s.lon,
            })
            .collect(),
    ))
}

#[derive(Deserialize)]
pub struct HourQuery {
    pub hour: u32,
}

#[instrument(skip(state))]
pub async fn deviations(
    State(state): State<AppState>,
    Path((route_tag, stop_tag)): Path<(String, String)>,
    Query(query): Query<HourQuery>,
) -> Result<Json<Vec<DeviationBucket>>, WebappError> {
    let counts = state.store.deviation_counts(&route_tag, &stop_tag, query.hour)?;
    Ok(Json(
        counts
            .into_iter()
            .map(|(bucket_seconds, count)| DeviationBucket {
                bucket_seconds,
                count,
            })
            .collect(),
    ))
}

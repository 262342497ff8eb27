// Thin HTTP/JSON client for the upstream prediction/schedule provider.
mod payload;

use crate::error::UpstreamError;
use fxhash::FxHashMap;
use payload::{PredictionsResponse, RouteConfigResponse, RouteListResponse, ScheduleResponse};
use reqwest::Client;
use tracing::{instrument, warn};

pub const DEFAULT_API_URL: &str = "https://webservices.nextbus.com/service/publicJSONFeed";

#[derive(Debug, Clone)]
pub struct RouteListing {
    pub tag: String,
    pub title: String,
}

#[derive(Debug, Clone)]
pub struct ConfiguredStop {
    pub tag: String,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct ScheduleStop {
    pub tag: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct TripStop {
    pub tag: String,
    /// Milliseconds after service-day midnight, or -1 if the trip skips this stop.
    pub epoch_ms: i64,
}

#[derive(Debug, Clone)]
pub struct Trip {
    pub block_id: i64,
    pub stops: Vec<TripStop>,
}

#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    pub direction: String,
    pub service_class: String,
    pub schedule_class_name: String,
    pub stops: Vec<ScheduleStop>,
    pub trips: Vec<Trip>,
}

/// `stop_tag -> block_id -> trip_tag -> seconds_until_arrival`
pub type Predictions = FxHashMap<String, FxHashMap<i64, FxHashMap<String, i64>>>;

pub struct UpstreamClient {
    client: Client,
    api_url: String,
    agency: String,
}

impl UpstreamClient {
    pub fn new(client: Client, api_url: String, agency: String) -> Self {
        Self {
            client,
            api_url,
            agency,
        }
    }

    #[instrument(name = "list_routes", skip(self))]
    pub async fn list_routes(&self) -> Result<Vec<RouteListing>, UpstreamError> {
        let response: RouteListResponse = self
            .client
            .get(&self.api_url)
            .query(&[("command", "routeList"), ("a", self.agency.as_str())])
            .send()
            .await?
            .json()
            .await?;

        Ok(response
            .route
            .into_iter()
            .map(|r| RouteListing {
                tag: r.tag,
                title: r.title,
            })
            .collect())
    }

    #[instrument(name = "route_config", skip(self))]
    pub async fn route_config(&self, route_tag: &str) -> Result<Vec<ConfiguredStop>, UpstreamError> {
        let response: RouteConfigResponse = self
            .client
            .get(&self.api_url)
            .query(&[
                ("command", "routeConfig"),
                ("a", self.agency.as_str()),
                ("r", route_tag),
            ])
            .send()
            .await?
            .json()
            .await?;

        Ok(response
            .route
            .stop
            .into_iter()
            .map(|s| ConfiguredStop {
                tag: s.tag,
                lat: s.lat.and_then(|v| v.parse().ok()),
                lon: s.lon.and_then(|v| v.parse().ok()),
            })
            .collect())
    }

    #[instrument(name = "schedule", skip(self))]
    pub async fn schedule(&self, route_tag: &str) -> Result<Vec<ScheduleEntry>, UpstreamError> {
        let response: ScheduleResponse = self
            .client
            .get(&self.api_url)
            .query(&[
                ("command", "schedule"),
                ("a", self.agency.as_str()),
                ("r", route_tag),
            ])
            .send()
            .await?
            .json()
            .await?;

        let Some(schedules) = response.route else {
            return Err(UpstreamError::NoSchedule);
        };

        let mut entries = Vec::new();
        for raw in schedules {
            let stops = raw
                .header
                .stop
                .into_iter()
                .map(|s| ScheduleStop {
                    tag: s.tag,
                    name: s.content,
                })
                .collect();

            let mut trips = Vec::new();
            for raw_trip in raw.tr {
                let Ok(block_id) = raw_trip.block_id.parse::<i64>() else {
                    warn!(block_id = %raw_trip.block_id, "dropping trip with non-integer block id");
                    continue;
                };
                let trip_stops = raw_trip
                    .stop
                    .into_iter()
                    .filter_map(|s| {
                        let epoch_ms = match s.epoch_time.parse::<i64>() {
                            Ok(v) => v,
                            Err(_) => {
                                warn!(tag = %s.tag, "dropping trip stop with non-integer epochTime");
                                return None;
                            }
                        };
                        Some(TripStop { tag: s.tag, epoch_ms })
                    })
                    .collect();
                trips.push(Trip { block_id, stops: trip_stops });
            }

            entries.push(ScheduleEntry {
                direction: raw.direction,
                service_class: raw.service_class,
                schedule_class_name: raw.schedule_class,
                stops,
                trips,
            });
        }

        Ok(entries)
    }

    #[instrument(name = "predictions", skip(self, stop_tags))]
    pub async fn predictions(
        &self,
        route_tag: &str,
        stop_tags: &[String],
    ) -> Result<Predictions, UpstreamError> {
        let stop_params: Vec<String> = stop_tags
            .iter()
            .map(|tag| format!("{route_tag}|{tag}"))
            .collect();
        let mut query: Vec<(&str, &str)> = vec![
            ("command", "predictionsForMultiStops"),
            ("a", self.agency.as_str()),
        ];
        for stop_param in &stop_params {
            query.push(("stops", stop_param.as_str()));
        }

        let response: PredictionsResponse = self
            .client
            .get(&self.api_url)
            .query(&query)
            .send()
            .await?
            .json()
            .await?;

        let mut result: Predictions = FxHashMap::default();
        for stop in response.predictions {
            let mut by_block: FxHashMap<i64, FxHashMap<String, i64>> = FxHashMap::default();
            for direction in stop.direction {
                for prediction in direction.prediction {
                    let Ok(block_id) = prediction.block.parse::<i64>() else {
                        warn!(block = %prediction.block, "dropping prediction with non-integer block id");
                        continue;
                    };
                    let Ok(seconds) = prediction.seconds.parse::<i64>() else {
                        warn!(seconds = %prediction.seconds, "dropping prediction with non-integer seconds");
                        continue;
                    };
                    by_block
                        .entry(block_id)
                        .or_default()
                        .insert(prediction.trip_tag, seconds);
                }
            }
            result.insert(stop.stop_tag, by_block);
        }

        Ok(result)
    }
}

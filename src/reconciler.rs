// Fetches current route list and per-route schedules, diffs against Store,
// activates new schedule versions and deactivates superseded ones, and
// bulk-upserts stops, stop-schedule-class rows and scheduled arrivals
// (spec ยง4.3).
use crate::error::UpstreamError;
use crate::store::{ScheduledArrivalUpsert, Store, StopScheduleClassUpsert, StopUpsert};
use crate::upstream::{ScheduleEntry, UpstreamClient};
use anyhow::Result;
use fxhash::FxHashSet;
use std::sync::Arc;
use tracing::{info, instrument, warn};

pub const SECONDS_PER_DAY: i64 = 86_400;

pub struct ScheduleReconciler {
    upstream: Arc<UpstreamClient>,
    store: Arc<Store>,
}

impl ScheduleReconciler {
    pub fn new(upstream: Arc<UpstreamClient>, store: Arc<Store>) -> Self {
        Self { upstream, store }
    }

    #[instrument(skip(self))]
    pub async fn reconcile_all(&self) -> Result<()> {
        let routes = self.upstream.list_routes().await?;
        let rows = routes
            .iter()
            .map(|r| crate::store::RouteUpsert {
                tag: r.tag.clone(),
                title: r.title.clone(),
            })
            .collect::<Vec<_>>();
        self.store.bulk_upsert_routes(&rows)?;

        let mut set = tokio::task::JoinSet::new();
        for route in routes {
            let upstream = self.upstream.clone();
            let store = self.store.clone();
            set.spawn(async move {
                let reconciler = ScheduleReconciler { upstream, store };
                if let Err(err) = reconciler.reconcile_route(&route.tag).await {
                    warn!(route = %route.tag, error = %err, "skipping route for this reconciliation run");
                }
            });
        }
        while set.join_next().await.is_some() {}

        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn reconcile_route(&self, route_tag: &str) -> Result<()> {
        let schedules = match self.upstream.schedule(route_tag).await {
            Ok(schedules) => schedules,
            Err(UpstreamError::NoSchedule) => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        // For each (direction, service_class, schedule_class_name) triple, decide if it's
        // "to add": either no active ScheduleClass exists yet, or the fetched name differs
        // from the stored one (in which case the stored one is marked for deactivation).
        let mut to_add: Vec<&ScheduleEntry> = Vec::new();
        for entry in &schedules {
            let existing = self.store.find_active_schedule_class(
                route_tag,
                &entry.direction,
                &entry.service_class,
            )?;
            match existing {
                Some(existing) if existing.name == entry.schedule_class_name => {}
                _ => to_add.push(entry),
            }
        }

        if to_add.is_empty() {
            info!(route = %route_tag, "no new schedules were found");
            return Ok(());
        }

        // Supersede wholesale: every existing ScheduleClass for the route is deactivated
        // once any new one is found (matches the source's final behavior; spec ยง9 flags
        // this as possibly too destructive for partial upstream outages, but keeps it).
        self.store.deactivate_schedule_classes(route_tag)?;

        let mut stop_tags_seen: FxHashSet<String> = FxHashSet::default();
        let mut stops_to_upsert: Vec<crate::upstream::ScheduleStop> = Vec::new();
        for entry in &to_add {
            for stop in &entry.stops {
                if stop_tags_seen.insert(stop.tag.clone()) {
                    stops_to_upsert.push(stop.clone());
                }
            }
        }

        let coordinates = self.upstream.route_config(route_tag).await.unwrap_or_else(|err| {
            warn!(route = %route_tag, error = %err, "could not fetch route_config, stops will have null coordinates");
            Vec::new()
        });
        let coordinates: fxhash::FxHashMap<String, (Option<f64>, Option<f64>)> = coordinates
            .into_iter()
            .map(|c| (c.tag, (c.lat, c.lon)))
            .collect();

        let stop_rows: Vec<StopUpsert> = stops_to_upsert
            .iter()
            .map(|stop| {
                let (lat, lon) = coordinates.get(&stop.tag).copied().unwrap_or((None, None));
                if lat.is_none() || lon.is_none() {
                    warn!(route = %route_tag, stop = %stop.tag, "missing coordinates for stop, storing as null");
                }
                StopUpsert {
                    route_tag: route_tag.to_string(),
                    tag: stop.tag.clone(),
                    title: stop.name.clone(),
                    lat,
                    lon,
                }
            })
            .collect();
        self.store.bulk_upsert_stops(&stop_rows)?;

        // Reload this route's stops so scheduled-arrival construction doesn't hit the
        // database once per stop.
        let route_stops = self.store.stops_for_route(route_tag)?;
        let known_stop_tags: FxHashSet<&str> =
            route_stops.iter().map(|s| s.tag.as_str()).collect();

        let mut stop_schedule_class_rows: Vec<StopScheduleClassUpsert> = Vec::new();
        let mut stop_schedule_class_seen: FxHashSet<(String, i64)> = FxHashSet::default();
        let mut scheduled_arrival_rows: Vec<ScheduledArrivalUpsert> = Vec::new();
        let mut scheduled_arrival_seen: FxHashSet<(String, i64, i64, i32)> = FxHashSet::default();

        for entry in &to_add {
            let schedule_class = self.store.activate_schedule_class(
                route_tag,
                &entry.direction,
                &entry.service_class,
                &entry.schedule_class_name,
            )?;

            for trip in &entry.trips {
                for (order, trip_stop) in trip.stops.iter().enumerate() {
                    let order = (order + 1) as i32;

                    // Skip stops with an arrival time of -1: the trip doesn't serve that stop.
                    if trip_stop.epoch_ms == -1 {
                        continue;
                    }
                    if !known_stop_tags.contains(trip_stop.tag.as_str()) {
                        warn!(route = %route_tag, stop = %trip_stop.tag, "trip stop not among this route's stops, skipping");
                        continue;
                    }

                    let ssc_key = (trip_stop.tag.clone(), schedule_class.id);
                    if stop_schedule_class_seen.insert(ssc_key.clone()) {
                        stop_schedule_class_rows.push(StopScheduleClassUpsert {
                            route_tag: route_tag.to_string(),
                            stop_tag: trip_stop.tag.clone(),
                            schedule_class_id: schedule_class.id,
                            stop_order: order,
                        });
                    }

                    // The provider expresses post-midnight arrivals as offsets past 24h;
                    // fold them back into [0, 86400).
                    let mut seconds = trip_stop.epoch_ms / 1000;
                    if seconds >= SECONDS_PER_DAY {
                        seconds -= SECONDS_PER_DAY;
                    }
                    let time = seconds as i32;

                    let sa_key = (trip_stop.tag.clone(), schedule_class.id, trip.block_id, time);
                    if scheduled_arrival_seen.insert(sa_key) {
                        scheduled_arrival_rows.push(ScheduledArrivalUpsert {
                            route_tag: route_tag.to_string(),
                            stop_tag: trip_stop.tag.clone(),
                            schedule_class_id: schedule_class.id,
                            block_id: trip.block_id,
                            time,
                        });
                    }
                }
            }
        }

        self.store.bulk_upsert_stop_schedule_classes(&stop_schedule_class_rows)?;
        self.store.bulk_upsert_scheduled_arrivals(&scheduled_arrival_rows)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{RouteUpsert, StopUpsert};

    fn store_with_route_and_stop() -> Store {
        let store = Store::open(&None).unwrap();
        store
            .bulk_upsert_routes(&[RouteUpsert {
                tag: "38".to_string(),
                title: "38-Geary".to_string(),
            }])
            .unwrap();
        store
            .bulk_upsert_stops(&[StopUpsert {
                route_tag: "38".to_string(),
                tag: "5684".to_string(),
                title: "Geary & 33rd Ave".to_string(),
                lat: None,
                lon: None,
            }])
            .unwrap();
        store
    }

    #[test]
    fn stop_schedule_class_without_any_scheduled_arrival_rows_stays_empty() {
        // A trip stop with epoch_ms == -1 contributes a StopScheduleClass
        // row (the stop is still on the route) but no ScheduledArrival row.
        let store = store_with_route_and_stop();
        let schedule_class = store
            .activate_schedule_class("38", "Outbound", "wkd", "v1")
            .unwrap();
        store
            .bulk_upsert_stop_schedule_classes(&[StopScheduleClassUpsert {
                route_tag: "38".to_string(),
                stop_tag: "5684".to_string(),
                schedule_class_id: schedule_class.id,
                stop_order: 1,
            }])
            .unwrap();

        let index = store.load_scheduled_arrivals("38", "wkd").unwrap();
        assert!(index.get("5684").is_none());
    }

    #[test]
    fn post_midnight_overflow_folds_back_into_the_day() {
        let epoch_ms: i64 = 24 * 3600 * 1000 + 1800 * 1000; // 24:30:00
        let mut seconds = epoch_ms / 1000;
        if seconds >= SECONDS_PER_DAY {
            seconds -= SECONDS_PER_DAY;
        }
        assert_eq!(seconds, 1800);
    }
}

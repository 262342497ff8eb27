// Per-route arrival detector: polls predictions for a route's stops, infers
// vehicle arrivals by differencing consecutive snapshots, matches each
// arrival to its closest scheduled arrival, and persists the observation
// (spec ยง4.5).
use crate::store::{ScheduledArrival, Store};
use crate::upstream::{Predictions, UpstreamClient};
use fxhash::FxHashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tracing::{debug, instrument, warn};

/// Maximum predicted seconds-until-arrival at which a block that vanished
/// from predictions is still credited as having arrived (design constant,
/// spec ยง4.5.1/ยง9 — calibration knob, not configuration).
const ARRIVAL_THRESHOLD: i64 = 500;

/// `stop_tag -> [block_id, ...]`, may contain duplicate block ids (one per
/// dropped trip tag); downstream dedup happens at the Arrival row level.
pub type InferredArrivals = FxHashMap<String, Vec<i64>>;

/// Seconds-since-service-day-midnight of an observation, used both for
/// matching and for `delta` (inter-snapshot gap) arithmetic.
pub type Seconds = i64;

#[instrument(skip(previous, current))]
pub fn infer_arrivals(
    previous: &Predictions,
    previous_t: Seconds,
    current: &Predictions,
    current_t: Seconds,
) -> InferredArrivals {
    let delta = current_t - previous_t;
    let mut arrivals: InferredArrivals = FxHashMap::default();

    for (stop_tag, blocks) in previous {
        let Some(current_blocks) = current.get(stop_tag) else {
            warn!(stop = %stop_tag, "stop missing from current snapshot, skipping");
            continue;
        };

        let mut stop_arrivals = Vec::new();
        for (block_id, trips) in blocks {
            match current_blocks.get(block_id) {
                None => {
                    let earliest = trips.values().copied().min().unwrap_or(i64::MAX);
                    if earliest < ARRIVAL_THRESHOLD || earliest < delta {
                        stop_arrivals.push(*block_id);
                    }
                }
                Some(current_trips) => {
                    for (trip_tag, seconds) in trips {
                        if !current_trips.contains_key(trip_tag)
                            && (*seconds < ARRIVAL_THRESHOLD || delta > *seconds)
                        {
                            stop_arrivals.push(*block_id);
                        }
                    }
                }
            }
        }

        if !stop_arrivals.is_empty() {
            arrivals.insert(stop_tag.clone(), stop_arrivals);
        }
    }

    debug!(?arrivals, "inferred arrivals");
    arrivals
}

/// Wrap-aware distance between two seconds-of-day values, both in `[0, 86400)`.
fn wrap_distance(a: Seconds, s: Seconds) -> Seconds {
    (a - s)
        .abs()
        .min((a - s - crate::reconciler::SECONDS_PER_DAY).abs())
        .min((a - (s - crate::reconciler::SECONDS_PER_DAY)).abs())
}

/// Matches an observed arrival to its closest scheduled arrival (spec ยง4.5.2).
pub fn match_scheduled_arrival<'a>(
    observed: Seconds,
    candidates: &'a [ScheduledArrival],
    single_scheduled_arrival_threshold: i64,
) -> Option<&'a ScheduledArrival> {
    if candidates.is_empty() {
        return None;
    }

    if candidates.len() == 1 {
        let only = &candidates[0];
        return if (observed - only.time as i64).abs() <= single_scheduled_arrival_threshold {
            Some(only)
        } else {
            None
        };
    }

    candidates
        .iter()
        .min_by_key(|c| wrap_distance(observed, c.time as i64))
}

pub fn seconds_since_midnight(now: SystemTime) -> Seconds {
    let unix = now.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64;
    unix.rem_euclid(crate::reconciler::SECONDS_PER_DAY)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(stop: &str, block: i64, trips: &[(&str, i64)]) -> Predictions {
        let mut by_trip = FxHashMap::default();
        for (tag, seconds) in trips {
            by_trip.insert(tag.to_string(), *seconds);
        }
        let mut by_block = FxHashMap::default();
        by_block.insert(block, by_trip);
        let mut snapshot = FxHashMap::default();
        snapshot.insert(stop.to_string(), by_block);
        snapshot
    }

    fn arrival(stop: &str, block: i64) -> ScheduledArrival {
        ScheduledArrival {
            id: 1,
            stop_tag: stop.to_string(),
            block_id: block,
            time: 0,
        }
    }

    #[test]
    fn block_disappears_with_close_prediction_counts_as_arrival() {
        let previous = snapshot("1234", 5678, &[("123", 1)]);
        let mut current = Predictions::default();
        current.insert("1234".to_string(), FxHashMap::default());

        let arrivals = infer_arrivals(&previous, 12300, &current, 12345);
        assert_eq!(arrivals.get("1234"), Some(&vec![5678]));
    }

    #[test]
    fn block_disappears_far_away_does_not_count() {
        let previous = snapshot("1234", 5678, &[("123", 9999)]);
        let mut current = Predictions::default();
        current.insert("1234".to_string(), FxHashMap::default());

        let arrivals = infer_arrivals(&previous, 12344, &current, 12345);
        assert!(arrivals.get("1234").is_none_or(|v| v.is_empty()));
    }

    #[test]
    fn dropped_trip_within_delta_counts_block_as_arrived() {
        let previous = snapshot("1234", 5678, &[("123", 1000)]);
        let mut current = Predictions::default();
        let mut by_block = FxHashMap::default();
        by_block.insert(5678, FxHashMap::default());
        current.insert("1234".to_string(), by_block);

        let arrivals = infer_arrivals(&previous, 10000, &current, 12345);
        assert_eq!(arrivals.get("1234"), Some(&vec![5678]));
    }

    #[test]
    fn stop_missing_from_current_snapshot_is_skipped() {
        let previous = snapshot("1234", 5678, &[("123", 1)]);
        let current = Predictions::default();

        let arrivals = infer_arrivals(&previous, 12300, &current, 12345);
        assert!(arrivals.is_empty());
    }

    #[test]
    fn exact_match_scheduled_time_wins() {
        let candidates = vec![arrival("1234", 1), arrival("1234", 1), arrival("1234", 1)];
        let mut candidates = candidates;
        candidates[0].time = 9;
        candidates[1].time = 11;
        candidates[2].time = 10;

        let matched = match_scheduled_arrival(10, &candidates, 1800).unwrap();
        assert_eq!(matched.time, 10);
    }

    #[test]
    fn midnight_wrap_prefers_nearby_wrapped_candidate() {
        let mut candidates = vec![arrival("1234", 1), arrival("1234", 1), arrival("1234", 1)];
        candidates[0].time = 60;
        candidates[1].time = 86279;
        candidates[2].time = 15;

        let matched = match_scheduled_arrival(86399, &candidates, 1800).unwrap();
        assert_eq!(matched.time, 15);
    }

    #[test]
    fn single_candidate_guard_rejects_distant_match() {
        let mut far = arrival("1234", 1);
        far.time = 101;
        assert!(match_scheduled_arrival(0, std::slice::from_ref(&far), 100).is_none());

        let mut near = arrival("1234", 1);
        near.time = 99;
        assert!(match_scheduled_arrival(0, std::slice::from_ref(&near), 100).is_some());
    }

    #[test]
    fn wrap_distance_is_bounded_by_half_a_day() {
        for a in [0, 15, 43200, 86399] {
            for s in [0, 100, 43200, 86399] {
                assert!(wrap_distance(a, s) <= 43200);
            }
        }
    }

    #[test]
    fn wrap_distance_matches_known_example() {
        assert_eq!(wrap_distance(86399, 15), 16);
    }
}

pub struct RouteWorker {
    pub route_tag: String,
    service_class: String,
    update_interval: std::time::Duration,
    duplicate_arrival_threshold: i64,
    single_scheduled_arrival_threshold: i64,
    upstream: Arc<UpstreamClient>,
    store: Arc<Store>,
}

impl RouteWorker {
    pub fn new(
        route_tag: String,
        service_class: String,
        update_interval: std::time::Duration,
        duplicate_arrival_threshold: i64,
        single_scheduled_arrival_threshold: i64,
        upstream: Arc<UpstreamClient>,
        store: Arc<Store>,
    ) -> Self {
        Self {
            route_tag,
            service_class,
            update_interval,
            duplicate_arrival_threshold,
            single_scheduled_arrival_threshold,
            upstream,
            store,
        }
    }

    /// Runs until `shutdown` is signalled. A fetch failure is logged and
    /// retried next tick; it never terminates the worker (spec ยง4.5.4,
    /// ยง7 "transient upstream... RouteWorker swallows and retries").
    #[instrument(skip(self, shutdown), fields(route = %self.route_tag))]
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let scheduled_arrivals = self
            .store
            .load_scheduled_arrivals(&self.route_tag, &self.service_class)?;
        let stops = self
            .store
            .load_stops_for_worker(&self.route_tag, &self.service_class)?;
        let stop_tags: Vec<String> = stops.into_iter().map(|s| s.tag).collect();

        let mut current_snapshot: Predictions = FxHashMap::default();
        let mut current_t: Seconds = 0;
        let mut have_snapshot = false;
        let mut interval = tokio::time::interval(self.update_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let previous_snapshot = current_snapshot;
                    let previous_t = current_t;

                    current_snapshot = match self.upstream.predictions(&self.route_tag, &stop_tags).await {
                        Ok(snapshot) => snapshot,
                        Err(err) => {
                            warn!(route = %self.route_tag, error = %err, "prediction fetch failed, retrying next tick");
                            current_snapshot = previous_snapshot;
                            current_t = previous_t;
                            continue;
                        }
                    };
                    current_t = seconds_since_midnight(SystemTime::now());

                    if !have_snapshot {
                        // First iteration: nothing to diff against yet.
                        have_snapshot = true;
                        continue;
                    }

                    let gap = current_t - previous_t;
                    if gap > 3 * self.update_interval.as_secs() as i64 {
                        warn!(route = %self.route_tag, gap, "stale snapshot gap, discarding inferred batch");
                        continue;
                    }

                    let arrivals = infer_arrivals(&previous_snapshot, previous_t, &current_snapshot, current_t);
                    for (stop_tag, block_ids) in arrivals {
                        let Some(by_block) = scheduled_arrivals.get(&stop_tag) else {
                            warn!(route = %self.route_tag, stop = %stop_tag, "no scheduled-arrival index for stop");
                            continue;
                        };
                        for block_id in block_ids {
                            let Some(candidates) = by_block.get(&block_id) else {
                                warn!(route = %self.route_tag, stop = %stop_tag, block_id, "block id absent from scheduled-arrivals index");
                                continue;
                            };
                            let Some(matched) = match_scheduled_arrival(current_t, candidates, self.single_scheduled_arrival_threshold) else {
                                debug!(route = %self.route_tag, stop = %stop_tag, block_id, "no scheduled arrival matched, discarding");
                                continue;
                            };
                            let difference = (current_t - matched.time as i64) as i32;
                            let observed_unix = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64;
                            if let Err(err) = self.store.record_arrival(
                                &stop_tag,
                                &self.route_tag,
                                matched.id,
                                observed_unix,
                                difference,
                                self.duplicate_arrival_threshold,
                            ) {
                                warn!(route = %self.route_tag, stop = %stop_tag, error = %err, "failed to persist arrival");
                            }
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!(route = %self.route_tag, "worker stopping");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

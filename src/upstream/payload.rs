// Raw shapes of the upstream provider's JSON payloads. Any field the
// provider may emit as a single object or as an array is deserialized
// through `OneOrMany`, so the rest of the crate never sees the
// polymorphism (spec ยง9, "Polymorphic JSON fields").
use serde::{Deserialize, Deserializer};

#[derive(Debug, Clone)]
pub struct OneOrMany<T>(pub Vec<T>);

impl<'de, T> Deserialize<'de> for OneOrMany<T>
where
    T: Deserialize<'de>,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr<T> {
            One(T),
            Many(Vec<T>),
        }
        Ok(match Repr::<T>::deserialize(deserializer)? {
            Repr::One(item) => OneOrMany(vec![item]),
            Repr::Many(items) => OneOrMany(items),
        })
    }
}

impl<T> Default for OneOrMany<T> {
    fn default() -> Self {
        OneOrMany(Vec::new())
    }
}

impl<T> IntoIterator for OneOrMany<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;
    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[derive(Deserialize, Debug)]
pub struct RawRoute {
    pub tag: String,
    pub title: String,
}

#[derive(Deserialize, Debug)]
pub struct RouteListResponse {
    #[serde(default)]
    pub route: OneOrMany<RawRoute>,
}

#[derive(Deserialize, Debug)]
pub struct RawConfigStop {
    pub tag: String,
    pub lat: Option<String>,
    pub lon: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct RawRouteConfigBody {
    #[serde(default)]
    pub stop: OneOrMany<RawConfigStop>,
}

#[derive(Deserialize, Debug)]
pub struct RouteConfigResponse {
    pub route: RawRouteConfigBody,
}

#[derive(Deserialize, Debug)]
pub struct RawScheduleStop {
    pub tag: String,
    pub content: String,
}

#[derive(Deserialize, Debug)]
pub struct RawScheduleHeader {
    #[serde(default)]
    pub stop: OneOrMany<RawScheduleStop>,
}

#[derive(Deserialize, Debug)]
pub struct RawTripStop {
    pub tag: String,
    #[serde(rename = "epochTime")]
    pub epoch_time: String,
    pub content: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct RawTrip {
    #[serde(rename = "blockID")]
    pub block_id: String,
    #[serde(default)]
    pub stop: OneOrMany<RawTripStop>,
}

#[derive(Deserialize, Debug)]
pub struct RawSchedule {
    pub tag: String,
    pub title: String,
    pub direction: String,
    #[serde(rename = "serviceClass")]
    pub service_class: String,
    #[serde(rename = "scheduleClass")]
    pub schedule_class: String,
    pub header: RawScheduleHeader,
    #[serde(default)]
    pub tr: OneOrMany<RawTrip>,
}

#[derive(Deserialize, Debug, Default)]
pub struct ScheduleResponse {
    pub route: Option<OneOrMany<RawSchedule>>,
}

#[derive(Deserialize, Debug)]
pub struct RawPrediction {
    pub block: String,
    #[serde(rename = "tripTag")]
    pub trip_tag: String,
    pub seconds: String,
}

#[derive(Deserialize, Debug)]
pub struct RawDirection {
    #[serde(default)]
    pub prediction: OneOrMany<RawPrediction>,
}

#[derive(Deserialize, Debug)]
pub struct RawStopPredictions {
    #[serde(rename = "stopTag")]
    pub stop_tag: String,
    #[serde(default)]
    pub direction: OneOrMany<RawDirection>,
}

#[derive(Deserialize, Debug, Default)]
pub struct PredictionsResponse {
    #[serde(default)]
    pub predictions: OneOrMany<RawStopPredictions>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_or_many_accepts_a_single_object() {
        let parsed: RouteListResponse =
            serde_json::from_str(r#"{"route": {"tag": "38", "title": "38-Geary"}}"#).unwrap();
        assert_eq!(parsed.route.0.len(), 1);
        assert_eq!(parsed.route.0[0].tag, "38");
    }

    #[test]
    fn one_or_many_accepts_an_array() {
        let parsed: RouteListResponse = serde_json::from_str(
            r#"{"route": [{"tag": "38", "title": "38-Geary"}, {"tag": "1", "title": "1-California"}]}"#,
        )
        .unwrap();
        assert_eq!(parsed.route.0.len(), 2);
    }

    #[test]
    fn one_or_many_defaults_to_empty_when_field_absent() {
        let parsed: RouteListResponse = serde_json::from_str("{}").unwrap();
        assert!(parsed.route.0.is_empty());
    }

    #[test]
    fn schedule_response_with_no_route_field_means_no_schedule() {
        let parsed: ScheduleResponse = serde_json::from_str("{}").unwrap();
        assert!(parsed.route.is_none());
    }

    #[test]
    fn predictions_response_nests_one_or_many_through_two_levels() {
        let parsed: PredictionsResponse = serde_json::from_str(
            r#"{"predictions": {"stopTag": "5684", "direction": {"prediction": [
                {"block": "9001", "tripTag": "t1", "seconds": "120"},
                {"block": "9002", "tripTag": "t2", "seconds": "5"}
            ]}}}"#,
        )
        .unwrap();
        let stops = parsed.predictions.0;
        assert_eq!(stops.len(), 1);
        let directions = &stops[0].direction.0;
        assert_eq!(directions.len(), 1);
        assert_eq!(directions[0].prediction.0.len(), 2);
    }
}

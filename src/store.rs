// Persistent storage of routes, stops, schedule classes, stop<->schedule
// class associations, scheduled arrivals and observed arrivals. All bulk
// writes are expressed at natural keys with `ON CONFLICT` so that retrying
// after a crash is safe (spec ยง4.2, ยง9 "Idempotent upserts").
use anyhow::{Context, Result};
use duckdb::Connection;
use fxhash::FxHashMap;
use std::sync::Mutex;
use tracing::instrument;

pub struct Store {
    conn: Mutex<Connection>,
}

#[derive(Debug, Clone)]
pub struct RouteUpsert {
    pub tag: String,
    pub title: String,
}

#[derive(Debug, Clone)]
pub struct StopUpsert {
    pub route_tag: String,
    pub tag: String,
    pub title: String,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct ScheduleClass {
    pub id: i64,
    pub route_tag: String,
    pub direction: String,
    pub service_class: String,
    pub name: String,
    pub is_active: bool,
}

#[derive(Debug, Clone)]
pub struct StopScheduleClassUpsert {
    pub route_tag: String,
    pub stop_tag: String,
    pub schedule_class_id: i64,
    pub stop_order: i32,
}

#[derive(Debug, Clone)]
pub struct ScheduledArrivalUpsert {
    pub route_tag: String,
    pub stop_tag: String,
    pub schedule_class_id: i64,
    pub block_id: i64,
    pub time: i32,
}

#[derive(Debug, Clone)]
pub struct ScheduledArrival {
    pub id: i64,
    pub stop_tag: String,
    pub block_id: i64,
    pub time: i32,
}

#[derive(Debug, Clone)]
pub struct Stop {
    pub tag: String,
    pub title: String,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
}

impl Store {
    pub fn open(db_url: &Option<String>) -> Result<Self> {
        let conn = match db_url {
            None => Connection::open_in_memory(),
            Some(path) => Connection::open(path),
        }
        .context("opening duckdb connection")?;

        let schema: &str = include_str!("schema.sql");
        conn.execute_batch(schema).context("applying schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn route_id(conn: &Connection, tag: &str) -> Result<i64> {
        conn.query_row("select id from route where tag = $1", [tag], |row| {
            row.get(0)
        })
        .with_context(|| format!("no route with tag {tag}"))
    }

    fn stop_id(conn: &Connection, route_id: i64, tag: &str) -> Result<i64> {
        conn.query_row(
            "select id from stop where route_id = $1 and tag = $2",
            duckdb::params![route_id, tag],
            |row| row.get(0),
        )
        .with_context(|| format!("no stop with tag {tag} on route {route_id}"))
    }

    #[instrument(skip(self, rows))]
    pub fn bulk_upsert_routes(&self, rows: &[RouteUpsert]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "insert into route (tag, title) values ($1, $2)
                 on conflict (tag) do update set title = excluded.title",
            )?;
            for row in rows {
                stmt.execute(duckdb::params![row.tag, row.title])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    #[instrument(skip(self, rows))]
    pub fn bulk_upsert_stops(&self, rows: &[StopUpsert]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "insert into stop (route_id, tag, title, latitude, longitude)
                 values ($1, $2, $3, $4, $5)
                 on conflict (route_id, tag) do update set
                   title = excluded.title, latitude = excluded.latitude, longitude = excluded.longitude",
            )?;
            for row in rows {
                let route_id = Self::route_id(&tx, &row.route_tag)?;
                stmt.execute(duckdb::params![
                    route_id, row.tag, row.title, row.lat, row.lon
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn find_active_schedule_class(
        &self,
        route_tag: &str,
        direction: &str,
        service_class: &str,
    ) -> Result<Option<ScheduleClass>> {
        let conn = self.conn.lock().unwrap();
        let route_id = Self::route_id(&conn, route_tag)?;
        let found: Option<(i64, String)> = conn
            .query_row(
                "select id, name from schedule_class
                 where route_id = $1 and direction = $2 and service_class = $3 and is_active = true",
                duckdb::params![route_id, direction, service_class],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .ok();
        Ok(found.map(|(id, name)| ScheduleClass {
            id,
            route_tag: route_tag.to_string(),
            direction: direction.to_string(),
            service_class: service_class.to_string(),
            name,
            is_active: true,
        }))
    }

    #[instrument(skip(self))]
    pub fn activate_schedule_class(
        &self,
        route_tag: &str,
        direction: &str,
        service_class: &str,
        name: &str,
    ) -> Result<ScheduleClass> {
        let conn = self.conn.lock().unwrap();
        let route_id = Self::route_id(&conn, route_tag)?;

        let existing: Option<(i64, String, bool)> = conn
            .query_row(
                "select id, name, is_active from schedule_class
                 where route_id = $1 and direction = $2 and service_class = $3 and is_active = true",
                duckdb::params![route_id, direction, service_class],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .ok();

        if let Some((id, existing_name, is_active)) = existing {
            if existing_name == name {
                return Ok(ScheduleClass {
                    id,
                    route_tag: route_tag.to_string(),
                    direction: direction.to_string(),
                    service_class: service_class.to_string(),
                    name: existing_name,
                    is_active,
                });
            }
        }

        // The unique key is (route_id, direction, service_class), regardless of
        // is_active, so a deactivated row for this triple already occupies it -
        // reactivate and rename it rather than inserting a sibling.
        let id: i64 = conn.query_row(
            "insert into schedule_class (route_id, direction, service_class, name, is_active)
             values ($1, $2, $3, $4, true)
             on conflict (route_id, direction, service_class)
             do update set name = excluded.name, is_active = true
             returning id",
            duckdb::params![route_id, direction, service_class, name],
            |row| row.get(0),
        )?;

        Ok(ScheduleClass {
            id,
            route_tag: route_tag.to_string(),
            direction: direction.to_string(),
            service_class: service_class.to_string(),
            name: name.to_string(),
            is_active: true,
        })
    }

    #[instrument(skip(self))]
    pub fn deactivate_schedule_classes(&self, route_tag: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let route_id = Self::route_id(&conn, route_tag)?;
        conn.execute(
            "update schedule_class set is_active = false where route_id = $1",
            [route_id],
        )?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn deactivate_one(&self, schedule_class_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "update schedule_class set is_active = false where id = $1",
            [schedule_class_id],
        )?;
        Ok(())
    }

    #[instrument(skip(self, rows))]
    pub fn bulk_upsert_stop_schedule_classes(&self, rows: &[StopScheduleClassUpsert]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "insert into stop_schedule_class (stop_id, schedule_class_id, stop_order)
                 values ($1, $2, $3)
                 on conflict (stop_id, schedule_class_id, stop_order) do nothing",
            )?;
            for row in rows {
                let route_id = Self::route_id(&tx, &row.route_tag)?;
                let stop_id = Self::stop_id(&tx, route_id, &row.stop_tag)?;
                stmt.execute(duckdb::params![stop_id, row.schedule_class_id, row.stop_order])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    #[instrument(skip(self, rows))]
    pub fn bulk_upsert_scheduled_arrivals(&self, rows: &[ScheduledArrivalUpsert]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "insert into scheduled_arrival (stop_schedule_class_id, block_id, time)
                 values ($1, $2, $3)
                 on conflict (stop_schedule_class_id, block_id, time) do nothing",
            )?;
            for row in rows {
                let route_id = Self::route_id(&tx, &row.route_tag)?;
                let stop_id = Self::stop_id(&tx, route_id, &row.stop_tag)?;
                let ssc_id: i64 = tx.query_row(
                    "select id from stop_schedule_class where stop_id = $1 and schedule_class_id = $2",
                    duckdb::params![stop_id, row.schedule_class_id],
                    |r| r.get(0),
                )?;
                stmt.execute(duckdb::params![ssc_id, row.block_id, row.time])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn load_active_route_tags(&self, service_class: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "select distinct r.tag from route r
             join schedule_class sc on sc.route_id = r.id
             where sc.is_active = true and sc.service_class = $1",
        )?;
        let rows = stmt
            .query_map([service_class], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// All stops ever seen for this route, regardless of schedule class.
    #[instrument(skip(self))]
    pub fn stops_for_route(&self, route_tag: &str) -> Result<Vec<Stop>> {
        let conn = self.conn.lock().unwrap();
        let route_id = Self::route_id(&conn, route_tag)?;
        let mut stmt =
            conn.prepare("select tag, title, latitude, longitude from stop where route_id = $1")?;
        let rows = stmt
            .query_map([route_id], |row| {
                Ok(Stop {
                    tag: row.get(0)?,
                    title: row.get(1)?,
                    lat: row.get(2)?,
                    lon: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    #[instrument(skip(self))]
    pub fn load_stops_for_worker(&self, route_tag: &str, service_class: &str) -> Result<Vec<Stop>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "select distinct s.tag, s.title, s.latitude, s.longitude
             from stop s
             join route r on r.id = s.route_id
             join stop_schedule_class ssc on ssc.stop_id = s.id
             join schedule_class sc on sc.id = ssc.schedule_class_id
             where r.tag = $1 and sc.service_class = $2 and sc.is_active = true",
        )?;
        let rows = stmt
            .query_map(duckdb::params![route_tag, service_class], |row| {
                Ok(Stop {
                    tag: row.get(0)?,
                    title: row.get(1)?,
                    lat: row.get(2)?,
                    lon: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// `stop_tag -> block_id -> [ScheduledArrival]`
    #[instrument(skip(self))]
    pub fn load_scheduled_arrivals(
        &self,
        route_tag: &str,
        service_class: &str,
    ) -> Result<FxHashMap<String, FxHashMap<i64, Vec<ScheduledArrival>>>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "select s.tag, sa.id, sa.block_id, sa.time
             from scheduled_arrival sa
             join stop_schedule_class ssc on ssc.id = sa.stop_schedule_class_id
             join stop s on s.id = ssc.stop_id
             join schedule_class sc on sc.id = ssc.schedule_class_id
             join route r on r.id = sc.route_id
             where r.tag = $1 and sc.service_class = $2 and sc.is_active = true",
        )?;
        let rows = stmt.query_map(duckdb::params![route_tag, service_class], |row| {
            Ok((
                row.get::<_, String>(0)?,
                ScheduledArrival {
                    id: row.get(1)?,
                    stop_tag: row.get::<_, String>(0)?,
                    block_id: row.get(2)?,
                    time: row.get(3)?,
                },
            ))
        })?;

        let mut index: FxHashMap<String, FxHashMap<i64, Vec<ScheduledArrival>>> = FxHashMap::default();
        for row in rows {
            let (stop_tag, arrival) = row?;
            index
                .entry(stop_tag)
                .or_default()
                .entry(arrival.block_id)
                .or_default()
                .push(arrival);
        }
        Ok(index)
    }

    /// Lists every known route, for the read API's route listing endpoint.
    #[instrument(skip(self))]
    pub fn list_routes(&self) -> Result<Vec<RouteUpsert>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("select tag, title from route order by tag")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(RouteUpsert {
                    tag: row.get(0)?,
                    title: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Lists every stop ever seen for a route, for the read API.
    #[instrument(skip(self))]
    pub fn list_stops(&self, route_tag: &str) -> Result<Vec<Stop>> {
        self.stops_for_route(route_tag)
    }

    /// Counts of observed arrivals for `(route, stop)` whose scheduled time
    /// falls in the given hour-of-day, bucketed by deviation seconds
    /// (rounded to the nearest minute). This is the single query named in
    /// spec ยง1 as the system's external consumer: "how late is this route,
    /// typically, at this stop, at this hour".
    #[instrument(skip(self))]
    pub fn deviation_counts(
        &self,
        route_tag: &str,
        stop_tag: &str,
        hour: u32,
    ) -> Result<Vec<(i32, i64)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "select cast(floor(a.difference / 60.0) * 60 as integer) as bucket, count(*)
             from arrival a
             join stop s on s.id = a.stop_id
             join route r on r.id = s.route_id
             join scheduled_arrival sa on sa.id = a.scheduled_arrival_id
             where r.tag = $1 and s.tag = $2 and floor(sa.time / 3600) = $3
             group by bucket
             order by bucket",
        )?;
        let rows = stmt
            .query_map(duckdb::params![route_tag, stop_tag, hour], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Records an observed arrival, applying the `(stop, scheduled_arrival)`
    /// dedup window: a recent enough existing row has its `time`/
    /// `difference` updated in place rather than gaining a sibling row
    /// (spec ยง4.2, ยง4.5.3, ยง9 "dedup is a window in time").
    #[instrument(skip(self))]
    pub fn record_arrival(
        &self,
        stop_tag: &str,
        route_tag: &str,
        scheduled_arrival_id: i64,
        observed_unix_time: i64,
        difference: i32,
        dup_threshold: i64,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let route_id = Self::route_id(&conn, route_tag)?;
        let stop_id = Self::stop_id(&conn, route_id, stop_tag)?;

        let existing: Option<(i64, i64)> = conn
            .query_row(
                "select id, time from arrival
                 where stop_id = $1 and scheduled_arrival_id = $2
                 order by time desc limit 1",
                duckdb::params![stop_id, scheduled_arrival_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .ok();

        if let Some((id, existing_time)) = existing {
            if existing_time >= observed_unix_time - dup_threshold {
                conn.execute(
                    "update arrival set time = $1, difference = $2 where id = $3",
                    duckdb::params![observed_unix_time, difference, id],
                )?;
                return Ok(());
            }
        }

        conn.execute(
            "insert into arrival (stop_id, scheduled_arrival_id, time, difference)
             values ($1, $2, $3, $4)
             on conflict (stop_id, scheduled_arrival_id, time) do update set difference = excluded.difference",
            duckdb::params![stop_id, scheduled_arrival_id, observed_unix_time, difference],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> Store {
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
                lat: Some(37.78),
                lon: Some(-122.48),
            }])
            .unwrap();
        store
    }

    #[test]
    fn bulk_upsert_routes_is_idempotent() {
        let store = seeded();
        let rows = [RouteUpsert {
            tag: "38".to_string(),
            title: "38-Geary".to_string(),
        }];
        store.bulk_upsert_routes(&rows).unwrap();
        store.bulk_upsert_routes(&rows).unwrap();

        let routes = store.list_routes().unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].title, "38-Geary");
    }

    #[test]
    fn activate_schedule_class_is_idempotent_for_same_name() {
        let store = seeded();
        let first = store
            .activate_schedule_class("38", "Outbound", "wkd", "v1")
            .unwrap();
        let second = store
            .activate_schedule_class("38", "Outbound", "wkd", "v1")
            .unwrap();
        assert_eq!(first.id, second.id);
    }

    #[test]
    fn activate_schedule_class_with_new_name_creates_new_row() {
        let store = seeded();
        let first = store
            .activate_schedule_class("38", "Outbound", "wkd", "v1")
            .unwrap();
        let second = store
            .activate_schedule_class("38", "Outbound", "wkd", "v2")
            .unwrap();
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn at_most_one_active_schedule_class_per_triple() {
        let store = seeded();
        store
            .activate_schedule_class("38", "Outbound", "wkd", "v1")
            .unwrap();
        store.deactivate_schedule_classes("38").unwrap();
        store
            .activate_schedule_class("38", "Outbound", "wkd", "v2")
            .unwrap();

        let active = store
            .find_active_schedule_class("38", "Outbound", "wkd")
            .unwrap();
        assert_eq!(active.unwrap().name, "v2");
    }

    fn seed_scheduled_arrival(store: &Store) -> i64 {
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
        store
            .bulk_upsert_scheduled_arrivals(&[ScheduledArrivalUpsert {
                route_tag: "38".to_string(),
                stop_tag: "5684".to_string(),
                schedule_class_id: schedule_class.id,
                block_id: 9001,
                time: 100,
            }])
            .unwrap();
        let index = store.load_scheduled_arrivals("38", "wkd").unwrap();
        index["5684"][&9001][0].id
    }

    #[test]
    fn record_arrival_within_dup_window_updates_in_place() {
        let store = seeded();
        let scheduled_arrival_id = seed_scheduled_arrival(&store);

        store
            .record_arrival("5684", "38", scheduled_arrival_id, 1_000, 5, 600)
            .unwrap();
        store
            .record_arrival("5684", "38", scheduled_arrival_id, 1_200, 7, 600)
            .unwrap();

        let counts = store.deviation_counts("38", "5684", 0).unwrap();
        let total: i64 = counts.iter().map(|(_, c)| c).sum();
        assert_eq!(total, 1);
    }

    #[test]
    fn record_arrival_outside_dup_window_inserts_new_row() {
        let store = seeded();
        let scheduled_arrival_id = seed_scheduled_arrival(&store);

        store
            .record_arrival("5684", "38", scheduled_arrival_id, 1_000, 5, 600)
            .unwrap();
        store
            .record_arrival("5684", "38", scheduled_arrival_id, 2_000, 7, 600)
            .unwrap();

        let counts = store.deviation_counts("38", "5684", 0).unwrap();
        let total: i64 = counts.iter().map(|(_, c)| c).sum();
        assert_eq!(total, 2);
    }
}

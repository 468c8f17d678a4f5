//! Priority store: the canonical latest state per aircraft, plus the
//! append-only history behind it.
//!
//! The upsert decision is a pure function over `(source_priority,
//! last_contact)` pairs so the rules are testable without Postgres; the
//! repository wraps it in a row-locked transaction.

use anyhow::Result;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use tracing::{debug, instrument, trace};

use crate::aircraft_states::{AircraftState, DataSource};
use crate::db::PgPool;
use crate::errors::StoreError;
use crate::geo::BoundingBox;

/// A row older than this may be overwritten by a lower-priority source.
pub const STALENESS_WINDOW_SECONDS: i64 = 300;

/// A lower-priority update may also win if it is this much newer than the
/// stored contact, so a dead feed cannot pin a position forever.
pub const GRACE_WINDOW_SECONDS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Replaced,
    Rejected,
}

impl UpsertOutcome {
    pub fn accepted(&self) -> bool {
        !matches!(self, UpsertOutcome::Rejected)
    }
}

/// Decide whether an incoming `(priority, last_contact)` replaces the
/// existing row. Lower priority number wins; equal priority must be
/// monotonic in time; higher (worse) priority only refreshes stale rows.
pub fn decide_upsert(
    existing: Option<(i32, i64)>,
    incoming_priority: i32,
    incoming_last_contact: i64,
    now_secs: i64,
) -> UpsertOutcome {
    let Some((stored_priority, stored_last_contact)) = existing else {
        return UpsertOutcome::Inserted;
    };

    if incoming_priority < stored_priority {
        return UpsertOutcome::Replaced;
    }

    if incoming_priority == stored_priority {
        return if incoming_last_contact >= stored_last_contact {
            UpsertOutcome::Replaced
        } else {
            UpsertOutcome::Rejected
        };
    }

    // Worse priority: only refresh a stale row, or one the better source
    // has clearly stopped updating.
    let row_age = now_secs - stored_last_contact;
    if row_age > STALENESS_WINDOW_SECONDS
        || incoming_last_contact > stored_last_contact + GRACE_WINDOW_SECONDS
    {
        UpsertOutcome::Replaced
    } else {
        UpsertOutcome::Rejected
    }
}

/// Append-only snapshot written alongside accepted upserts.
#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = crate::schema::aircraft_state_history)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct HistoryRow {
    pub icao24: String,
    pub created_at: DateTime<Utc>,
    pub callsign: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub baro_altitude: Option<f64>,
    pub geo_altitude: Option<f64>,
    pub velocity: Option<f64>,
    pub true_track: Option<f64>,
    pub vertical_rate: Option<f64>,
    pub on_ground: bool,
    pub squawk: Option<String>,
    pub category: Option<i32>,
    pub data_source: DataSource,
    pub source_priority: i32,
    pub time_position: Option<i64>,
    pub last_contact: i64,
}

impl From<&AircraftState> for HistoryRow {
    fn from(state: &AircraftState) -> Self {
        Self {
            icao24: state.icao24.clone(),
            created_at: state.ingestion_timestamp,
            callsign: state.callsign.clone(),
            latitude: state.latitude,
            longitude: state.longitude,
            baro_altitude: state.baro_altitude,
            geo_altitude: state.geo_altitude,
            velocity: state.velocity,
            true_track: state.true_track,
            vertical_rate: state.vertical_rate,
            on_ground: state.on_ground,
            squawk: state.squawk.clone(),
            category: state.category,
            data_source: state.data_source,
            source_priority: state.source_priority,
            time_position: state.time_position,
            last_contact: state.last_contact,
        }
    }
}

#[derive(Clone)]
pub struct AircraftStatesRepository {
    pool: PgPool,
}

impl AircraftStatesRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Upsert one state under the priority rules. History is appended
    /// best-effort after the transaction commits.
    pub async fn upsert(
        &self,
        state: AircraftState,
        skip_history: bool,
    ) -> Result<UpsertOutcome, StoreError> {
        let mut outcomes = self.upsert_batch(vec![(state, skip_history)]).await?;
        Ok(outcomes.pop().expect("one outcome per state"))
    }

    /// Upsert a batch in a single transaction. Outcomes are returned in
    /// input order so the caller can ack each message individually.
    #[instrument(skip_all, fields(batch = states.len()))]
    pub async fn upsert_batch(
        &self,
        states: Vec<(AircraftState, bool)>,
    ) -> Result<Vec<UpsertOutcome>, StoreError> {
        if states.is_empty() {
            return Ok(Vec::new());
        }

        let pool = self.pool.clone();
        let now_secs = Utc::now().timestamp();

        let (outcomes, history) = tokio::task::spawn_blocking(
            move || -> Result<(Vec<UpsertOutcome>, Vec<HistoryRow>), StoreError> {
                use crate::schema::aircraft_states::dsl::*;

                let mut conn = pool.get()?;
                let mut history = Vec::new();

                let outcomes = conn
                    .transaction::<_, diesel::result::Error, _>(|conn| {
                        let mut outcomes = Vec::with_capacity(states.len());
                        for (state, skip) in &states {
                            let existing = aircraft_states
                                .filter(icao24.eq(&state.icao24))
                                .select((source_priority, last_contact))
                                .for_update()
                                .first::<(i32, i64)>(conn)
                                .optional()?;

                            let outcome = decide_upsert(
                                existing,
                                state.source_priority,
                                state.last_contact,
                                now_secs,
                            );

                            if outcome.accepted() {
                                diesel::insert_into(aircraft_states)
                                    .values(state)
                                    .on_conflict(icao24)
                                    .do_update()
                                    .set(state)
                                    .execute(conn)?;
                                if !skip {
                                    history.push(HistoryRow::from(state));
                                }
                            }
                            outcomes.push(outcome);
                        }
                        Ok(outcomes)
                    })
                    .map_err(StoreError::from_diesel)?;

                Ok((outcomes, history))
            },
        )
        .await
        .map_err(|e| StoreError::Transient(format!("upsert task panicked: {e}")))??;

        for outcome in &outcomes {
            match outcome {
                UpsertOutcome::Inserted => {
                    metrics::counter!("aircraft_states.inserted").increment(1)
                }
                UpsertOutcome::Replaced => {
                    metrics::counter!("aircraft_states.replaced").increment(1)
                }
                UpsertOutcome::Rejected => {
                    metrics::counter!("aircraft_states.rejected").increment(1)
                }
            }
        }

        if !history.is_empty() {
            self.append_history(history).await;
        }

        Ok(outcomes)
    }

    /// Best-effort history append. A duplicate `(icao24, created_at)` means
    /// the same snapshot arrived twice; it is swallowed at debug.
    async fn append_history(&self, rows: Vec<HistoryRow>) {
        use crate::schema::aircraft_state_history::dsl::*;

        let pool = self.pool.clone();
        let count = rows.len();

        let result = tokio::task::spawn_blocking(move || -> Result<usize> {
            let mut conn = pool.get()?;
            let written = diesel::insert_into(aircraft_state_history)
                .values(&rows)
                .on_conflict_do_nothing()
                .execute(&mut conn)?;
            Ok(written)
        })
        .await;

        match result {
            Ok(Ok(written)) => {
                metrics::counter!("aircraft_states.history_appended").increment(written as u64);
                if written < count {
                    debug!(
                        "History append skipped {} duplicate snapshots",
                        count - written
                    );
                }
            }
            Ok(Err(e)) => {
                debug!("History append failed (best-effort): {}", e);
                metrics::counter!("aircraft_states.history_errors").increment(1);
            }
            Err(e) => {
                debug!("History append task failed: {}", e);
                metrics::counter!("aircraft_states.history_errors").increment(1);
            }
        }
    }

    /// All states inside the rectangle with `last_contact >= min_last_contact`.
    /// Plain range predicates; the partial lat/lon index does the prefilter.
    pub async fn find_in_bounds(
        &self,
        bbox: BoundingBox,
        min_last_contact: i64,
    ) -> Result<Vec<AircraftState>> {
        use crate::schema::aircraft_states::dsl::*;

        let pool = self.pool.clone();
        let states = tokio::task::spawn_blocking(move || -> Result<Vec<AircraftState>> {
            let mut conn = pool.get()?;
            let rows = aircraft_states
                .filter(latitude.ge(bbox.lat_min))
                .filter(latitude.le(bbox.lat_max))
                .filter(longitude.ge(bbox.lon_min))
                .filter(longitude.le(bbox.lon_max))
                .filter(last_contact.ge(min_last_contact))
                .select(AircraftState::as_select())
                .load::<AircraftState>(&mut conn)?;
            Ok(rows)
        })
        .await??;

        trace!(
            "Bounds query returned {} states from the store",
            states.len()
        );
        Ok(states)
    }

    /// Look one aircraft up by icao24 (6 hex chars) or callsign.
    pub async fn get_by_identifier(&self, identifier: &str) -> Result<Option<AircraftState>> {
        use crate::schema::aircraft_states::dsl::*;

        let pool = self.pool.clone();
        let ident = identifier.trim().to_string();

        let state = tokio::task::spawn_blocking(move || -> Result<Option<AircraftState>> {
            let mut conn = pool.get()?;

            let looks_like_hex = ident.len() == 6 && ident.chars().all(|c| c.is_ascii_hexdigit());
            if looks_like_hex {
                let found = aircraft_states
                    .find(ident.to_ascii_lowercase())
                    .select(AircraftState::as_select())
                    .first::<AircraftState>(&mut conn)
                    .optional()?;
                if found.is_some() {
                    return Ok(found);
                }
            }

            let found = aircraft_states
                .filter(callsign.eq(ident.to_ascii_uppercase()))
                .order(last_contact.desc())
                .select(AircraftState::as_select())
                .first::<AircraftState>(&mut conn)
                .optional()?;
            Ok(found)
        })
        .await??;

        Ok(state)
    }

    /// Recent states for warming a fresh live-state cache.
    pub async fn recent_states(
        &self,
        window_seconds: i64,
        limit: i64,
    ) -> Result<Vec<AircraftState>> {
        use crate::schema::aircraft_states::dsl::*;

        let pool = self.pool.clone();
        let min_contact = Utc::now().timestamp() - window_seconds;

        let states = tokio::task::spawn_blocking(move || -> Result<Vec<AircraftState>> {
            let mut conn = pool.get()?;
            let rows = aircraft_states
                .filter(last_contact.ge(min_contact))
                .order(last_contact.desc())
                .limit(limit)
                .select(AircraftState::as_select())
                .load::<AircraftState>(&mut conn)?;
            Ok(rows)
        })
        .await??;

        Ok(states)
    }

    /// History snapshots for one aircraft in a time range, oldest first.
    /// Feeds the flight-path GeoJSON endpoint.
    pub async fn history_range(
        &self,
        aircraft: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<HistoryRow>> {
        use crate::schema::aircraft_state_history::dsl::*;

        let pool = self.pool.clone();
        let hex = aircraft.to_ascii_lowercase();

        let rows = tokio::task::spawn_blocking(move || -> Result<Vec<HistoryRow>> {
            let mut conn = pool.get()?;
            let rows = aircraft_state_history
                .filter(icao24.eq(&hex))
                .filter(created_at.ge(from))
                .filter(created_at.le(to))
                .order(created_at.asc())
                .select(HistoryRow::as_select())
                .load::<HistoryRow>(&mut conn)?;
            Ok(rows)
        })
        .await??;

        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000;

    #[test]
    fn missing_row_inserts() {
        assert_eq!(decide_upsert(None, 30, NOW, NOW), UpsertOutcome::Inserted);
    }

    #[test]
    fn higher_priority_wins_even_when_older() {
        // Feeder (10) beats commercial (20) despite an older packet
        assert_eq!(
            decide_upsert(Some((20, NOW)), 10, NOW - 20, NOW),
            UpsertOutcome::Replaced
        );
    }

    #[test]
    fn equal_priority_is_time_monotonic() {
        assert_eq!(
            decide_upsert(Some((30, NOW)), 30, NOW + 1, NOW),
            UpsertOutcome::Replaced
        );
        assert_eq!(
            decide_upsert(Some((30, NOW)), 30, NOW, NOW),
            UpsertOutcome::Replaced
        );
        assert_eq!(
            decide_upsert(Some((30, NOW)), 30, NOW - 1, NOW),
            UpsertOutcome::Rejected
        );
    }

    #[test]
    fn lower_priority_cannot_flap_fresh_row() {
        // Fresh commercial row, free-network update only 10s newer
        assert_eq!(
            decide_upsert(Some((20, NOW - 10)), 30, NOW, NOW),
            UpsertOutcome::Rejected
        );
    }

    #[test]
    fn lower_priority_refreshes_stale_row() {
        // Commercial row 400s old, past the 300s staleness window
        assert_eq!(
            decide_upsert(Some((20, NOW - 400)), 30, NOW, NOW),
            UpsertOutcome::Replaced
        );
    }

    #[test]
    fn lower_priority_wins_past_grace_window() {
        // Row only 60s old but the incoming contact is 40s newer
        assert_eq!(
            decide_upsert(Some((20, NOW - 60)), 30, NOW - 10, NOW),
            UpsertOutcome::Replaced
        );
        // 20s newer is inside the grace window
        assert_eq!(
            decide_upsert(Some((20, NOW - 60)), 30, NOW - 40, NOW),
            UpsertOutcome::Rejected
        );
    }

    #[test]
    fn priority_monotone_over_sequences() {
        // Whatever order updates arrive in, the stored priority never gets
        // worse while the better source stays fresh.
        let mut stored: Option<(i32, i64)> = None;
        let updates = [(30, NOW - 90), (10, NOW - 60), (20, NOW - 30), (30, NOW)];
        for (priority, contact) in updates {
            if decide_upsert(stored, priority, contact, NOW).accepted() {
                stored = Some((priority, contact));
            }
        }
        assert_eq!(stored, Some((10, NOW - 60)));
    }
}

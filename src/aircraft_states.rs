use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_derive_enum::DbEnum;
use serde::{Deserialize, Serialize};

/// Where an observation came from. Priority is assigned per source at the
/// adapter boundary and never rewritten downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, DbEnum)]
#[db_enum(existing_type_path = "crate::schema::sql_types::DataSource", value_style = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum DataSource {
    Feeder,
    FreeNetwork,
    CommercialNetwork,
    AeroApi,
}

impl DataSource {
    /// Lower wins everywhere downstream.
    pub fn priority(&self) -> i32 {
        match self {
            DataSource::Feeder => 10,
            DataSource::CommercialNetwork => 20,
            DataSource::FreeNetwork => 30,
            DataSource::AeroApi => 40,
        }
    }
}

/// The canonical observation of one aircraft at one moment.
///
/// Everything downstream of the provider adapters speaks these units:
/// meters, meters per second, degrees, Unix seconds.
#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(table_name = crate::schema::aircraft_states)]
#[diesel(check_for_backend(diesel::pg::Pg))]
// A replacing upsert is a full replacement: absent fields clear the column
#[diesel(treat_none_as_null = true)]
#[serde(rename_all = "camelCase")]
pub struct AircraftState {
    /// 24-bit ICAO address as 6 lowercase hex chars. Primary key.
    pub icao24: String,

    /// Identification
    pub callsign: Option<String>,
    pub registration: Option<String>,

    /// Kinematics (WGS-84 degrees, meters, m/s)
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub baro_altitude: Option<f64>,
    pub geo_altitude: Option<f64>,
    pub velocity: Option<f64>,
    pub true_track: Option<f64>,
    pub vertical_rate: Option<f64>,

    /// Status
    pub on_ground: bool,
    pub squawk: Option<String>,
    pub emergency_status: Option<String>,
    /// ADS-B emitter category, canonical 0..19 or null
    pub category: Option<i32>,
    pub aircraft_type: Option<String>,
    pub aircraft_description: Option<String>,

    /// Provenance
    pub data_source: DataSource,
    pub source_priority: i32,
    /// Unix seconds of the position sample, when the provider supplies one
    pub time_position: Option<i64>,
    /// Unix seconds of the most recent broadcast heard
    pub last_contact: i64,
    pub ingestion_timestamp: DateTime<Utc>,
}

impl AircraftState {
    pub fn has_position(&self) -> bool {
        matches!((self.latitude, self.longitude), (Some(lat), Some(lon))
            if lat.is_finite() && lon.is_finite())
    }

    /// Seconds since the last broadcast, never negative.
    pub fn contact_age_seconds(&self, now: DateTime<Utc>) -> i64 {
        (now.timestamp() - self.last_contact).max(0)
    }
}

/// Why a state failed validation. Counted, never propagated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationFailure {
    MissingIcao24,
    MalformedIcao24,
    CoordinateOutOfRange,
    ContactBeforePosition,
}

impl std::fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationFailure::MissingIcao24 => write!(f, "missing icao24"),
            ValidationFailure::MalformedIcao24 => write!(f, "malformed icao24"),
            ValidationFailure::CoordinateOutOfRange => write!(f, "coordinate out of range"),
            ValidationFailure::ContactBeforePosition => {
                write!(f, "last_contact earlier than time_position")
            }
        }
    }
}

/// Normalize a raw ICAO address to 6 lowercase hex chars, or reject it.
pub fn normalize_icao24(raw: &str) -> Result<String, ValidationFailure> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ValidationFailure::MissingIcao24);
    }
    if trimmed.len() != 6 || !trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ValidationFailure::MalformedIcao24);
    }
    Ok(trimmed.to_ascii_lowercase())
}

/// Upper-trim a callsign and drop it if nothing remains or it exceeds 8 chars.
pub fn normalize_callsign(raw: Option<&str>) -> Option<String> {
    let trimmed = raw?.trim().to_ascii_uppercase();
    if trimmed.is_empty() || trimmed.len() > 8 {
        return None;
    }
    Some(trimmed)
}

/// Coerce an emitter category into the canonical range. Out-of-range values
/// become null rather than being rejected.
pub fn coerce_category(raw: Option<i32>) -> Option<i32> {
    raw.filter(|c| (0..=19).contains(c))
}

/// Validate and normalize a state in place. Rejected states are dropped by
/// the caller; the reasons are counted there.
pub fn validate_state(state: &mut AircraftState) -> Result<(), ValidationFailure> {
    state.icao24 = normalize_icao24(&state.icao24)?;
    state.callsign = normalize_callsign(state.callsign.as_deref());
    state.category = coerce_category(state.category);

    if let Some(lat) = state.latitude {
        if !lat.is_finite() || !(-90.0..=90.0).contains(&lat) {
            return Err(ValidationFailure::CoordinateOutOfRange);
        }
    }
    if let Some(lon) = state.longitude {
        if !lon.is_finite() || !(-180.0..=180.0).contains(&lon) {
            return Err(ValidationFailure::CoordinateOutOfRange);
        }
    }

    // last_contact >= time_position when both are present. A sample stamped
    // after the last broadcast is provider clock skew; clamp rather than drop.
    if let Some(tp) = state.time_position
        && state.last_contact < tp
    {
        if tp - state.last_contact > 60 {
            return Err(ValidationFailure::ContactBeforePosition);
        }
        state.last_contact = tp;
    }

    Ok(())
}

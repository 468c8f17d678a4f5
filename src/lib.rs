//! Flyover: real-time aircraft surveillance data plane.
//!
//! Observations flow from provider adapters and feeder pushes through a
//! durable queue into the priority store and the live-state cache, then fan
//! out as events to WebSocket rooms and signed webhooks. Bounds queries
//! merge cache and store, join route annotations, and predict stale
//! positions before responding.

pub mod actions;
pub mod aircraft_states;
pub mod aircraft_states_repo;
pub mod bounds_query;
pub mod circuit_breaker;
pub mod commands;
pub mod config;
pub mod conus_scan;
pub mod db;
pub mod errors;
pub mod event_publisher;
pub mod events;
pub mod geo;
pub mod ingest_queue;
pub mod ingestion_worker;
pub mod live_state_cache;
pub mod log_format;
pub mod metrics;
pub mod providers;
pub mod rate_limit_governor;
pub mod rate_limit_window;
pub mod routes;
pub mod routes_repo;
pub mod schema;
pub mod trajectory;
pub mod web;
pub mod webhook_deliverer;
pub mod webhooks;
pub mod webhooks_repo;
pub mod ws_broadcaster;

pub use aircraft_states::{AircraftState, DataSource};
pub use bounds_query::{BoundsQueryPlanner, EnrichedAircraft};
pub use events::Event;
pub use ingest_queue::{DurableQueue, StateMessage};
pub use live_state_cache::LiveStateCache;

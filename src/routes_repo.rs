use std::time::Duration;

use anyhow::Result;
use diesel::prelude::*;
use moka::future::Cache;
use tracing::debug;

use crate::db::PgPool;
use crate::routes::Route;

/// Route storage with a short-TTL read cache in front. The bounds planner
/// hits this once per query with every candidate key, so misses are cached
/// too (as `None`) to avoid hammering the table for unknown flights.
#[derive(Clone)]
pub struct RoutesRepository {
    pool: PgPool,
    cache: Cache<String, Option<Route>>,
}

const ROUTE_CACHE_TTL: Duration = Duration::from_secs(300);
const ROUTE_CACHE_CAPACITY: u64 = 50_000;

impl RoutesRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            cache: Cache::builder()
                .max_capacity(ROUTE_CACHE_CAPACITY)
                .time_to_live(ROUTE_CACHE_TTL)
                .build(),
        }
    }

    /// Insert or refresh a route by flight key.
    pub async fn upsert(&self, route: Route) -> Result<()> {
        use crate::schema::routes::dsl::*;

        let pool = self.pool.clone();
        let record = route.clone();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut conn = pool.get()?;
            diesel::insert_into(routes)
                .values(&record)
                .on_conflict(flight_key)
                .do_update()
                .set(&record)
                .execute(&mut conn)?;
            Ok(())
        })
        .await??;

        metrics::counter!("routes.upserted").increment(1);
        self.cache.insert(route.flight_key.clone(), Some(route)).await;
        Ok(())
    }

    /// Look up one route by flight key, via the cache.
    pub async fn get(&self, key: &str) -> Option<Route> {
        if let Some(cached) = self.cache.get(key).await {
            metrics::counter!("routes.cache_hits").increment(1);
            return cached;
        }
        metrics::counter!("routes.cache_misses").increment(1);

        let fetched = match self.fetch(key.to_string()).await {
            Ok(route) => route,
            Err(e) => {
                debug!("Route lookup failed for {}: {}", key, e);
                return None;
            }
        };
        self.cache.insert(key.to_string(), fetched.clone()).await;
        fetched
    }

    async fn fetch(&self, key: String) -> Result<Option<Route>> {
        use crate::schema::routes::dsl::*;

        let pool = self.pool.clone();
        let route = tokio::task::spawn_blocking(move || -> Result<Option<Route>> {
            let mut conn = pool.get()?;
            let found = routes
                .filter(flight_key.eq(&key))
                .select(Route::as_select())
                .first::<Route>(&mut conn)
                .optional()?;
            Ok(found)
        })
        .await??;
        Ok(route)
    }
}

//! Per-meeting Postgres handles.

use std::str::FromStr;

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;

/// Build the lazy connection pool a meeting driver owns. Nothing touches
/// the network until the first query, so an unreachable server surfaces
/// as a query error during meeting construction, not here.
pub fn pool_for(url: &str) -> Result<PgPool, sqlx::Error> {
    let options = PgConnectOptions::from_str(url)?.application_name("meeting-server");
    Ok(PgPoolOptions::new()
        .max_connections(2)
        .connect_lazy_with(options))
}

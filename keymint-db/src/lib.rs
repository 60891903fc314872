//! Postgres persistence for keymint: the schema, the row models, and the
//! [`PgStore`] implementation of the engine's storage traits.

use keymint_common::config::DbConfig;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

/// Row types and conversions.
pub mod models;
/// The [`PgStore`] / [`PgTx`](store::PgTx) storage implementation.
pub mod store;

pub use store::{PgStore, PgTx};

/// Connect to Postgres and run pending migrations.
pub async fn connect(cfg: &DbConfig) -> anyhow::Result<PgStore> {
    let pool: PgPool = PgPoolOptions::new()
        .max_connections(cfg.max_connections)
        .connect(&cfg.url)
        .await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database connected; migrations up to date");
    Ok(PgStore::new(pool))
}

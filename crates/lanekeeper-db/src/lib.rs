//! Storage layer for the lanekeeper CI coordinator.
//!
//! The scheduler talks to a transactional store through the trait family in
//! [`store`]; [`pg`] is the PostgreSQL implementation, [`mem`] an in-memory
//! implementation with the same observable semantics, used by tests.

pub mod error;
pub mod mem;
pub mod pg;
pub mod store;

pub use error::{DbError, DbResult};
pub use mem::MemStore;
pub use pg::PgStore;
pub use store::{ConfigStore, NewDependency, NewLane, NewRevision, RevisionStore, Store, WorkStore, WorkUnit};

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Create a new database connection pool.
pub async fn create_pool(database_url: &str) -> DbResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> DbResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

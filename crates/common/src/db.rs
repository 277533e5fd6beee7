use anyhow::{Context, Result};
use diesel::PgConnection;
use diesel::connection::CacheSize;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool, PooledConnection};

use crate::error::AppError;

/// Type alias for the database connection pool.
pub type DbPool = Pool<ConnectionManager<PgConnection>>;

/// Type alias for a pooled database connection.
pub type DbConn = PooledConnection<ConnectionManager<PgConnection>>;

/// Connection customizer that disables Diesel's prepared-statement cache.
///
/// Transaction-mode poolers hand the same server session to many clients, so
/// a statement prepared by one client collides with another's (`42P05`).
#[derive(Debug, Clone, Copy)]
struct DisableStatementCache;

impl CustomizeConnection<PgConnection, diesel::r2d2::Error> for DisableStatementCache {
    fn on_acquire(&self, conn: &mut PgConnection) -> Result<(), diesel::r2d2::Error> {
        conn.set_prepared_statement_cache_size(CacheSize::Disabled);
        Ok(())
    }
}

/// Creates an r2d2 connection pool with a maximum of 10 connections.
pub fn create_pool(database_url: &str, disable_prepared_statements: bool) -> Result<DbPool> {
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    let mut builder = Pool::builder().max_size(10);

    if disable_prepared_statements {
        builder = builder.connection_customizer(Box::new(DisableStatementCache));
    }

    builder
        .build(manager)
        .context("Failed to create database connection pool")
}

/// Retrieves a connection from the pool.
pub fn get_conn(pool: &DbPool) -> Result<DbConn, AppError> {
    pool.get()
        .map_err(|e| AppError::Database(format!("Failed to get connection from pool: {e}")))
}

/// Returns true for SQLSTATE 42P05 ("prepared statement ... already exists"),
/// as carried through [`AppError::Database`].
fn is_prepared_statement_conflict(err: &AppError) -> bool {
    matches!(
        err,
        AppError::Database(msg) if msg.contains("prepared statement") && msg.contains("already exists")
    )
}

/// Runs a database operation, retrying exactly once after resetting the
/// session's prepared statements if the first attempt hits `42P05`.
///
/// Any other error surfaces immediately. The retry reuses the same pooled
/// connection after a `DEALLOCATE ALL`, which clears the poisoned server-side
/// statement cache left behind by a pooler session swap.
pub fn run_with_statement_retry<T, F>(pool: &DbPool, mut op: F) -> Result<T, AppError>
where
    F: FnMut(&mut PgConnection) -> Result<T, AppError>,
{
    let mut conn = get_conn(pool)?;

    match op(&mut conn) {
        Err(err) if is_prepared_statement_conflict(&err) => {
            tracing::warn!(error = %err, "prepared statement conflict, resetting session and retrying");

            diesel::sql_query("DEALLOCATE ALL")
                .execute(&mut conn)
                .map_err(|reset_err| {
                    AppError::Database(format!("failed to reset session statements: {reset_err}"))
                })?;

            op(&mut conn)
        }
        result => result,
    }
}

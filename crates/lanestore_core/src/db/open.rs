//! Connection bootstrap utilities for SQLite.
//!
//! # Responsibility
//! - Open file or in-memory SQLite connections per `StoreKind`.
//! - Configure connection pragmas required by store behavior.
//!
//! # Invariants
//! - Returned connections have `foreign_keys=ON` and a 5s busy timeout.
//! - `Sqlite` stores run in WAL mode; `Binary` stores hold an exclusive lock.

use super::{DbResult, StoreKind};
use log::{error, info};
use rusqlite::Connection;
use std::path::Path;
use std::time::{Duration, Instant};

/// Opens the connection for `kind`, creating parent directories for on-disk
/// stores.
///
/// # Side effects
/// - Creates the database file when missing.
/// - Emits `db_open` logging events with duration and status.
pub fn open_connection(kind: StoreKind, path: Option<&Path>) -> DbResult<Connection> {
    let started_at = Instant::now();
    info!(
        "event=db_open module=db status=start mode={}",
        kind.label()
    );

    let opened = match (kind, path) {
        (StoreKind::InMemory, _) | (_, None) => Connection::open_in_memory(),
        (_, Some(path)) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                if let Err(err) = std::fs::create_dir_all(parent) {
                    error!(
                        "event=db_open module=db status=error mode={} duration_ms={} error_code=db_dir_failed error={}",
                        kind.label(),
                        started_at.elapsed().as_millis(),
                        err
                    );
                    return Err(err.into());
                }
            }
            Connection::open(path)
        }
    };

    let conn = match opened {
        Ok(conn) => conn,
        Err(err) => {
            error!(
                "event=db_open module=db status=error mode={} duration_ms={} error_code=db_open_failed error={}",
                kind.label(),
                started_at.elapsed().as_millis(),
                err
            );
            return Err(err.into());
        }
    };

    match bootstrap_connection(&conn, kind) {
        Ok(()) => {
            info!(
                "event=db_open module=db status=ok mode={} duration_ms={}",
                kind.label(),
                started_at.elapsed().as_millis()
            );
            Ok(conn)
        }
        Err(err) => {
            error!(
                "event=db_open module=db status=error mode={} duration_ms={} error_code=db_bootstrap_failed error={}",
                kind.label(),
                started_at.elapsed().as_millis(),
                err
            );
            Err(err)
        }
    }
}

fn bootstrap_connection(conn: &Connection, kind: StoreKind) -> DbResult<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.busy_timeout(Duration::from_secs(5))?;
    match kind {
        StoreKind::Sqlite => {
            // These pragmas answer with the resulting mode as a row.
            conn.query_row("PRAGMA journal_mode = WAL;", [], |_| Ok(()))?;
        }
        StoreKind::Binary => {
            conn.query_row("PRAGMA journal_mode = DELETE;", [], |_| Ok(()))?;
            conn.query_row("PRAGMA locking_mode = EXCLUSIVE;", [], |_| Ok(()))?;
        }
        StoreKind::InMemory => {}
    }
    Ok(())
}

//! Shared SQLite pool setup for the MBTiles/SQLite/GeoPackage backends.

use anyhow::Result;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use std::{path::Path, time::Duration};

pub(crate) type SqlitePool = Pool<SqliteConnectionManager>;

/// Opens (or creates) a pooled SQLite database with the busy timeout all
/// backends rely on to survive `database is locked` under concurrency.
/// WAL mode trades durability for concurrent reader/writer throughput.
pub(crate) fn open_pool(path: &Path, timeout: Duration, wal: bool) -> Result<SqlitePool> {
	let manager = SqliteConnectionManager::file(path).with_init(move |conn| {
		conn.busy_timeout(timeout)?;
		if wal {
			conn.pragma_update(None, "journal_mode", "WAL")?;
			conn.pragma_update(None, "synchronous", "NORMAL")?;
		}
		Ok(())
	});
	Ok(Pool::builder().max_size(8).build(manager)?)
}

use rusqlite::Connection;

use crate::error::Result;

/// Initialise the snapshot table.
///
/// Safe to call on every startup; uses `IF NOT EXISTS` throughout.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS store_snapshots (
            id         INTEGER PRIMARY KEY CHECK (id = 1),
            version    INTEGER NOT NULL,
            payload    TEXT NOT NULL,
            saved_at   TEXT NOT NULL
        );",
    )?;
    Ok(())
}

use rusqlite::{params, Connection, OptionalExtension, Result};
use super::types::{PersistenceMode, StorageOp};

pub fn init_db(conn: &Connection, mode: &PersistenceMode) -> Result<()> {
    let sync_pragma = match mode {
        PersistenceMode::Sync => "FULL",
        _ => "NORMAL",
    };

    conn.execute_batch(&format!(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = {};",
        sync_pragma
    ))?;

    // Single row: slot is pinned to 0
    conn.execute(
        "CREATE TABLE IF NOT EXISTS state_cache (
            slot INTEGER PRIMARY KEY CHECK (slot = 0),
            snapshot TEXT NOT NULL,
            timestamp INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS last_config (
            slot INTEGER PRIMARY KEY CHECK (slot = 0),
            config TEXT NOT NULL
        )",
        [],
    )?;

    Ok(())
}

pub fn load_snapshot(conn: &Connection) -> Result<Option<(String, u64)>> {
    conn.query_row(
        "SELECT snapshot, timestamp FROM state_cache WHERE slot = 0",
        [],
        |row| {
            let snapshot: String = row.get(0)?;
            let timestamp = row.get::<_, i64>(1)?.max(0) as u64;
            Ok((snapshot, timestamp))
        },
    )
    .optional()
}

pub fn load_config(conn: &Connection) -> Result<Option<String>> {
    conn.query_row("SELECT config FROM last_config WHERE slot = 0", [], |row| row.get(0))
        .optional()
}

pub fn exec_op(tx: &rusqlite::Transaction, op: &StorageOp) -> Result<()> {
    match op {
        StorageOp::SaveSnapshot { snapshot, timestamp } => {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO state_cache (slot, snapshot, timestamp) VALUES (0, ?1, ?2)
                 ON CONFLICT(slot) DO UPDATE SET snapshot = excluded.snapshot, timestamp = excluded.timestamp",
            )?;
            stmt.execute(params![snapshot, *timestamp as i64])?;
        }
        StorageOp::SaveConfig(config) => {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO last_config (slot, config) VALUES (0, ?1)
                 ON CONFLICT(slot) DO UPDATE SET config = excluded.config",
            )?;
            stmt.execute(params![config])?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_slot_overwrites() {
        let mut conn = Connection::open_in_memory().unwrap();
        init_db(&conn, &PersistenceMode::Sync).unwrap();
        assert!(load_snapshot(&conn).unwrap().is_none());

        for (body, ts) in [("{\"a\":1}", 10u64), ("{\"a\":2}", 20)] {
            let tx = conn.transaction().unwrap();
            exec_op(&tx, &StorageOp::SaveSnapshot { snapshot: body.into(), timestamp: ts }).unwrap();
            tx.commit().unwrap();
        }

        let count: i64 = conn.query_row("SELECT COUNT(*) FROM state_cache", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 1);
        assert_eq!(load_snapshot(&conn).unwrap(), Some(("{\"a\":2}".to_string(), 20)));
    }
}

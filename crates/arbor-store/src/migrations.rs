//! Schema creation for the nodes table.

use rusqlite::Connection;

use crate::errors::Result;

/// Create the schema if it does not exist. Idempotent.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS nodes (
            id              TEXT PRIMARY KEY,
            session_id      TEXT NOT NULL,
            parent_id       TEXT REFERENCES nodes(id),
            depth           INTEGER NOT NULL,
            prompt          TEXT NOT NULL,
            response        TEXT,
            status          TEXT NOT NULL,
            model           TEXT NOT NULL,
            temperature     REAL NOT NULL,
            max_tokens      INTEGER NOT NULL,
            prompt_tokens   INTEGER,
            response_tokens INTEGER,
            cost_usd        REAL,
            system_prompt   TEXT,
            kind            TEXT NOT NULL,
            created_at      TEXT NOT NULL,
            updated_at      TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_nodes_session ON nodes(session_id);
        CREATE INDEX IF NOT EXISTS idx_nodes_parent  ON nodes(parent_id);",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'nodes'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn indexes_exist() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name LIKE 'idx_nodes_%'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 2);
    }
}

//! Field index schema inside the embedded engine.

use crate::error::Result;
use crate::query::TableLayout;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Optional engine features detected while bootstrapping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineCapabilities {
    /// `field_values_trigram` exists and is kept in sync by triggers.
    pub trigram: bool,
}

/// Creates the field index tables and the optional trigram mirror.
pub struct FieldSchema<'a> {
    layout: &'a TableLayout,
}

impl<'a> FieldSchema<'a> {
    pub fn new(layout: &'a TableLayout) -> Self {
        Self { layout }
    }

    /// Drop and recreate every table of the field index.
    pub fn bootstrap(&self, conn: &Connection) -> Result<EngineCapabilities> {
        self.drop_all(conn)?;
        self.create_tables(conn)?;

        let trigram = match self.create_trigram_mirror(conn) {
            Ok(()) => true,
            Err(e) => {
                warn!("Trigram matching unavailable, falling back to LIKE scans: {}", e);
                false
            }
        };

        info!(
            "Bootstrapped field index schema (trigram: {})",
            if trigram { "yes" } else { "no" }
        );
        Ok(EngineCapabilities { trigram })
    }

    fn drop_all(&self, conn: &Connection) -> Result<()> {
        let l = self.layout;
        conn.execute_batch(&format!(
            "
            DROP TRIGGER IF EXISTS {trigram}_ai;
            DROP TRIGGER IF EXISTS {trigram}_ad;
            DROP TRIGGER IF EXISTS {trigram}_au;
            DROP TABLE IF EXISTS {trigram};
            DROP TABLE IF EXISTS {split};
            DROP TABLE IF EXISTS {values};
            DROP TABLE IF EXISTS {entities};
            ",
            trigram = l.trigram_table,
            split = l.split_values_table,
            values = l.values_table,
            entities = l.entities_table,
        ))?;
        Ok(())
    }

    fn create_tables(&self, conn: &Connection) -> Result<()> {
        let l = self.layout;
        conn.execute_batch(&format!(
            "
            CREATE TABLE {entities} (
                entity_id TEXT PRIMARY KEY,
                content_hash TEXT NOT NULL
            );
            CREATE TABLE {values} (
                id INTEGER PRIMARY KEY,
                entity_id TEXT NOT NULL,
                field_name TEXT NOT NULL,
                field_value TEXT NOT NULL,
                field_value_transformed TEXT NOT NULL DEFAULT '',
                value_position INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX idx_{values}_entity ON {values}(entity_id, field_name);
            CREATE INDEX idx_{values}_name ON {values}(field_name);
            CREATE TABLE {split} (
                id INTEGER PRIMARY KEY,
                entity_id TEXT NOT NULL,
                field_name TEXT NOT NULL,
                field_value TEXT NOT NULL,
                field_value_transformed TEXT NOT NULL DEFAULT ''
            );
            CREATE INDEX idx_{split}_entity ON {split}(entity_id, field_name);
            ",
            entities = l.entities_table,
            values = l.values_table,
            split = l.split_values_table,
        ))?;
        debug!("Created field index tables");
        Ok(())
    }

    fn create_trigram_mirror(&self, conn: &Connection) -> Result<()> {
        let l = self.layout;
        conn.execute_batch(&format!(
            "
            CREATE VIRTUAL TABLE {trigram} USING fts5(
                field_value,
                field_value_transformed,
                content='{values}',
                content_rowid='id',
                tokenize='trigram'
            );
            CREATE TRIGGER {trigram}_ai AFTER INSERT ON {values} BEGIN
                INSERT INTO {trigram}(rowid, field_value, field_value_transformed)
                    VALUES (NEW.id, NEW.field_value, NEW.field_value_transformed);
            END;
            CREATE TRIGGER {trigram}_ad AFTER DELETE ON {values} BEGIN
                INSERT INTO {trigram}({trigram}, rowid, field_value, field_value_transformed)
                    VALUES ('delete', OLD.id, OLD.field_value, OLD.field_value_transformed);
            END;
            CREATE TRIGGER {trigram}_au AFTER UPDATE ON {values} BEGIN
                INSERT INTO {trigram}({trigram}, rowid, field_value, field_value_transformed)
                    VALUES ('delete', OLD.id, OLD.field_value, OLD.field_value_transformed);
                INSERT INTO {trigram}(rowid, field_value, field_value_transformed)
                    VALUES (NEW.id, NEW.field_value, NEW.field_value_transformed);
            END;
            ",
            trigram = l.trigram_table,
            values = l.values_table,
        ))?;
        debug!("Created trigram mirror {}", l.trigram_table);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count(conn: &Connection, sql: &str) -> i64 {
        conn.query_row(sql, [], |row| row.get(0)).unwrap()
    }

    #[test]
    fn test_bootstrap_creates_tables_and_mirror() {
        let conn = Connection::open_in_memory().unwrap();
        let layout = TableLayout::default();
        let caps = FieldSchema::new(&layout).bootstrap(&conn).unwrap();
        assert!(caps.trigram);

        conn.execute(
            "INSERT INTO field_values(entity_id, field_name, field_value, field_value_transformed) \
             VALUES ('1', 'author', 'M{\\\"u}ller', 'Müller')",
            [],
        )
        .unwrap();
        assert_eq!(
            count(
                &conn,
                "SELECT count(*) FROM field_values_trigram WHERE field_values_trigram MATCH '\"üll\"'"
            ),
            1
        );
        conn.execute(
            "INSERT INTO field_values(entity_id, field_name, field_value) VALUES ('1', 'title', 'Graph Theory')",
            [],
        )
        .unwrap();
        assert_eq!(
            count(
                &conn,
                "SELECT count(*) FROM field_values_trigram WHERE field_values_trigram MATCH '\"raph\"'"
            ),
            1
        );

        conn.execute("DELETE FROM field_values", []).unwrap();
        assert_eq!(
            count(
                &conn,
                "SELECT count(*) FROM field_values_trigram WHERE field_values_trigram MATCH '\"raph\"'"
            ),
            0
        );
    }

    #[test]
    fn test_bootstrap_drops_previous_contents() {
        let conn = Connection::open_in_memory().unwrap();
        let layout = TableLayout::default();
        let schema = FieldSchema::new(&layout);
        schema.bootstrap(&conn).unwrap();
        conn.execute(
            "INSERT INTO entities(entity_id, content_hash) VALUES ('1', 'h')",
            [],
        )
        .unwrap();

        conn.execute(
            "INSERT INTO field_values_split(entity_id, field_name, field_value) VALUES ('1', 'author', 'Euler')",
            [],
        )
        .unwrap();

        schema.bootstrap(&conn).unwrap();
        assert_eq!(count(&conn, "SELECT count(*) FROM entities"), 0);
        assert_eq!(count(&conn, "SELECT count(*) FROM field_values_split"), 0);
    }
}

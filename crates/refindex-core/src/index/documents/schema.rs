//! FTS5 tables of the document index.

use crate::error::Result;
use crate::query::TableLayout;
use rusqlite::Connection;
use tracing::{debug, info};

/// Table names and tokenizer of the document index.
#[derive(Debug, Clone)]
pub struct DocumentSchemaConfig {
    /// FTS5 table with one row per document page.
    pub table_name: String,
    /// Bookkeeping table of indexed files and their modification times.
    pub files_table: String,
    pub tokenizer: String,
}

impl Default for DocumentSchemaConfig {
    fn default() -> Self {
        Self::for_layout(&TableLayout::default())
    }
}

impl DocumentSchemaConfig {
    pub fn for_layout(layout: &TableLayout) -> Self {
        Self {
            table_name: layout.documents_table.clone(),
            files_table: "indexed_files".to_string(),
            tokenizer: "unicode61 remove_diacritics 2".to_string(),
        }
    }
}

/// Setup and maintenance of the document tables.
pub struct DocumentSchema<'a> {
    config: &'a DocumentSchemaConfig,
}

impl<'a> DocumentSchema<'a> {
    pub fn new(config: &'a DocumentSchemaConfig) -> Self {
        Self { config }
    }

    /// Check if the FTS5 table exists.
    pub fn table_exists(&self, conn: &Connection) -> Result<bool> {
        let count: i32 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
            [&self.config.table_name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Create whatever is missing. Existing contents are kept.
    pub fn ensure_setup(&self, conn: &Connection) -> Result<()> {
        if !self.table_exists(conn)? {
            self.create_tables(conn)?;
        }
        Ok(())
    }

    pub fn create_tables(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch(&format!(
            "CREATE VIRTUAL TABLE IF NOT EXISTS {table} USING fts5(
                entity_id UNINDEXED,
                path UNINDEXED,
                page UNINDEXED,
                content,
                tokenize='{tokenizer}'
            );
            CREATE TABLE IF NOT EXISTS {files} (
                entity_id TEXT NOT NULL,
                path TEXT NOT NULL,
                modified INTEGER NOT NULL,
                PRIMARY KEY (entity_id, path)
            );",
            table = self.config.table_name,
            tokenizer = self.config.tokenizer,
            files = self.config.files_table,
        ))?;
        info!("Created document index tables: {}", self.config.table_name);
        Ok(())
    }

    /// Delete every page and file entry.
    pub fn clear(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch(&format!(
            "DELETE FROM {}; DELETE FROM {};",
            self.config.table_name, self.config.files_table
        ))?;
        debug!("Cleared document index");
        Ok(())
    }

    /// Merge FTS5 segments.
    pub fn optimize(&self, conn: &Connection) -> Result<()> {
        let sql = format!(
            "INSERT INTO {}({}) VALUES('optimize')",
            self.config.table_name, self.config.table_name
        );
        conn.execute(&sql, [])?;
        debug!("Optimized document index");
        Ok(())
    }

    pub fn get_stats(&self, conn: &Connection) -> Result<DocumentTableStats> {
        let page_count: usize = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", self.config.table_name),
            [],
            |row| row.get(0),
        )?;
        let (file_count, entity_count): (usize, usize) = conn.query_row(
            &format!(
                "SELECT COUNT(*), COUNT(DISTINCT entity_id) FROM {}",
                self.config.files_table
            ),
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(DocumentTableStats {
            page_count,
            file_count,
            entity_count,
        })
    }
}

/// Row counts of the document tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentTableStats {
    pub page_count: usize,
    pub file_count: usize,
    pub entity_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_db() -> (Connection, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let conn = Connection::open(temp_dir.path().join("documents.sqlite")).unwrap();
        (conn, temp_dir)
    }

    #[test]
    fn test_setup_is_idempotent() {
        let (conn, _temp) = create_test_db();
        let config = DocumentSchemaConfig::default();
        let schema = DocumentSchema::new(&config);

        assert!(!schema.table_exists(&conn).unwrap());
        schema.ensure_setup(&conn).unwrap();
        assert!(schema.table_exists(&conn).unwrap());

        conn.execute(
            "INSERT INTO documents (entity_id, path, page, content) VALUES ('1', '/a.txt', 1, 'bridges')",
            [],
        )
        .unwrap();
        schema.ensure_setup(&conn).unwrap();
        assert_eq!(schema.get_stats(&conn).unwrap().page_count, 1);
    }

    #[test]
    fn test_diacritics_are_folded() {
        let (conn, _temp) = create_test_db();
        let config = DocumentSchemaConfig::default();
        let schema = DocumentSchema::new(&config);
        schema.ensure_setup(&conn).unwrap();

        conn.execute(
            "INSERT INTO documents (entity_id, path, page, content) VALUES ('1', '/a.txt', 1, 'Königsberg')",
            [],
        )
        .unwrap();
        let hits: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM documents WHERE documents MATCH 'konigsberg'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(hits, 1);
    }

    #[test]
    fn test_clear_and_stats() {
        let (conn, _temp) = create_test_db();
        let config = DocumentSchemaConfig::default();
        let schema = DocumentSchema::new(&config);
        schema.ensure_setup(&conn).unwrap();

        conn.execute_batch(
            "INSERT INTO documents (entity_id, path, page, content) VALUES ('1', '/a.txt', 1, 'x');
             INSERT INTO documents (entity_id, path, page, content) VALUES ('1', '/a.txt', 2, 'y');
             INSERT INTO indexed_files (entity_id, path, modified) VALUES ('1', '/a.txt', 10);",
        )
        .unwrap();
        let stats = schema.get_stats(&conn).unwrap();
        assert_eq!(stats, DocumentTableStats { page_count: 2, file_count: 1, entity_count: 1 });

        schema.optimize(&conn).unwrap();
        schema.clear(&conn).unwrap();
        assert_eq!(schema.get_stats(&conn).unwrap().page_count, 0);
    }
}

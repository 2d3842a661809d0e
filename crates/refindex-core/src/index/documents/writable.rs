//! The writable document index, owned by exactly one process at a time.

use super::extract::TextExtractor;
use super::schema::{DocumentSchema, DocumentSchemaConfig};
use super::run_search;
use crate::cancel::CancellationToken;
use crate::config::IndexDefaults;
use crate::engine::{configure_connection, register_functions};
use crate::error::{RefIndexError, Result};
use crate::index::traits::{BackendHit, IndexReport, IndexStats, Indexer, IndexerState, Searcher};
use crate::model::{Entity, EntityId, FieldChange, FieldValue, LinkedFile, RecordStore};
use crate::query::{Backend, CompiledQuery};
use fs2::FileExt;
use rusqlite::{params, Connection};
use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::UNIX_EPOCH;
use tracing::{debug, info, warn};

pub struct WritableDocumentIndex {
    db_path: PathBuf,
    schema: DocumentSchemaConfig,
    store: Arc<dyn RecordStore>,
    extractor: Arc<dyn TextExtractor>,
    writer: Mutex<Option<Connection>>,
    reader: Mutex<Option<Connection>>,
    lock_file: Mutex<Option<File>>,
}

impl WritableDocumentIndex {
    /// Take the write lock of `dir` and open the index inside it.
    ///
    /// Fails with `IndexerDegraded` when another process holds the lock or
    /// the database cannot be opened for writing.
    pub fn open(
        dir: &Path,
        schema: DocumentSchemaConfig,
        store: Arc<dyn RecordStore>,
        extractor: Arc<dyn TextExtractor>,
    ) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(|e| RefIndexError::io_with_path(e, dir))?;

        let lock_path = dir.join(IndexDefaults::WRITE_LOCK_FILENAME);
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| RefIndexError::io_with_path(e, &lock_path))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|e| RefIndexError::IndexerDegraded {
                message: format!("{} is locked by another writer: {}", lock_path.display(), e),
            })?;

        let db_path = dir.join(IndexDefaults::DOCUMENT_DATABASE_FILENAME);
        let degraded = |e: RefIndexError| RefIndexError::IndexerDegraded {
            message: format!("Failed to open {} for writing: {}", db_path.display(), e),
        };
        let writer = open_connection(&db_path).map_err(degraded)?;
        DocumentSchema::new(&schema).ensure_setup(&writer).map_err(degraded)?;
        let reader = open_connection(&db_path).map_err(degraded)?;

        info!("Opened document index at {}", dir.display());
        Ok(Self {
            db_path,
            schema,
            store,
            extractor,
            writer: Mutex::new(Some(writer)),
            reader: Mutex::new(Some(reader)),
            lock_file: Mutex::new(Some(lock_file)),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn lock_writer(&self) -> MutexGuard<'_, Option<Connection>> {
        self.writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_reader(&self) -> MutexGuard<'_, Option<Connection>> {
        self.reader.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn with_writer<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut guard = self.lock_writer();
        let conn = guard.as_mut().ok_or(RefIndexError::Closed)?;
        f(conn)
    }

    /// Indexed files of one entity with their recorded modification times.
    fn indexed_files(&self, conn: &Connection, entity_id: &EntityId) -> Result<HashMap<String, i64>> {
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT path, modified FROM {} WHERE entity_id = ?1",
            self.schema.files_table
        ))?;
        let rows = stmt.query_map(params![entity_id.as_str()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut files = HashMap::new();
        for row in rows {
            let (path, modified) = row?;
            files.insert(path, modified);
        }
        Ok(files)
    }

    fn delete_file(&self, conn: &mut Connection, entity_id: &EntityId, path: &str) -> Result<()> {
        let tx = conn.transaction()?;
        tx.execute(
            &format!(
                "DELETE FROM {} WHERE entity_id = ?1 AND path = ?2",
                self.schema.table_name
            ),
            params![entity_id.as_str(), path],
        )?;
        tx.execute(
            &format!(
                "DELETE FROM {} WHERE entity_id = ?1 AND path = ?2",
                self.schema.files_table
            ),
            params![entity_id.as_str(), path],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn delete_entity(&self, conn: &mut Connection, entity_id: &EntityId) -> Result<()> {
        let tx = conn.transaction()?;
        for table in [&self.schema.table_name, &self.schema.files_table] {
            tx.execute(
                &format!("DELETE FROM {table} WHERE entity_id = ?1"),
                params![entity_id.as_str()],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn write_file(
        &self,
        conn: &mut Connection,
        entity_id: &EntityId,
        path: &str,
        modified: i64,
        pages: &[String],
    ) -> Result<()> {
        let tx = conn.transaction()?;
        tx.execute(
            &format!(
                "DELETE FROM {} WHERE entity_id = ?1 AND path = ?2",
                self.schema.table_name
            ),
            params![entity_id.as_str(), path],
        )?;
        {
            let mut insert = tx.prepare_cached(&format!(
                "INSERT INTO {} (entity_id, path, page, content) VALUES (?1, ?2, ?3, ?4)",
                self.schema.table_name
            ))?;
            for (index, page) in pages.iter().enumerate() {
                insert.execute(params![entity_id.as_str(), path, index as i64 + 1, page])?;
            }
        }
        tx.execute(
            &format!(
                "INSERT INTO {} (entity_id, path, modified) VALUES (?1, ?2, ?3)
                 ON CONFLICT(entity_id, path) DO UPDATE SET modified = excluded.modified",
                self.schema.files_table
            ),
            params![entity_id.as_str(), path, modified],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Index `path` for `entity_id` unless its recorded modification time is
    /// current.
    fn index_file(
        &self,
        conn: &mut Connection,
        entity_id: &EntityId,
        path: &Path,
        indexed: &HashMap<String, i64>,
        report: &mut IndexReport,
    ) -> Result<()> {
        let key = path.to_string_lossy().to_string();
        let Some(modified) = modified_millis(path) else {
            debug!("Skipping {}: no modification time", path.display());
            report.skipped += 1;
            return Ok(());
        };
        if indexed.get(&key) == Some(&modified) {
            report.skipped += 1;
            return Ok(());
        }
        if !self.extractor.supports(path) {
            debug!("Skipping {}: no extractor for this file type", path.display());
            report.skipped += 1;
            return Ok(());
        }
        match self.extractor.extract(path) {
            Ok(pages) => {
                self.write_file(conn, entity_id, &key, modified, &pages)?;
                report.processed += 1;
            }
            Err(e) => {
                warn!("Failed to extract text for {}: {}", entity_id, e);
                if indexed.contains_key(&key) {
                    self.delete_file(conn, entity_id, &key)?;
                }
                report.failed += 1;
            }
        }
        Ok(())
    }

    /// Make the indexed files of `entity` match its linked files.
    fn reconcile_entity(
        &self,
        conn: &mut Connection,
        entity: &Entity,
        cancel: &CancellationToken,
        report: &mut IndexReport,
    ) -> Result<()> {
        let indexed = self.indexed_files(conn, &entity.id)?;
        let mut wanted = Vec::new();
        for file in entity.linked_files() {
            match self.store.resolve_file(&file) {
                Some(path) => wanted.push(path),
                None => {
                    debug!("Linked file {} of {} not found", file.link, entity.id);
                    report.skipped += 1;
                }
            }
        }

        let wanted_keys: HashSet<String> = wanted
            .iter()
            .map(|path| path.to_string_lossy().to_string())
            .collect();
        for stale in indexed.keys().filter(|key| !wanted_keys.contains(*key)) {
            self.delete_file(conn, &entity.id, stale)?;
            report.processed += 1;
        }

        for path in &wanted {
            cancel.check()?;
            self.index_file(conn, &entity.id, path, &indexed, report)?;
        }
        report.entity_ids.push(entity.id.clone());
        Ok(())
    }

    fn add_batch(
        &self,
        conn: &mut Connection,
        entities: &[Entity],
        cancel: &CancellationToken,
    ) -> Result<IndexReport> {
        let mut report = IndexReport::new(Backend::FullText);
        for entity in entities {
            cancel.check()?;
            self.reconcile_entity(conn, entity, cancel, &mut report)?;
        }
        Ok(report)
    }

    /// Path a link points at, whether or not the file still exists.
    fn link_path(&self, file: &LinkedFile) -> Option<PathBuf> {
        let link = Path::new(&file.link);
        if link.is_absolute() {
            Some(link.to_path_buf())
        } else {
            self.store.base_dir().map(|base| base.join(link))
        }
    }

    fn indexed_entity_ids(&self, conn: &Connection) -> Result<Vec<EntityId>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT DISTINCT entity_id FROM {}",
            self.schema.files_table
        ))?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(EntityId::from(row?));
        }
        Ok(ids)
    }
}

fn linked_set(value: Option<&FieldValue>) -> HashSet<LinkedFile> {
    value
        .map(|value| value.values(crate::config::FieldNames::FILE, ';'))
        .unwrap_or_default()
        .iter()
        .filter_map(|item| LinkedFile::parse(item))
        .filter(|file| !file.is_online())
        .collect()
}

fn modified_millis(path: &Path) -> Option<i64> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    let since_epoch = modified.duration_since(UNIX_EPOCH).ok()?;
    i64::try_from(since_epoch.as_millis()).ok()
}

fn open_connection(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)?;
    configure_connection(&conn)?;
    register_functions(&conn)?;
    Ok(conn)
}

impl Indexer for WritableDocumentIndex {
    fn backend(&self) -> Backend {
        Backend::FullText
    }

    fn state(&self) -> IndexerState {
        if self.lock_writer().is_some() {
            IndexerState::Writable
        } else {
            IndexerState::Closed
        }
    }

    fn add_to_index(&self, entities: &[Entity], cancel: &CancellationToken) -> Result<IndexReport> {
        let report = self.with_writer(|conn| self.add_batch(conn, entities, cancel))?;
        debug!(
            "Indexed linked files of {} entities: {} written, {} skipped, {} failed",
            entities.len(),
            report.processed,
            report.skipped,
            report.failed
        );
        Ok(report)
    }

    fn remove_from_index(&self, entities: &[Entity]) -> Result<IndexReport> {
        self.with_writer(|conn| {
            let mut report = IndexReport::new(Backend::FullText);
            for entity in entities {
                self.delete_entity(conn, &entity.id)?;
                report.processed += 1;
                report.entity_ids.push(entity.id.clone());
            }
            Ok(report)
        })
    }

    fn update_entry(
        &self,
        entity: &Entity,
        change: &FieldChange,
        cancel: &CancellationToken,
    ) -> Result<IndexReport> {
        let mut report = IndexReport::new(Backend::FullText);
        if !change.is_file_change() {
            return Ok(report);
        }
        let old = linked_set(change.old_value.as_ref());
        let new = linked_set(change.new_value.as_ref());

        self.with_writer(|conn| {
            for file in old.difference(&new) {
                if let Some(path) = self.link_path(file) {
                    self.delete_file(conn, &entity.id, &path.to_string_lossy())?;
                    report.processed += 1;
                }
            }
            let indexed = self.indexed_files(conn, &entity.id)?;
            for file in new.difference(&old) {
                cancel.check()?;
                match self.store.resolve_file(file) {
                    Some(path) => self.index_file(conn, &entity.id, &path, &indexed, &mut report)?,
                    None => report.skipped += 1,
                }
            }
            report.entity_ids.push(entity.id.clone());
            Ok(())
        })?;
        Ok(report)
    }

    fn rebuild_index(&self, entities: &[Entity], cancel: &CancellationToken) -> Result<IndexReport> {
        let report = self.with_writer(|conn| {
            DocumentSchema::new(&self.schema).clear(conn)?;
            self.add_batch(conn, entities, cancel)
        })?;
        info!(
            "Rebuilt document index: {} documents from {} entities",
            report.processed,
            entities.len()
        );
        Ok(report)
    }

    fn sync_index(&self, entities: &[Entity], cancel: &CancellationToken) -> Result<IndexReport> {
        self.with_writer(|conn| {
            let current: HashSet<&str> = entities.iter().map(|e| e.id.as_str()).collect();
            let mut removed = Vec::new();
            for id in self.indexed_entity_ids(conn)? {
                if !current.contains(id.as_str()) {
                    self.delete_entity(conn, &id)?;
                    removed.push(id);
                }
            }
            let mut report = self.add_batch(conn, entities, cancel)?;
            report.processed += removed.len();
            report.entity_ids.extend(removed);
            Ok(report)
        })
    }

    fn remove_all_from_index(&self) -> Result<IndexReport> {
        self.with_writer(|conn| DocumentSchema::new(&self.schema).clear(conn))?;
        info!("Removed all documents from the document index");
        Ok(IndexReport::new(Backend::FullText))
    }

    fn stats(&self) -> Result<IndexStats> {
        let guard = self.lock_reader();
        let stats = match guard.as_ref() {
            Some(conn) => DocumentSchema::new(&self.schema).get_stats(conn)?,
            None => return Err(RefIndexError::Closed),
        };
        drop(guard);
        Ok(IndexStats {
            backend: Backend::FullText,
            state: self.state(),
            entity_count: stats.entity_count,
            row_count: stats.page_count,
        })
    }

    fn close(&self) {
        if let Some(conn) = self.lock_writer().take() {
            if let Err(e) = DocumentSchema::new(&self.schema).optimize(&conn) {
                warn!("Failed to optimize document index on close: {}", e);
            }
        }
        self.lock_reader().take();
        let lock_file = self
            .lock_file
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(file) = lock_file {
            if let Err(e) = FileExt::unlock(&file) {
                warn!("Failed to release document index lock: {}", e);
            }
        }
        debug!("Closed document index {}", self.db_path.display());
    }
}

impl Searcher for WritableDocumentIndex {
    fn search(&self, query: &CompiledQuery) -> Result<Vec<BackendHit>> {
        let guard = self.lock_reader();
        match guard.as_ref() {
            Some(conn) => run_search(conn, query),
            None => Ok(Vec::new()),
        }
    }
}

impl Drop for WritableDocumentIndex {
    fn drop(&mut self) {
        self.close();
    }
}

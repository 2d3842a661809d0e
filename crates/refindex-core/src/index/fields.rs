//! Structured field index: `(entity_id, field_name, field_value)` rows in the
//! embedded engine.
//!
//! Scalar fields get one row. List values and separator-joined multi-value
//! fields (keywords, groups, file) get one row per item, numbered by
//! `value_position`. Every row also carries its LaTeX-free form, and person
//! fields get one extra row per name in the split table. When the engine is unavailable every mutation is dropped
//! with a log line and every search comes back empty.

use super::traits::{BackendHit, IndexReport, IndexStats, Indexer, IndexerState, Searcher};
use crate::cancel::CancellationToken;
use crate::engine::{EngineSupervisor, PooledConnection};
use crate::error::{RefIndexError, Result};
use crate::model::{latex_to_unicode, Entity, EntityId, FieldChange, FieldValue};
use crate::query::{Backend, CompiledQuery, TableLayout};
use rusqlite::{params, params_from_iter, Transaction};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

pub struct FieldIndexer {
    engine: Arc<EngineSupervisor>,
    keyword_separator: char,
    closed: AtomicBool,
}

impl FieldIndexer {
    pub fn new(engine: Arc<EngineSupervisor>, keyword_separator: char) -> Self {
        Self {
            engine,
            keyword_separator,
            closed: AtomicBool::new(false),
        }
    }

    fn layout(&self) -> &TableLayout {
        self.engine.layout()
    }

    fn conn(&self) -> Option<PooledConnection> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        self.engine.get_connection()
    }

    fn write_entity(&self, tx: &Transaction<'_>, entity: &Entity) -> Result<()> {
        self.delete_rows(tx, &entity.id, None)?;
        for (name, value) in &entity.fields {
            self.insert_field(tx, &entity.id, name, value)?;
        }
        self.upsert_hash(tx, entity)
    }

    /// Remove the value and split rows of one entity, or of one of its fields.
    fn delete_rows(&self, tx: &Transaction<'_>, id: &EntityId, field: Option<&str>) -> Result<()> {
        let l = self.layout();
        for table in [&l.values_table, &l.split_values_table] {
            match field {
                Some(field) => tx.execute(
                    &format!("DELETE FROM {table} WHERE entity_id = ?1 AND field_name = ?2"),
                    params![id.as_str(), field],
                )?,
                None => tx.execute(
                    &format!("DELETE FROM {table} WHERE entity_id = ?1"),
                    params![id.as_str()],
                )?,
            };
        }
        Ok(())
    }

    fn insert_field(
        &self,
        tx: &Transaction<'_>,
        id: &EntityId,
        name: &str,
        value: &FieldValue,
    ) -> Result<()> {
        let l = self.layout();
        let mut insert = tx.prepare_cached(&format!(
            "INSERT INTO {} (entity_id, field_name, field_value, field_value_transformed, value_position)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            l.values_table
        ))?;
        for (position, item) in value.values(name, self.keyword_separator).iter().enumerate() {
            insert.execute(params![
                id.as_str(),
                name,
                item,
                latex_to_unicode(item),
                position as i64
            ])?;
        }

        let mut split = tx.prepare_cached(&format!(
            "INSERT INTO {} (entity_id, field_name, field_value, field_value_transformed)
             VALUES (?1, ?2, ?3, ?4)",
            l.split_values_table
        ))?;
        for person in value.person_names(name) {
            split.execute(params![id.as_str(), name, person, latex_to_unicode(&person)])?;
        }
        Ok(())
    }

    fn upsert_hash(&self, tx: &Transaction<'_>, entity: &Entity) -> Result<()> {
        tx.execute(
            &format!(
                "INSERT INTO {} (entity_id, content_hash) VALUES (?1, ?2)
                 ON CONFLICT(entity_id) DO UPDATE SET content_hash = excluded.content_hash",
                self.layout().entities_table
            ),
            params![entity.id.as_str(), entity.content_hash()],
        )?;
        Ok(())
    }

    fn delete_entity(&self, tx: &Transaction<'_>, id: &EntityId) -> Result<()> {
        let l = self.layout();
        self.delete_rows(tx, id, None)?;
        tx.execute(
            &format!("DELETE FROM {} WHERE entity_id = ?1", l.entities_table),
            params![id.as_str()],
        )?;
        Ok(())
    }

    /// Write `entities` in one transaction, checking `cancel` between them.
    fn write_batch<'e>(
        &self,
        conn: &mut PooledConnection,
        entities: impl IntoIterator<Item = &'e Entity>,
        cancel: &CancellationToken,
        report: &mut IndexReport,
    ) -> Result<()> {
        let tx = conn.transaction()?;
        for entity in entities {
            if cancel.is_cancelled() {
                tx.commit()?;
                return Err(RefIndexError::Cancelled);
            }
            self.write_entity(&tx, entity)?;
            report.processed += 1;
            report.entity_ids.push(entity.id.clone());
        }
        tx.commit()?;
        Ok(())
    }

    fn clear(&self, conn: &mut PooledConnection) -> Result<()> {
        let l = self.layout();
        let tx = conn.transaction()?;
        tx.execute(&format!("DELETE FROM {}", l.values_table), [])?;
        tx.execute(&format!("DELETE FROM {}", l.split_values_table), [])?;
        tx.execute(&format!("DELETE FROM {}", l.entities_table), [])?;
        tx.commit()?;
        Ok(())
    }

    fn indexed_hashes(&self, conn: &PooledConnection) -> Result<HashMap<String, String>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT entity_id, content_hash FROM {}",
            self.layout().entities_table
        ))?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut hashes = HashMap::new();
        for row in rows {
            let (id, hash): (String, String) = row?;
            hashes.insert(id, hash);
        }
        Ok(hashes)
    }
}

impl Indexer for FieldIndexer {
    fn backend(&self) -> Backend {
        Backend::Structured
    }

    fn state(&self) -> IndexerState {
        if self.closed.load(Ordering::SeqCst) {
            IndexerState::Closed
        } else if self.engine.is_available() {
            IndexerState::Writable
        } else {
            IndexerState::Unavailable
        }
    }

    fn add_to_index(&self, entities: &[Entity], cancel: &CancellationToken) -> Result<IndexReport> {
        let Some(mut conn) = self.conn() else {
            debug!("Engine unavailable, dropping field indexing of {} entities", entities.len());
            return Ok(IndexReport::dropped(Backend::Structured, entities));
        };
        let mut report = IndexReport::new(Backend::Structured);
        self.write_batch(&mut conn, entities, cancel, &mut report)?;
        debug!("Indexed fields of {} entities", report.processed);
        Ok(report)
    }

    fn remove_from_index(&self, entities: &[Entity]) -> Result<IndexReport> {
        let Some(mut conn) = self.conn() else {
            debug!("Engine unavailable, dropping field removal of {} entities", entities.len());
            return Ok(IndexReport::dropped(Backend::Structured, entities));
        };
        let mut report = IndexReport::new(Backend::Structured);
        let tx = conn.transaction()?;
        for entity in entities {
            self.delete_entity(&tx, &entity.id)?;
            report.processed += 1;
            report.entity_ids.push(entity.id.clone());
        }
        tx.commit()?;
        Ok(report)
    }

    fn update_entry(
        &self,
        entity: &Entity,
        change: &FieldChange,
        _cancel: &CancellationToken,
    ) -> Result<IndexReport> {
        let Some(mut conn) = self.conn() else {
            debug!("Engine unavailable, dropping field update of {}", entity.id);
            return Ok(IndexReport::dropped(Backend::Structured, std::slice::from_ref(entity)));
        };
        let tx = conn.transaction()?;
        self.delete_rows(&tx, &entity.id, Some(&change.field))?;
        if let Some(value) = &change.new_value {
            self.insert_field(&tx, &entity.id, &change.field, value)?;
        }
        self.upsert_hash(&tx, entity)?;
        tx.commit()?;

        let mut report = IndexReport::new(Backend::Structured);
        report.processed = 1;
        report.entity_ids.push(entity.id.clone());
        Ok(report)
    }

    fn rebuild_index(&self, entities: &[Entity], cancel: &CancellationToken) -> Result<IndexReport> {
        let Some(mut conn) = self.conn() else {
            debug!("Engine unavailable, skipping field index rebuild");
            return Ok(IndexReport::dropped(Backend::Structured, entities));
        };
        self.clear(&mut conn)?;
        let mut report = IndexReport::new(Backend::Structured);
        self.write_batch(&mut conn, entities, cancel, &mut report)?;
        info!("Rebuilt field index with {} entities", report.processed);
        Ok(report)
    }

    fn sync_index(&self, entities: &[Entity], cancel: &CancellationToken) -> Result<IndexReport> {
        let Some(mut conn) = self.conn() else {
            debug!("Engine unavailable, skipping field index sync");
            return Ok(IndexReport::dropped(Backend::Structured, entities));
        };
        let indexed = self.indexed_hashes(&conn)?;
        let mut report = IndexReport::new(Backend::Structured);

        let current: HashSet<&str> = entities.iter().map(|e| e.id.as_str()).collect();
        let stale: Vec<EntityId> = indexed
            .keys()
            .filter(|id| !current.contains(id.as_str()))
            .map(|id| EntityId::from(id.as_str()))
            .collect();
        if !stale.is_empty() {
            let tx = conn.transaction()?;
            for id in &stale {
                self.delete_entity(&tx, id)?;
            }
            tx.commit()?;
            report.processed += stale.len();
            report.entity_ids.extend(stale);
        }

        let changed: Vec<&Entity> = entities
            .iter()
            .filter(|e| indexed.get(e.id.as_str()) != Some(&e.content_hash()))
            .collect();
        report.skipped = entities.len() - changed.len();
        self.write_batch(&mut conn, changed, cancel, &mut report)?;
        debug!(
            "Synced field index: {} written or removed, {} unchanged",
            report.processed, report.skipped
        );
        Ok(report)
    }

    fn remove_all_from_index(&self) -> Result<IndexReport> {
        let Some(mut conn) = self.conn() else {
            return Ok(IndexReport::new(Backend::Structured));
        };
        self.clear(&mut conn)?;
        Ok(IndexReport::new(Backend::Structured))
    }

    fn stats(&self) -> Result<IndexStats> {
        let (entity_count, row_count) = match self.conn() {
            Some(conn) => {
                let l = self.layout();
                let entities: i64 = conn.query_row(
                    &format!("SELECT count(*) FROM {}", l.entities_table),
                    [],
                    |row| row.get(0),
                )?;
                let rows: i64 = conn.query_row(
                    &format!("SELECT count(*) FROM {}", l.values_table),
                    [],
                    |row| row.get(0),
                )?;
                (entities as usize, rows as usize)
            }
            None => (0, 0),
        };
        Ok(IndexStats {
            backend: Backend::Structured,
            state: self.state(),
            entity_count,
            row_count,
        })
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl Searcher for FieldIndexer {
    fn search(&self, query: &CompiledQuery) -> Result<Vec<BackendHit>> {
        if query.backend != Backend::Structured {
            return Err(RefIndexError::Other(format!(
                "field index cannot run a {} query",
                query.backend
            )));
        }
        let Some(conn) = self.conn() else {
            debug!("Engine unavailable, structured search returns no hits");
            return Ok(Vec::new());
        };
        let mut stmt = conn.prepare(&query.sql)?;
        let rows = stmt.query_map(params_from_iter(query.params.iter()), |row| {
            row.get::<_, String>(0)
        })?;
        let mut hits = Vec::new();
        for row in rows {
            hits.push(BackendHit {
                entity_id: EntityId::from(row?),
                document: None,
            });
        }
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineOptions;
    use crate::query::{parse_query, QueryCompiler, QueryNode, SearchFlags};
    use tempfile::TempDir;

    async fn indexer(dir: &TempDir) -> (Arc<EngineSupervisor>, FieldIndexer) {
        let engine = Arc::new(EngineSupervisor::new(EngineOptions::in_dir(dir.path())));
        engine.start().await;
        let indexer = FieldIndexer::new(engine.clone(), ',');
        (engine, indexer)
    }

    fn search(indexer: &FieldIndexer, engine: &EngineSupervisor, query: &str) -> Vec<String> {
        let ast = parse_query(query, SearchFlags::default()).unwrap();
        let compiled = QueryCompiler::new(engine.layout().clone())
            .with_trigram(engine.capabilities().trigram)
            .compile(&ast, Backend::Structured)
            .unwrap();
        indexer
            .search(&compiled)
            .unwrap()
            .into_iter()
            .map(|hit| hit.entity_id.to_string())
            .collect()
    }

    fn euler() -> Entity {
        Entity::new(1u64)
            .with_field("title", "Graph Theory")
            .with_field("author", "Euler")
            .with_field("keywords", "bridges, topology")
    }

    #[tokio::test]
    async fn test_add_and_search() {
        let dir = TempDir::new().unwrap();
        let (engine, indexer) = indexer(&dir).await;
        let token = CancellationToken::new();

        let report = indexer.add_to_index(&[euler()], &token).unwrap();
        assert_eq!(report.processed, 1);

        assert_eq!(search(&indexer, &engine, "author:Euler"), vec!["1"]);
        assert_eq!(search(&indexer, &engine, "keywords==topology"), vec!["1"]);
        assert!(search(&indexer, &engine, "author:Gauss").is_empty());

        let stats = indexer.stats().unwrap();
        assert_eq!(stats.entity_count, 1);
        assert_eq!(stats.row_count, 4);
    }

    #[tokio::test]
    async fn test_latex_values_and_person_names_match() {
        let dir = TempDir::new().unwrap();
        let (engine, indexer) = indexer(&dir).await;
        let token = CancellationToken::new();
        let record = Entity::new(7u64)
            .with_field("title", r#"Stra{\ss}en und Br{\"u}cken"#)
            .with_field("author", r#"M{\"u}ller, Hans and Robertson and Seymour"#);
        indexer.add_to_index(&[record], &token).unwrap();

        assert_eq!(search(&indexer, &engine, "author:Müller"), vec!["7"]);
        assert_eq!(search(&indexer, &engine, "title:brücken"), vec!["7"]);
        assert_eq!(search(&indexer, &engine, "title:Straßen"), vec!["7"]);
        assert_eq!(search(&indexer, &engine, "author==Seymour"), vec!["7"]);
        assert_eq!(search(&indexer, &engine, "author==\"Hans Müller\""), vec!["7"]);
        assert_eq!(search(&indexer, &engine, "author=~^Robertson$"), vec!["7"]);
        assert_eq!(search(&indexer, &engine, "author=~^Hans"), vec!["7"]);

        let change = FieldChange::new("author", None, Some("Gauss".into()));
        let edited = Entity::new(7u64).with_field("author", "Gauss");
        indexer.update_entry(&edited, &change, &token).unwrap();
        assert!(search(&indexer, &engine, "author=~^Robertson$").is_empty());
        assert_eq!(search(&indexer, &engine, "author==Gauss"), vec!["7"]);
    }

    #[tokio::test]
    async fn test_update_entry_replaces_one_field() {
        let dir = TempDir::new().unwrap();
        let (engine, indexer) = indexer(&dir).await;
        let token = CancellationToken::new();
        indexer.add_to_index(&[euler()], &token).unwrap();

        let mut edited = euler();
        edited.set_field("author", "Gauss");
        let change = FieldChange::new("author", Some("Euler".into()), Some("Gauss".into()));
        indexer.update_entry(&edited, &change, &token).unwrap();

        assert!(search(&indexer, &engine, "author:Euler").is_empty());
        assert_eq!(search(&indexer, &engine, "author:Gauss"), vec!["1"]);
        assert_eq!(search(&indexer, &engine, "title:graph"), vec!["1"]);
    }

    #[tokio::test]
    async fn test_sync_reconciles_by_hash() {
        let dir = TempDir::new().unwrap();
        let (engine, indexer) = indexer(&dir).await;
        let token = CancellationToken::new();
        let other = Entity::new(2u64).with_field("title", "Number Theory");
        indexer.add_to_index(&[euler(), other], &token).unwrap();

        let mut edited = euler();
        edited.set_field("title", "Seven Bridges");
        let report = indexer.sync_index(&[edited], &token).unwrap();

        // Entity 2 removed, entity 1 rewritten.
        assert_eq!(report.processed, 2);
        assert!(search(&indexer, &engine, "title:number").is_empty());
        assert_eq!(search(&indexer, &engine, "title:bridges"), vec!["1"]);

        let again = indexer.sync_index(&[{
            let mut e = euler();
            e.set_field("title", "Seven Bridges");
            e
        }], &token).unwrap();
        assert_eq!(again.processed, 0);
        assert_eq!(again.skipped, 1);
    }

    #[tokio::test]
    async fn test_cancelled_batch_stops() {
        let dir = TempDir::new().unwrap();
        let (_engine, indexer) = indexer(&dir).await;
        let token = CancellationToken::new();
        token.cancel();

        let err = indexer.add_to_index(&[euler()], &token).unwrap_err();
        assert!(matches!(err, RefIndexError::Cancelled));
    }

    #[tokio::test]
    async fn test_unavailable_engine_drops_work() {
        let dir = TempDir::new().unwrap();
        // Never started.
        let engine = Arc::new(EngineSupervisor::new(EngineOptions::in_dir(dir.path())));
        let indexer = FieldIndexer::new(engine.clone(), ',');
        let token = CancellationToken::new();

        let report = indexer.add_to_index(&[euler()], &token).unwrap();
        assert_eq!(report.processed, 0);
        assert_eq!(report.skipped, 1);
        assert_eq!(indexer.state(), IndexerState::Unavailable);

        let compiled = QueryCompiler::new(TableLayout::default())
            .compile(&QueryNode::comparison("author", "Euler"), Backend::Structured)
            .unwrap();
        assert!(indexer.search(&compiled).unwrap().is_empty());
    }
}

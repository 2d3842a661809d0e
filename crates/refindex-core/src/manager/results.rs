//! Merged search output.

use crate::index::{BackendHit, DocumentHit};
use crate::model::EntityId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One matching entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub entity_id: EntityId,
    /// Whether the structured fields matched.
    pub field_match: bool,
    /// Matching pages of linked documents.
    pub documents: Vec<DocumentHit>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResults {
    pub query: String,
    pub hits: Vec<SearchHit>,
    pub elapsed_ms: u64,
}

impl SearchResults {
    /// Union of backend hits, one [`SearchHit`] per entity in id order.
    pub fn merge(
        query: impl Into<String>,
        structured: Vec<BackendHit>,
        fulltext: Vec<BackendHit>,
        elapsed_ms: u64,
    ) -> Self {
        let mut merged: BTreeMap<EntityId, SearchHit> = BTreeMap::new();
        for hit in structured.into_iter().chain(fulltext) {
            let entry = merged
                .entry(hit.entity_id.clone())
                .or_insert_with(|| SearchHit {
                    entity_id: hit.entity_id.clone(),
                    field_match: false,
                    documents: Vec::new(),
                });
            match hit.document {
                Some(document) => entry.documents.push(document),
                None => entry.field_match = true,
            }
        }
        let hits = merged
            .into_values()
            .map(|mut hit| {
                hit.documents.sort();
                hit.documents.dedup();
                hit
            })
            .collect();
        Self {
            query: query.into(),
            hits,
            elapsed_ms,
        }
    }

    pub fn empty(query: impl Into<String>) -> Self {
        Self::merge(query, Vec::new(), Vec::new(), 0)
    }

    pub fn entity_ids(&self) -> Vec<EntityId> {
        self.hits.iter().map(|hit| hit.entity_id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }
}

use crate::config::FieldNames;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Stable identity of a record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<u64> for EntityId {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

/// Value of one field. Multi-valued fields may arrive either as a list or as
/// a separator-joined string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    List(Vec<String>),
}

impl FieldValue {
    /// Row values for the structured index.
    ///
    /// `keywords` and `groups` text is split on `keyword_separator`, `file`
    /// text on `;`. Empty items are dropped.
    pub fn values(&self, field: &str, keyword_separator: char) -> Vec<String> {
        match self {
            FieldValue::List(items) => items
                .iter()
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect(),
            FieldValue::Text(text) => match field {
                FieldNames::KEYWORDS | FieldNames::GROUPS => split_values(text, keyword_separator),
                FieldNames::FILE => split_values(text, ';'),
                _ => vec![text.clone()],
            },
        }
    }
}

impl FieldValue {
    /// Individual names of a person field, for exact and regex matching.
    ///
    /// `Euler, Leonhard and Lagrange` yields `Euler, Leonhard`,
    /// `Leonhard Euler` and `Lagrange`. Other fields yield nothing.
    pub fn person_names(&self, field: &str) -> Vec<String> {
        if !FieldNames::is_person_field(field) {
            return Vec::new();
        }
        let joined = match self {
            FieldValue::Text(text) => text.clone(),
            FieldValue::List(items) => items.join(" and "),
        };
        let mut names = Vec::new();
        for name in split_on_and(&joined) {
            if let Some((last, first)) = name.split_once(',') {
                let (last, first) = (last.trim(), first.trim());
                names.push(name.clone());
                if !first.is_empty() && !last.is_empty() {
                    names.push(format!("{first} {last}"));
                }
            } else {
                names.push(name);
            }
        }
        names
    }
}

/// Split on the word `and`, case-insensitively.
fn split_on_and(text: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for word in text.split_whitespace() {
        if word.eq_ignore_ascii_case("and") {
            names.push(current.join(" "));
            current.clear();
        } else {
            current.push(word);
        }
    }
    names.push(current.join(" "));
    names.retain(|name| !name.is_empty());
    names
}

fn split_values(text: &str, separator: char) -> Vec<String> {
    text.split(separator)
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<Vec<String>> for FieldValue {
    fn from(value: Vec<String>) -> Self {
        FieldValue::List(value)
    }
}

/// A document attached to a record through its `file` field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LinkedFile {
    /// Path or URL as written in the record.
    pub link: String,
    pub file_type: String,
}

impl LinkedFile {
    /// Parse one `file` item. Accepts `description:link:type` triples as well
    /// as bare paths.
    pub fn parse(item: &str) -> Option<Self> {
        let item = item.trim();
        if item.is_empty() {
            return None;
        }
        let parts = split_unescaped(item, ':');
        // description:link:type, where link may itself contain a drive colon.
        if parts.len() >= 3 && !is_online_scheme(&parts[0]) {
            let link = parts[1..parts.len() - 1].join(":");
            if !link.is_empty() {
                return Some(Self {
                    link,
                    file_type: parts[parts.len() - 1].to_string(),
                });
            }
        }
        let file_type = std::path::Path::new(item)
            .extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        Some(Self {
            link: item.to_string(),
            file_type,
        })
    }

    pub fn is_online(&self) -> bool {
        self.link
            .split_once("://")
            .map(|(scheme, _)| is_online_scheme(scheme))
            .unwrap_or(false)
    }
}

/// Split on `separator`, treating `\<separator>` as a literal character.
fn split_unescaped(text: &str, separator: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' && chars.peek() == Some(&separator) {
            current.push(separator);
            chars.next();
        } else if c == separator {
            parts.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    parts.push(current);
    parts
}

fn is_online_scheme(scheme: &str) -> bool {
    matches!(
        scheme.to_ascii_lowercase().as_str(),
        "http" | "https" | "ftp"
    )
}

/// A bibliographic record: an id plus named fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldValue>,
}

impl Entity {
    pub fn new(id: impl Into<EntityId>) -> Self {
        Self {
            id: id.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style field setter; names are lower-cased.
    pub fn with_field(mut self, name: &str, value: impl Into<FieldValue>) -> Self {
        self.set_field(name, value);
        self
    }

    pub fn set_field(&mut self, name: &str, value: impl Into<FieldValue>) {
        self.fields.insert(name.to_lowercase(), value.into());
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(&name.to_lowercase())
    }

    /// Local documents linked from the `file` field. Online links are skipped.
    pub fn linked_files(&self) -> Vec<LinkedFile> {
        self.field(FieldNames::FILE)
            .map(|value| value.values(FieldNames::FILE, ';'))
            .unwrap_or_default()
            .iter()
            .filter_map(|item| LinkedFile::parse(item))
            .filter(|file| !file.is_online())
            .collect()
    }

    /// Digest of the record's fields, used to detect changed records.
    pub fn content_hash(&self) -> String {
        let canonical = serde_json::to_vec(&self.fields).unwrap_or_default();
        blake3::hash(&canonical).to_hex().to_string()
    }
}

/// One field edit on a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub old_value: Option<FieldValue>,
    pub new_value: Option<FieldValue>,
}

impl FieldChange {
    pub fn new(
        field: impl Into<String>,
        old_value: Option<FieldValue>,
        new_value: Option<FieldValue>,
    ) -> Self {
        Self {
            field: field.into().to_lowercase(),
            old_value,
            new_value,
        }
    }

    pub fn is_file_change(&self) -> bool {
        self.field == FieldNames::FILE
    }
}

/// Change notification emitted by the record store.
#[derive(Debug, Clone)]
pub enum EntityChange {
    Added(Vec<Entity>),
    Removed(Vec<Entity>),
    FieldChanged { entity: Entity, change: FieldChange },
}

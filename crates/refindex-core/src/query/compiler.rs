//! [`QueryNode`] to backend SQL.
//!
//! Two dialects come out of one tree:
//!
//! - **Structured**: a chain of CTEs over the `(entity_id, field_name,
//!   field_value, field_value_transformed)` table. Each leaf is one CTE
//!   selecting matching entity ids; AND/OR become INTERSECT/UNION and NOT is
//!   the complement against the entity table. A value matches when either its
//!   literal text or its LaTeX-free form does. Exact and regex leaves also
//!   consult the split person-name table.
//! - **FullText**: a boolean expression evaluated per indexed document page,
//!   using FTS5 MATCH for token lookups.
//!
//! Every user-supplied value is bound as a parameter.

use super::ast::{strip_quotes, Comparison, ComparisonOperator, QueryNode, SearchTerm, TermFlags};
use crate::config::FieldNames;
use crate::error::{RefIndexError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Which backend a query targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Backend {
    Structured,
    FullText,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Structured => write!(f, "structured"),
            Backend::FullText => write!(f, "full-text"),
        }
    }
}

/// Table names the compiled SQL refers to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableLayout {
    pub entities_table: String,
    pub values_table: String,
    pub trigram_table: String,
    /// Person names split out of `author` and `editor`.
    pub split_values_table: String,
    pub documents_table: String,
}

impl Default for TableLayout {
    fn default() -> Self {
        Self {
            entities_table: "entities".to_string(),
            values_table: "field_values".to_string(),
            trigram_table: "field_values_trigram".to_string(),
            split_values_table: "field_values_split".to_string(),
            documents_table: "documents".to_string(),
        }
    }
}

/// Executable SQL for one backend.
///
/// Structured queries yield one `entity_id` column. Full-text queries yield
/// `entity_id, path, page`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledQuery {
    pub backend: Backend,
    pub sql: String,
    pub params: Vec<String>,
}

/// Both dialects of one tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledQueryPair {
    pub structured: CompiledQuery,
    pub fulltext: CompiledQuery,
}

/// How a leaf's value is compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchCategory {
    Contains { case_sensitive: bool },
    Exact { case_sensitive: bool },
    Regex { case_sensitive: bool },
}

impl MatchCategory {
    /// Combine a leaf's operator and flags.
    pub fn resolve(operator: ComparisonOperator, flags: TermFlags) -> std::result::Result<Self, String> {
        let case_sensitive =
            flags.case_sensitive || operator == ComparisonOperator::CaseSensitiveEqual;
        let regex = flags.regular_expression || operator == ComparisonOperator::RegexMatch;
        match (operator, regex, flags.exact_match) {
            (ComparisonOperator::NotEqual, _, _) => {
                Err("not-equal must be expressed as NOT(field = value)".to_string())
            }
            (_, true, true) => {
                Err("regular expression and exact match cannot be combined".to_string())
            }
            (_, true, false) => Ok(MatchCategory::Regex { case_sensitive }),
            (_, false, true) => Ok(MatchCategory::Exact { case_sensitive }),
            (_, false, false) => Ok(MatchCategory::Contains { case_sensitive }),
        }
    }
}

/// What a leaf's field name refers to after normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldTarget {
    /// Every field except `groups`.
    Any,
    Named(String),
    EntityId,
    /// Linked document text.
    Content,
}

impl FieldTarget {
    pub fn normalize(field: &str) -> Self {
        let lower = field.trim().to_lowercase();
        match lower.as_str() {
            "" | FieldNames::ANY | "anyfield" | "default" => FieldTarget::Any,
            "key" => FieldTarget::Named(FieldNames::CITATION_KEY.to_string()),
            "anykeyword" => FieldTarget::Named(FieldNames::KEYWORDS.to_string()),
            "id" | "entryid" => FieldTarget::EntityId,
            FieldNames::CONTENT | "fulltext" => FieldTarget::Content,
            _ => FieldTarget::Named(lower),
        }
    }
}

/// A leaf with its field, value and category resolved.
struct Leaf {
    target: FieldTarget,
    value: String,
    category: MatchCategory,
}

impl Leaf {
    fn term(term: &SearchTerm) -> Result<Self> {
        Self::resolve("", ComparisonOperator::Equal, &term.value, term.flags)
    }

    fn comparison(cmp: &Comparison) -> Result<Self> {
        Self::resolve(&cmp.field, cmp.operator, &cmp.value, cmp.flags)
    }

    fn resolve(
        field: &str,
        operator: ComparisonOperator,
        raw_value: &str,
        flags: TermFlags,
    ) -> Result<Self> {
        let value = strip_quotes(raw_value);
        let category =
            MatchCategory::resolve(operator, flags).map_err(|reason| invalid(raw_value, reason))?;
        if let MatchCategory::Regex { case_sensitive } = category {
            Regex::new(&regex_pattern(&value, case_sensitive)).map_err(|e| {
                invalid(raw_value, format!("invalid regular expression: {}", e))
            })?;
        }
        Ok(Self {
            target: FieldTarget::normalize(field),
            value,
            category,
        })
    }
}

pub struct QueryCompiler {
    layout: TableLayout,
    trigram: bool,
}

impl QueryCompiler {
    pub fn new(layout: TableLayout) -> Self {
        Self {
            layout,
            trigram: false,
        }
    }

    /// Let case-insensitive contains matches pre-filter through the trigram
    /// mirror.
    pub fn with_trigram(mut self, enabled: bool) -> Self {
        self.trigram = enabled;
        self
    }

    pub fn layout(&self) -> &TableLayout {
        &self.layout
    }

    pub fn compile(&self, node: &QueryNode, backend: Backend) -> Result<CompiledQuery> {
        match backend {
            Backend::Structured => self.compile_structured(node),
            Backend::FullText => self.compile_fulltext(node),
        }
    }

    pub fn compile_pair(&self, node: &QueryNode) -> Result<CompiledQueryPair> {
        Ok(CompiledQueryPair {
            structured: self.compile_structured(node)?,
            fulltext: self.compile_fulltext(node)?,
        })
    }

    // ----------------------------------------------------------------------
    // Structured dialect
    // ----------------------------------------------------------------------

    fn compile_structured(&self, node: &QueryNode) -> Result<CompiledQuery> {
        let mut chain = CteChain::default();
        let root = self.structured_node(node, &mut chain)?;
        let sql = format!(
            "WITH {} SELECT DISTINCT entity_id FROM cte{} ORDER BY entity_id",
            chain.ctes.join(", "),
            root
        );
        Ok(CompiledQuery {
            backend: Backend::Structured,
            sql,
            params: chain.params,
        })
    }

    fn structured_node(&self, node: &QueryNode, chain: &mut CteChain) -> Result<usize> {
        match node {
            QueryNode::Term(term) => self.structured_leaf(&Leaf::term(term)?, chain),
            QueryNode::Comparison(cmp) => self.structured_leaf(&Leaf::comparison(cmp)?, chain),
            QueryNode::And(a, b) => {
                let (a, b) = (self.structured_node(a, chain)?, self.structured_node(b, chain)?);
                Ok(chain.push(
                    format!("SELECT entity_id FROM cte{a} INTERSECT SELECT entity_id FROM cte{b}"),
                    vec![],
                ))
            }
            QueryNode::Or(a, b) => {
                let (a, b) = (self.structured_node(a, chain)?, self.structured_node(b, chain)?);
                Ok(chain.push(
                    format!("SELECT entity_id FROM cte{a} UNION SELECT entity_id FROM cte{b}"),
                    vec![],
                ))
            }
            QueryNode::Not(inner) => {
                let inner = self.structured_node(inner, chain)?;
                Ok(chain.push(
                    format!(
                        "SELECT entity_id FROM {} WHERE entity_id NOT IN (SELECT entity_id FROM cte{inner})",
                        self.layout.entities_table
                    ),
                    vec![],
                ))
            }
            QueryNode::Group(inner) => self.structured_node(inner, chain),
        }
    }

    fn structured_leaf(&self, leaf: &Leaf, chain: &mut CteChain) -> Result<usize> {
        let l = &self.layout;
        let mut params = Vec::new();

        let field_cond = match &leaf.target {
            FieldTarget::Content => {
                return Ok(chain.push(
                    format!("SELECT entity_id FROM {} WHERE 0", l.entities_table),
                    vec![],
                ));
            }
            FieldTarget::EntityId => {
                let cond = value_condition("main.entity_id", &leaf.value, leaf.category, &mut params);
                return Ok(chain.push(
                    format!(
                        "SELECT main.entity_id AS entity_id FROM {} AS main WHERE {}",
                        l.entities_table, cond
                    ),
                    params,
                ));
            }
            FieldTarget::Any => "field_name <> ?",
            FieldTarget::Named(_) => "field_name = ?",
        };
        let field_param = match &leaf.target {
            FieldTarget::Named(name) => name.clone(),
            _ => FieldNames::GROUPS.to_string(),
        };

        params.push(field_param.clone());
        let mut conds = vec![
            format!("main.{field_cond}"),
            literal_or_transformed("main", leaf, &mut params),
        ];

        let use_trigram = self.trigram
            && matches!(leaf.category, MatchCategory::Contains { case_sensitive: false })
            && leaf.value.is_ascii()
            && leaf.value.chars().count() >= 3;
        if use_trigram {
            conds.push(format!(
                "main.id IN (SELECT rowid FROM {t} WHERE {t} MATCH ?)",
                t = l.trigram_table
            ));
            params.push(fts5_phrase(&leaf.value));
        }

        let mut body = format!(
            "SELECT main.entity_id AS entity_id FROM {} AS main WHERE {}",
            l.values_table,
            conds.join(" AND ")
        );

        // Exact and regex matches also see individual person names.
        if !matches!(leaf.category, MatchCategory::Contains { .. }) {
            params.push(field_param);
            let split_cond = literal_or_transformed("split", leaf, &mut params);
            body.push_str(&format!(
                " UNION SELECT split.entity_id AS entity_id FROM {} AS split WHERE split.{} AND {}",
                l.split_values_table, field_cond, split_cond
            ));
        }

        Ok(chain.push(body, params))
    }

    // ----------------------------------------------------------------------
    // Full-text dialect
    // ----------------------------------------------------------------------

    fn compile_fulltext(&self, node: &QueryNode) -> Result<CompiledQuery> {
        let mut params = Vec::new();
        let predicate = self.fulltext_node(node, &mut params)?;
        let sql = format!(
            "SELECT d.entity_id, d.path, d.page FROM {} AS d WHERE {} ORDER BY d.entity_id, d.path, d.page",
            self.layout.documents_table, predicate
        );
        Ok(CompiledQuery {
            backend: Backend::FullText,
            sql,
            params,
        })
    }

    fn fulltext_node(&self, node: &QueryNode, params: &mut Vec<String>) -> Result<String> {
        Ok(match node {
            QueryNode::Term(term) => self.fulltext_leaf(&Leaf::term(term)?, params),
            QueryNode::Comparison(cmp) => self.fulltext_leaf(&Leaf::comparison(cmp)?, params),
            QueryNode::And(a, b) => {
                let a = self.fulltext_node(a, params)?;
                let b = self.fulltext_node(b, params)?;
                format!("({a} AND {b})")
            }
            QueryNode::Or(a, b) => {
                let a = self.fulltext_node(a, params)?;
                let b = self.fulltext_node(b, params)?;
                format!("({a} OR {b})")
            }
            QueryNode::Not(inner) => format!("(NOT {})", self.fulltext_node(inner, params)?),
            QueryNode::Group(inner) => format!("({})", self.fulltext_node(inner, params)?),
        })
    }

    fn fulltext_leaf(&self, leaf: &Leaf, params: &mut Vec<String>) -> String {
        match &leaf.target {
            FieldTarget::Named(_) => "0".to_string(),
            FieldTarget::EntityId => value_condition("d.entity_id", &leaf.value, leaf.category, params),
            FieldTarget::Any | FieldTarget::Content => {
                let has_tokens = leaf.value.chars().any(char::is_alphanumeric);
                match leaf.category {
                    MatchCategory::Regex { .. } => {
                        value_condition("d.content", &leaf.value, leaf.category, params)
                    }
                    _ if !has_tokens => {
                        value_condition("d.content", &leaf.value, leaf.category, params)
                    }
                    MatchCategory::Contains { case_sensitive } => {
                        let fts = self.fts_match(format!("content : {} *", fts5_phrase(&leaf.value)), params);
                        if case_sensitive {
                            params.push(leaf.value.clone());
                            format!("({fts} AND instr(d.content, ?) > 0)")
                        } else {
                            fts
                        }
                    }
                    MatchCategory::Exact { case_sensitive } => {
                        let fts = self.fts_match(format!("content : {}", fts5_phrase(&leaf.value)), params);
                        if case_sensitive {
                            params.push(exact_pattern(&leaf.value, true));
                            format!("({fts} AND d.content REGEXP ?)")
                        } else {
                            fts
                        }
                    }
                }
            }
        }
    }

    fn fts_match(&self, expression: String, params: &mut Vec<String>) -> String {
        params.push(expression);
        format!(
            "d.rowid IN (SELECT rowid FROM {t} WHERE {t} MATCH ?)",
            t = self.layout.documents_table
        )
    }
}

#[derive(Default)]
struct CteChain {
    ctes: Vec<String>,
    params: Vec<String>,
}

impl CteChain {
    fn push(&mut self, body: String, params: Vec<String>) -> usize {
        let index = self.ctes.len();
        self.ctes.push(format!("cte{index} AS ({body})"));
        self.params.extend(params);
        index
    }
}

/// Match against a row's literal value or its LaTeX-free form.
fn literal_or_transformed(table: &str, leaf: &Leaf, params: &mut Vec<String>) -> String {
    let literal = value_condition(&format!("{table}.field_value"), &leaf.value, leaf.category, params);
    let transformed = value_condition(
        &format!("{table}.field_value_transformed"),
        &leaf.value,
        leaf.category,
        params,
    );
    format!("({literal} OR {transformed})")
}

/// SQL condition comparing `expr` to `value` under `category`.
fn value_condition(
    expr: &str,
    value: &str,
    category: MatchCategory,
    params: &mut Vec<String>,
) -> String {
    match category {
        MatchCategory::Contains {
            case_sensitive: false,
        } => {
            params.push(format!("%{}%", escape_like(&value.to_lowercase())));
            format!("unicode_lower({expr}) LIKE ? ESCAPE '\\'")
        }
        MatchCategory::Contains {
            case_sensitive: true,
        } => {
            params.push(value.to_string());
            format!("instr({expr}, ?) > 0")
        }
        MatchCategory::Exact { case_sensitive } => {
            params.push(exact_pattern(value, case_sensitive));
            format!("{expr} REGEXP ?")
        }
        MatchCategory::Regex { case_sensitive } => {
            params.push(regex_pattern(value, case_sensitive));
            format!("{expr} REGEXP ?")
        }
    }
}

/// Whole-word match of `value`, bounded by non-word characters or the ends.
pub fn exact_pattern(value: &str, case_sensitive: bool) -> String {
    let flag = if case_sensitive { "" } else { "(?i)" };
    format!("{flag}(?:^|\\W){}(?:\\W|$)", regex::escape(value))
}

fn regex_pattern(value: &str, case_sensitive: bool) -> String {
    if case_sensitive {
        value.to_string()
    } else {
        format!("(?i){value}")
    }
}

/// Escape LIKE wildcards with `\`.
fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Quote a term as one FTS5 string, doubling embedded quotes.
pub fn fts5_phrase(term: &str) -> String {
    format!("\"{}\"", term.replace('"', "\"\""))
}

fn invalid(value: &str, reason: impl Into<String>) -> RefIndexError {
    RefIndexError::query_invalid(value, reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::ast::SearchFlags;
    use crate::query::parse_query;

    fn compiler() -> QueryCompiler {
        QueryCompiler::new(TableLayout::default())
    }

    fn structured(query: &str) -> CompiledQuery {
        let ast = parse_query(query, SearchFlags::default()).unwrap();
        compiler().compile(&ast, Backend::Structured).unwrap()
    }

    #[test]
    fn test_field_contains() {
        let q = structured("author:Euler");
        assert_eq!(
            q.sql,
            "WITH cte0 AS (SELECT main.entity_id AS entity_id FROM field_values AS main \
             WHERE main.field_name = ? AND (unicode_lower(main.field_value) LIKE ? ESCAPE '\\' \
             OR unicode_lower(main.field_value_transformed) LIKE ? ESCAPE '\\')) \
             SELECT DISTINCT entity_id FROM cte0 ORDER BY entity_id"
        );
        assert_eq!(q.params, vec!["author", "%euler%", "%euler%"]);
    }

    #[test]
    fn test_bare_term_searches_any_field_but_groups() {
        let q = structured("euler");
        assert!(q.sql.contains("main.field_name <> ?"));
        assert_eq!(q.params[0], "groups");
    }

    #[test]
    fn test_quotes_stripped() {
        let q = structured("title:\"Graph Theory\"");
        assert_eq!(q.params, vec!["title", "%graph theory%", "%graph theory%"]);
    }

    #[test]
    fn test_field_aliases() {
        assert_eq!(structured("key:euler1736").params[0], "citationkey");
        assert_eq!(structured("anykeyword:graphs").params[0], "keywords");
        assert!(structured("id:1").sql.contains("FROM entities AS main"));
    }

    #[test]
    fn test_categories() {
        assert!(structured("title=!Graph").sql.contains("instr(main.field_value, ?) > 0"));

        let exact = structured("title==Graph");
        assert!(exact.sql.contains("main.field_value REGEXP ?"));
        assert_eq!(exact.params[1], "(?i)(?:^|\\W)Graph(?:\\W|$)");

        let cs_exact = structured("title==!Graph");
        assert_eq!(cs_exact.params[1], "(?:^|\\W)Graph(?:\\W|$)");

        let regex = structured("title=~^Gr");
        assert_eq!(regex.params[1], "(?i)^Gr");
    }

    #[test]
    fn test_boolean_structure() {
        let q = structured("a AND NOT (b OR c)");
        assert!(q.sql.contains("SELECT entity_id FROM cte1 UNION SELECT entity_id FROM cte2"));
        assert!(q.sql.contains("WHERE entity_id NOT IN (SELECT entity_id FROM cte3)"));
        assert!(q.sql.contains("SELECT entity_id FROM cte0 INTERSECT SELECT entity_id FROM cte4"));
        assert!(q.sql.ends_with("FROM cte5 ORDER BY entity_id"));
        assert_eq!(q.params.len(), 9);
    }

    #[test]
    fn test_exact_and_regex_consult_split_names() {
        let exact = structured("author==Seymour");
        assert!(exact.sql.contains(
            "UNION SELECT split.entity_id AS entity_id FROM field_values_split AS split \
             WHERE split.field_name = ? AND (split.field_value REGEXP ? \
             OR split.field_value_transformed REGEXP ?)"
        ));
        assert_eq!(exact.params.len(), 6);
        assert_eq!(exact.params[3], "author");

        let any = structured("any=~Sey");
        assert!(any.sql.contains("WHERE split.field_name <> ?"));
        assert_eq!(any.params[3], "groups");

        assert!(!structured("author:Seymour").sql.contains("field_values_split"));
    }

    #[test]
    fn test_like_wildcards_escaped() {
        assert_eq!(structured("title:50%_off").params[1], "%50\\%\\_off%");
    }

    #[test]
    fn test_trigram_prefilter_only_for_long_ascii() {
        let c = compiler().with_trigram(true);
        let long = c.compile(&QueryNode::term("graph"), Backend::Structured).unwrap();
        assert!(long.sql.contains("field_values_trigram MATCH ?"));
        assert_eq!(long.params.last().unwrap(), "\"graph\"");

        let short = c.compile(&QueryNode::term("gr"), Backend::Structured).unwrap();
        assert!(!short.sql.contains("MATCH"));
        let unicode = c.compile(&QueryNode::term("Gödel"), Backend::Structured).unwrap();
        assert!(!unicode.sql.contains("MATCH"));
    }

    #[test]
    fn test_not_equal_operator_rejected() {
        let node = QueryNode::Comparison(Comparison {
            field: "title".into(),
            operator: ComparisonOperator::NotEqual,
            value: "x".into(),
            flags: TermFlags::default(),
        });
        for backend in [Backend::Structured, Backend::FullText] {
            let err = compiler().compile(&node, backend).unwrap_err();
            assert!(matches!(err, RefIndexError::QueryInvalid { .. }));
        }
    }

    #[test]
    fn test_regex_with_exact_rejected() {
        let node = QueryNode::comparison("title", "x").with_flags(TermFlags {
            case_sensitive: false,
            regular_expression: true,
            exact_match: true,
        });
        assert!(compiler().compile(&node, Backend::Structured).is_err());
    }

    #[test]
    fn test_invalid_regex_rejected() {
        let ast = parse_query("title=~\"(unclosed\"", SearchFlags::default()).unwrap();
        let err = compiler().compile(&ast, Backend::Structured).unwrap_err();
        assert!(matches!(err, RefIndexError::QueryInvalid { .. }));
    }

    #[test]
    fn test_fulltext_dialect() {
        let ast = parse_query("graph AND NOT title:x", SearchFlags::default()).unwrap();
        let q = compiler().compile(&ast, Backend::FullText).unwrap();
        assert_eq!(
            q.sql,
            "SELECT d.entity_id, d.path, d.page FROM documents AS d WHERE \
             (d.rowid IN (SELECT rowid FROM documents WHERE documents MATCH ?) AND (NOT 0)) \
             ORDER BY d.entity_id, d.path, d.page"
        );
        assert_eq!(q.params, vec!["content : \"graph\" *"]);
    }

    #[test]
    fn test_fulltext_exact_case_sensitive() {
        let ast = parse_query("content==!Euler", SearchFlags::default()).unwrap();
        let q = compiler().compile(&ast, Backend::FullText).unwrap();
        assert!(q.sql.contains("d.content REGEXP ?"));
        assert_eq!(q.params, vec!["content : \"Euler\"", "(?:^|\\W)Euler(?:\\W|$)"]);
    }

    #[test]
    fn test_pair_is_derived_from_one_tree() {
        let ast = parse_query("euler", SearchFlags::default()).unwrap();
        let pair = compiler().compile_pair(&ast).unwrap();
        assert_eq!(pair.structured.backend, Backend::Structured);
        assert_eq!(pair.fulltext.backend, Backend::FullText);
    }
}

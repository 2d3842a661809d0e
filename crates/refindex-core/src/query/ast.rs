//! Query syntax tree.
//!
//! Built once per query string and never mutated afterwards. Both backend
//! dialects are generated from the same tree.

use serde::{Deserialize, Serialize};

/// Caller-facing search switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchFlags {
    pub case_sensitive: bool,
    pub regular_expression: bool,
    /// Search linked document text as well as fields.
    pub fulltext: bool,
}

impl SearchFlags {
    pub fn case_sensitive(mut self, on: bool) -> Self {
        self.case_sensitive = on;
        self
    }

    pub fn regular_expression(mut self, on: bool) -> Self {
        self.regular_expression = on;
        self
    }

    pub fn fulltext(mut self, on: bool) -> Self {
        self.fulltext = on;
        self
    }
}

/// Matching switches attached to one leaf.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TermFlags {
    pub case_sensitive: bool,
    pub regular_expression: bool,
    pub exact_match: bool,
}

impl From<SearchFlags> for TermFlags {
    fn from(flags: SearchFlags) -> Self {
        Self {
            case_sensitive: flags.case_sensitive,
            regular_expression: flags.regular_expression,
            exact_match: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ComparisonOperator {
    Equal,
    CaseSensitiveEqual,
    RegexMatch,
    /// Never valid in a compiled tree; negation is `Not(Equal)`.
    NotEqual,
}

/// Unqualified search term.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchTerm {
    /// Raw text, surrounding quotes included if the user typed them.
    pub value: String,
    pub flags: TermFlags,
}

/// `field <op> value`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comparison {
    pub field: String,
    pub operator: ComparisonOperator,
    /// Raw text, surrounding quotes included if the user typed them.
    pub value: String,
    pub flags: TermFlags,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueryNode {
    Term(SearchTerm),
    Comparison(Comparison),
    And(Box<QueryNode>, Box<QueryNode>),
    Or(Box<QueryNode>, Box<QueryNode>),
    Not(Box<QueryNode>),
    Group(Box<QueryNode>),
}

impl QueryNode {
    pub fn term(value: impl Into<String>) -> Self {
        QueryNode::Term(SearchTerm {
            value: value.into(),
            flags: TermFlags::default(),
        })
    }

    pub fn comparison(field: impl Into<String>, value: impl Into<String>) -> Self {
        QueryNode::Comparison(Comparison {
            field: field.into(),
            operator: ComparisonOperator::Equal,
            value: value.into(),
            flags: TermFlags::default(),
        })
    }

    pub fn and(left: QueryNode, right: QueryNode) -> Self {
        QueryNode::And(Box::new(left), Box::new(right))
    }

    pub fn or(left: QueryNode, right: QueryNode) -> Self {
        QueryNode::Or(Box::new(left), Box::new(right))
    }

    pub fn negate(inner: QueryNode) -> Self {
        QueryNode::Not(Box::new(inner))
    }

    pub fn group(inner: QueryNode) -> Self {
        QueryNode::Group(Box::new(inner))
    }

    /// Set flags on every leaf of the tree.
    pub fn with_flags(mut self, flags: TermFlags) -> Self {
        self.visit_leaf_flags(&mut |leaf| *leaf = flags);
        self
    }

    fn visit_leaf_flags(&mut self, f: &mut dyn FnMut(&mut TermFlags)) {
        match self {
            QueryNode::Term(term) => f(&mut term.flags),
            QueryNode::Comparison(cmp) => f(&mut cmp.flags),
            QueryNode::And(a, b) | QueryNode::Or(a, b) => {
                a.visit_leaf_flags(f);
                b.visit_leaf_flags(f);
            }
            QueryNode::Not(inner) | QueryNode::Group(inner) => inner.visit_leaf_flags(f),
        }
    }
}

/// Renders the tree back in query syntax, parenthesizing every binary node.
impl std::fmt::Display for QueryNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryNode::Term(term) => f.write_str(&term.value),
            QueryNode::Comparison(cmp) => {
                let op = match (cmp.operator, cmp.flags.exact_match) {
                    (ComparisonOperator::Equal, false) => ":",
                    (ComparisonOperator::Equal, true) => "==",
                    (ComparisonOperator::CaseSensitiveEqual, false) => "=!",
                    (ComparisonOperator::CaseSensitiveEqual, true) => "==!",
                    (ComparisonOperator::RegexMatch, _) if cmp.flags.case_sensitive => "=~!",
                    (ComparisonOperator::RegexMatch, _) => "=~",
                    (ComparisonOperator::NotEqual, _) => "!=",
                };
                write!(f, "{}{}{}", cmp.field, op, cmp.value)
            }
            QueryNode::And(a, b) => write!(f, "({a} AND {b})"),
            QueryNode::Or(a, b) => write!(f, "({a} OR {b})"),
            QueryNode::Not(inner) => write!(f, "NOT {inner}"),
            QueryNode::Group(inner) => write!(f, "({inner})"),
        }
    }
}

/// Remove one pair of surrounding double quotes and unescape `\"`.
pub fn strip_quotes(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.len() >= 2 && trimmed.starts_with('"') && trimmed.ends_with('"') {
        trimmed[1..trimmed.len() - 1].replace("\\\"", "\"")
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_renders_query_syntax() {
        let node = QueryNode::and(
            QueryNode::comparison("author", "Euler"),
            QueryNode::negate(QueryNode::term("\"graph theory\"")),
        );
        assert_eq!(node.to_string(), "(author:Euler AND NOT \"graph theory\")");
    }

    #[test]
    fn test_strip_quotes() {
        assert_eq!(strip_quotes("\"Graph\""), "Graph");
        assert_eq!(strip_quotes("\"say \\\"hi\\\"\""), "say \"hi\"");
        assert_eq!(strip_quotes("plain"), "plain");
        assert_eq!(strip_quotes("\""), "\"");
    }

    #[test]
    fn test_with_flags_reaches_every_leaf() {
        let flags = TermFlags {
            case_sensitive: true,
            ..TermFlags::default()
        };
        let node = QueryNode::or(
            QueryNode::term("a"),
            QueryNode::negate(QueryNode::comparison("title", "b")),
        )
        .with_flags(flags);

        match node {
            QueryNode::Or(a, b) => {
                assert!(matches!(*a, QueryNode::Term(ref t) if t.flags.case_sensitive));
                match *b {
                    QueryNode::Not(inner) => {
                        assert!(matches!(*inner, QueryNode::Comparison(ref c) if c.flags.case_sensitive))
                    }
                    other => panic!("unexpected node {other:?}"),
                }
            }
            other => panic!("unexpected node {other:?}"),
        }
    }

    #[test]
    fn test_node_serializes_with_variant_name() {
        let json = serde_json::to_value(QueryNode::term("x")).unwrap();
        assert_eq!(json["term"]["value"], "x");
    }
}

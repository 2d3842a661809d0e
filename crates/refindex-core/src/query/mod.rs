//! Query language: syntax tree, parser and the two-dialect compiler.

mod ast;
mod compiler;
mod parser;

pub use ast::{
    strip_quotes, Comparison, ComparisonOperator, QueryNode, SearchFlags, SearchTerm, TermFlags,
};
pub use compiler::{
    exact_pattern, fts5_phrase, Backend, CompiledQuery, CompiledQueryPair, FieldTarget,
    MatchCategory, QueryCompiler, TableLayout,
};
pub use parser::parse_query;

//! Query string to [`QueryNode`].
//!
//! Grammar, loosest binding first:
//!
//! ```text
//! query      := or_expr
//! or_expr    := and_expr ("OR" and_expr)*
//! and_expr   := unary (["AND"] unary)*
//! unary      := "NOT" unary | primary
//! primary    := "(" or_expr ")" | field op value | value
//! op         := ":" | "CONTAINS" | "MATCHES" | ["!"] "=" ["=" | "~"] ["!"]
//! ```
//!
//! In a symbolic operator, a second `=` asks for an exact match, `~` for a
//! regular expression, a trailing `!` for case sensitivity and a leading `!`
//! negates the comparison: `!==!` is "not exactly, case-sensitively equal".
//!
//! Keywords are case-insensitive. Juxtaposed terms are joined with AND.

use super::ast::{Comparison, ComparisonOperator, QueryNode, SearchFlags, SearchTerm, TermFlags};
use crate::error::{RefIndexError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpKind {
    Contains,
    Exact,
    Regex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Op {
    kind: OpKind,
    case_sensitive: bool,
    negated: bool,
}

impl Op {
    const CONTAINS: Op = Op {
        kind: OpKind::Contains,
        case_sensitive: false,
        negated: false,
    };
    const EXACT: Op = Op {
        kind: OpKind::Exact,
        case_sensitive: false,
        negated: false,
    };

    /// Read a symbolic operator starting at `chars[i]`, returning it with
    /// its length.
    fn scan(chars: &[char], i: usize) -> Option<(Op, usize)> {
        let mut j = i;
        let negated = chars.get(j) == Some(&'!');
        if negated {
            j += 1;
        }
        if chars.get(j) != Some(&'=') {
            return None;
        }
        j += 1;
        let kind = match chars.get(j) {
            Some('=') => {
                j += 1;
                OpKind::Exact
            }
            Some('~') => {
                j += 1;
                OpKind::Regex
            }
            _ => OpKind::Contains,
        };
        let case_sensitive = chars.get(j) == Some(&'!');
        if case_sensitive {
            j += 1;
        }
        Some((
            Op {
                kind,
                case_sensitive,
                negated,
            },
            j - i,
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    LParen,
    RParen,
    Op(Op),
    /// Unquoted word.
    Word(String),
    /// Quoted string, quotes kept.
    Quoted(String),
}

fn tokenize(query: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = query.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '"' => {
                let start = i;
                i += 1;
                let mut closed = false;
                while i < chars.len() {
                    if chars[i] == '\\' && i + 1 < chars.len() {
                        i += 2;
                        continue;
                    }
                    if chars[i] == '"' {
                        closed = true;
                        i += 1;
                        break;
                    }
                    i += 1;
                }
                if !closed {
                    return Err(RefIndexError::query_invalid(query, "unterminated quote"));
                }
                tokens.push(Token::Quoted(chars[start..i].iter().collect()));
            }
            ':' => {
                tokens.push(Token::Op(Op::CONTAINS));
                i += 1;
            }
            '=' | '!' if Op::scan(&chars, i).is_some() => {
                if let Some((op, len)) = Op::scan(&chars, i) {
                    tokens.push(Token::Op(op));
                    i += len;
                }
            }
            _ => {
                let start = i;
                while i < chars.len() && !ends_word(&chars, i) {
                    i += 1;
                }
                tokens.push(Token::Word(chars[start..i].iter().collect()));
            }
        }
    }
    Ok(tokens)
}

fn ends_word(chars: &[char], i: usize) -> bool {
    match chars[i] {
        c if c.is_whitespace() => true,
        '(' | ')' | '"' | ':' | '=' => true,
        '!' => chars.get(i + 1) == Some(&'='),
        _ => false,
    }
}

fn keyword(token: Option<&Token>, word: &str) -> bool {
    matches!(token, Some(Token::Word(w)) if w.eq_ignore_ascii_case(word))
}

struct Parser<'q> {
    query: &'q str,
    tokens: Vec<Token>,
    pos: usize,
    flags: TermFlags,
}

impl<'q> Parser<'q> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn error(&self, reason: impl Into<String>) -> RefIndexError {
        RefIndexError::query_invalid(self.query, reason)
    }

    fn parse_or(&mut self) -> Result<QueryNode> {
        let mut node = self.parse_and()?;
        while keyword(self.peek(), "OR") {
            self.pos += 1;
            let right = self.parse_and()?;
            node = QueryNode::or(node, right);
        }
        Ok(node)
    }

    fn parse_and(&mut self) -> Result<QueryNode> {
        let mut node = self.parse_unary()?;
        loop {
            if keyword(self.peek(), "AND") {
                self.pos += 1;
            } else if !self.starts_unary() {
                break;
            }
            let right = self.parse_unary()?;
            node = QueryNode::and(node, right);
        }
        Ok(node)
    }

    /// Whether the next token can begin an implicitly AND-ed operand.
    fn starts_unary(&self) -> bool {
        match self.peek() {
            None | Some(Token::RParen) | Some(Token::Op(_)) => false,
            Some(Token::Word(w)) => !w.eq_ignore_ascii_case("OR"),
            Some(_) => true,
        }
    }

    fn parse_unary(&mut self) -> Result<QueryNode> {
        if keyword(self.peek(), "NOT") && self.peek_at(1).is_some() && !self.is_comparison_start() {
            self.pos += 1;
            let inner = self.parse_unary()?;
            return Ok(QueryNode::negate(inner));
        }
        self.parse_primary()
    }

    /// `NOT` followed by an operator is a field called "not".
    fn is_comparison_start(&self) -> bool {
        self.op_at(1).is_some()
    }

    fn op_at(&self, offset: usize) -> Option<Op> {
        match self.peek_at(offset) {
            Some(Token::Op(op)) => Some(*op),
            Some(Token::Word(w)) if w.eq_ignore_ascii_case("CONTAINS") => Some(Op::CONTAINS),
            Some(Token::Word(w)) if w.eq_ignore_ascii_case("MATCHES") => Some(Op::EXACT),
            _ => None,
        }
    }

    fn parse_primary(&mut self) -> Result<QueryNode> {
        match self.peek().cloned() {
            None => Err(self.error("unexpected end of query")),
            Some(Token::LParen) => {
                self.pos += 1;
                let inner = self.parse_or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(QueryNode::group(inner)),
                    _ => Err(self.error("missing closing parenthesis")),
                }
            }
            Some(Token::RParen) => Err(self.error("unexpected closing parenthesis")),
            Some(Token::Op(_)) => Err(self.error("operator without a field name")),
            Some(Token::Word(word)) => {
                if let Some(op) = self.op_at(1) {
                    self.pos += 2;
                    let value = match self.next() {
                        Some(Token::Word(v)) | Some(Token::Quoted(v)) => v,
                        _ => return Err(self.error(format!("missing value after '{}'", word))),
                    };
                    return Ok(self.comparison(word, op, value));
                }
                if ["AND", "OR", "NOT"].iter().any(|k| word.eq_ignore_ascii_case(k)) {
                    return Err(self.error(format!("'{}' needs an operand", word)));
                }
                self.pos += 1;
                Ok(self.term(word))
            }
            Some(Token::Quoted(value)) => {
                self.pos += 1;
                Ok(self.term(value))
            }
        }
    }

    fn term(&self, value: String) -> QueryNode {
        QueryNode::Term(SearchTerm {
            value,
            flags: self.flags,
        })
    }

    fn comparison(&self, field: String, op: Op, value: String) -> QueryNode {
        let mut flags = self.flags;
        if op.case_sensitive {
            flags.case_sensitive = true;
        }
        let operator = match op.kind {
            OpKind::Regex => {
                flags.regular_expression = true;
                ComparisonOperator::RegexMatch
            }
            OpKind::Exact | OpKind::Contains => {
                flags.exact_match |= op.kind == OpKind::Exact;
                if op.case_sensitive {
                    ComparisonOperator::CaseSensitiveEqual
                } else {
                    ComparisonOperator::Equal
                }
            }
        };
        let node = QueryNode::Comparison(Comparison {
            field,
            operator,
            value,
            flags,
        });
        if op.negated {
            QueryNode::negate(node)
        } else {
            node
        }
    }
}

/// Parse `query` under the caller's search flags.
pub fn parse_query(query: &str, flags: SearchFlags) -> Result<QueryNode> {
    let tokens = tokenize(query)?;
    if tokens.is_empty() {
        return Err(RefIndexError::query_invalid(query, "query is empty"));
    }

    let mut parser = Parser {
        query,
        tokens,
        pos: 0,
        flags: flags.into(),
    };
    let node = parser.parse_or()?;
    match parser.peek() {
        None => Ok(node),
        Some(Token::RParen) => Err(parser.error("unexpected closing parenthesis")),
        Some(token) => Err(parser.error(format!("unexpected token {:?}", token))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(query: &str) -> QueryNode {
        parse_query(query, SearchFlags::default()).unwrap()
    }

    fn cmp(node: &QueryNode) -> &Comparison {
        match node {
            QueryNode::Comparison(c) => c,
            other => panic!("expected comparison, got {other:?}"),
        }
    }

    #[test]
    fn test_field_comparison() {
        let node = parse("author:Euler");
        let c = cmp(&node);
        assert_eq!(c.field, "author");
        assert_eq!(c.value, "Euler");
        assert_eq!(c.operator, ComparisonOperator::Equal);
        assert!(!c.flags.exact_match);
    }

    #[test]
    fn test_quoted_value_kept_raw() {
        let node = parse("title:\"Graph Theory\"");
        assert_eq!(cmp(&node).value, "\"Graph Theory\"");
    }

    #[test]
    fn test_operators() {
        assert!(cmp(&parse("title==Graph")).flags.exact_match);
        assert!(cmp(&parse("title MATCHES Graph")).flags.exact_match);
        assert_eq!(
            cmp(&parse("title=!Graph")).operator,
            ComparisonOperator::CaseSensitiveEqual
        );
        let cs_exact = parse("title==!Graph");
        assert!(cmp(&cs_exact).flags.case_sensitive && cmp(&cs_exact).flags.exact_match);
        assert_eq!(
            cmp(&parse("title=~^Gr.*")).operator,
            ComparisonOperator::RegexMatch
        );
        assert_eq!(cmp(&parse("title CONTAINS graph")).value, "graph");
    }

    #[test]
    fn test_not_equal_becomes_negation() {
        match parse("author!=Euler") {
            QueryNode::Not(inner) => assert_eq!(cmp(&inner).operator, ComparisonOperator::Equal),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_case_sensitive_regex() {
        let node = parse("title=~!^Gr.*");
        let c = cmp(&node);
        assert_eq!(c.operator, ComparisonOperator::RegexMatch);
        assert!(c.flags.regular_expression && c.flags.case_sensitive);
        assert!(!c.flags.exact_match);
        assert_eq!(c.value, "^Gr.*");
    }

    #[test]
    fn test_negated_operators() {
        // (query, operator, exact, case-sensitive, regex)
        let cases = [
            ("title!=Graph", ComparisonOperator::Equal, false, false, false),
            ("title!=!Graph", ComparisonOperator::CaseSensitiveEqual, false, true, false),
            ("title!==Graph", ComparisonOperator::Equal, true, false, false),
            ("title!==!Graph", ComparisonOperator::CaseSensitiveEqual, true, true, false),
            ("title!=~Gr.*", ComparisonOperator::RegexMatch, false, false, true),
            ("title!=~!Gr.*", ComparisonOperator::RegexMatch, false, true, true),
        ];
        for (query, operator, exact, case_sensitive, regex) in cases {
            let inner = match parse(query) {
                QueryNode::Not(inner) => inner,
                other => panic!("{query}: unexpected {other:?}"),
            };
            let c = cmp(&inner);
            assert_eq!(c.field, "title", "{query}");
            assert_eq!(c.operator, operator, "{query}");
            assert_eq!(c.flags.exact_match, exact, "{query}");
            assert_eq!(c.flags.case_sensitive, case_sensitive, "{query}");
            assert_eq!(c.flags.regular_expression, regex, "{query}");
            assert!(!c.value.starts_with(['!', '=', '~']), "{query}");
        }
    }

    #[test]
    fn test_operators_render_back() {
        for query in [
            "title==Graph",
            "title=!Graph",
            "title==!Graph",
            "title=~Gr.*",
            "title=~!Gr.*",
        ] {
            assert_eq!(parse(query).to_string(), query);
            let negated = parse(&query.replacen('=', "!=", 1));
            assert_eq!(negated.to_string(), format!("NOT {query}"));
        }
    }

    #[test]
    fn test_exclamation_inside_words() {
        assert_eq!(parse("wow!").to_string(), "wow!");
        assert!(matches!(parse("!bang"), QueryNode::Term(_)));
    }

    #[test]
    fn test_precedence_and_implicit_and() {
        // a OR (b AND c)
        match parse("a OR b c") {
            QueryNode::Or(left, right) => {
                assert!(matches!(*left, QueryNode::Term(_)));
                assert!(matches!(*right, QueryNode::And(_, _)));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(parse("a and b"), QueryNode::And(_, _)));
        assert!(matches!(parse("not a"), QueryNode::Not(_)));
        assert!(matches!(parse("(a OR b)"), QueryNode::Group(_)));
    }

    #[test]
    fn test_global_flags_applied() {
        let flags = SearchFlags::default().case_sensitive(true).regular_expression(true);
        match parse_query("euler", flags).unwrap() {
            QueryNode::Term(t) => {
                assert!(t.flags.case_sensitive);
                assert!(t.flags.regular_expression);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_invalid_queries() {
        for query in [
            "",
            "   ",
            "(a OR b",
            "a OR b)",
            "title=",
            "=value",
            "a AND",
            "OR b",
            "\"unterminated",
            "NOT",
        ] {
            let err = parse_query(query, SearchFlags::default()).unwrap_err();
            assert!(
                matches!(err, RefIndexError::QueryInvalid { .. }),
                "{query:?} gave {err:?}"
            );
        }
    }
}

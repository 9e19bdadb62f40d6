//! Tag filters for selecting fixtures
//!
//! A filter is a boolean formula over tag names:
//!
//! ```text
//! smoke & !slow
//! (mux | sequence) & regression
//! ```
//!
//! `!` binds tightest, then `&`, then `|`. An empty expression selects every
//! fixture.

use std::sync::Arc;

use crate::error::{LmFlowError, Result};

/// Predicate over a fixture's tags
#[derive(Clone)]
pub enum TagFilter {
    /// Select everything
    Always,
    /// Fixture carries this tag
    Tag(String),
    /// All filters must match
    All(Vec<TagFilter>),
    /// Any filter must match
    Any(Vec<TagFilter>),
    /// Negate a filter
    Not(Box<TagFilter>),
    /// Custom predicate function
    Custom(Arc<dyn Fn(&[String]) -> bool + Send + Sync>),
}

impl std::fmt::Debug for TagFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TagFilter::Always => write!(f, "Always"),
            TagFilter::Tag(tag) => write!(f, "Tag({})", tag),
            TagFilter::All(filters) => write!(f, "All({:?})", filters),
            TagFilter::Any(filters) => write!(f, "Any({:?})", filters),
            TagFilter::Not(filter) => write!(f, "Not({:?})", filter),
            TagFilter::Custom(_) => write!(f, "Custom(...)"),
        }
    }
}

impl Default for TagFilter {
    fn default() -> Self {
        TagFilter::Always
    }
}

impl TagFilter {
    pub fn from_fn(predicate: impl Fn(&[String]) -> bool + Send + Sync + 'static) -> Self {
        TagFilter::Custom(Arc::new(predicate))
    }

    pub fn matches(&self, tags: &[String]) -> bool {
        match self {
            TagFilter::Always => true,
            TagFilter::Tag(tag) => tags.iter().any(|t| t == tag),
            TagFilter::All(filters) => filters.iter().all(|f| f.matches(tags)),
            TagFilter::Any(filters) => filters.iter().any(|f| f.matches(tags)),
            TagFilter::Not(filter) => !filter.matches(tags),
            TagFilter::Custom(predicate) => predicate(tags),
        }
    }

    /// Parse a tag expression
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming the offending position.
    pub fn parse(expression: &str) -> Result<Self> {
        let tokens = tokenize(expression)?;
        if tokens.is_empty() {
            return Ok(TagFilter::Always);
        }

        let mut parser = Parser {
            tokens,
            position: 0,
            expression,
        };
        let filter = parser.or()?;
        match parser.peek() {
            None => Ok(filter),
            Some(token) => Err(parser.error(format!("unexpected {}", token))),
        }
    }
}

impl std::str::FromStr for TagFilter {
    type Err = LmFlowError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Tag(String),
    And,
    Or,
    Not,
    Open,
    Close,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Tag(tag) => write!(f, "tag '{}'", tag),
            Token::And => write!(f, "'&'"),
            Token::Or => write!(f, "'|'"),
            Token::Not => write!(f, "'!'"),
            Token::Open => write!(f, "'('"),
            Token::Close => write!(f, "')'"),
        }
    }
}

fn is_tag_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | ':' | '/')
}

fn tokenize(expression: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = expression.char_indices().peekable();

    while let Some((offset, c)) = chars.next() {
        let token = match c {
            c if c.is_whitespace() => continue,
            '&' => Token::And,
            '|' => Token::Or,
            '!' => Token::Not,
            '(' => Token::Open,
            ')' => Token::Close,
            c if is_tag_char(c) => {
                let mut tag = c.to_string();
                while let Some(&(_, next)) = chars.peek() {
                    if !is_tag_char(next) {
                        break;
                    }
                    tag.push(next);
                    chars.next();
                }
                Token::Tag(tag)
            }
            other => {
                return Err(LmFlowError::Configuration(format!(
                    "Invalid tag filter '{}': unexpected character '{}' at {}",
                    expression, other, offset
                )));
            }
        };
        tokens.push(token);
    }

    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    position: usize,
    expression: &'a str,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        self.position += 1;
        token
    }

    fn error(&self, message: String) -> LmFlowError {
        LmFlowError::Configuration(format!("Invalid tag filter '{}': {}", self.expression, message))
    }

    fn or(&mut self) -> Result<TagFilter> {
        let mut terms = vec![self.and()?];
        while self.peek() == Some(&Token::Or) {
            self.next();
            terms.push(self.and()?);
        }
        Ok(if terms.len() == 1 {
            terms.remove(0)
        } else {
            TagFilter::Any(terms)
        })
    }

    fn and(&mut self) -> Result<TagFilter> {
        let mut terms = vec![self.unary()?];
        while self.peek() == Some(&Token::And) {
            self.next();
            terms.push(self.unary()?);
        }
        Ok(if terms.len() == 1 {
            terms.remove(0)
        } else {
            TagFilter::All(terms)
        })
    }

    fn unary(&mut self) -> Result<TagFilter> {
        match self.next() {
            Some(Token::Not) => Ok(TagFilter::Not(Box::new(self.unary()?))),
            Some(Token::Tag(tag)) => Ok(TagFilter::Tag(tag)),
            Some(Token::Open) => {
                let inner = self.or()?;
                match self.next() {
                    Some(Token::Close) => Ok(inner),
                    Some(token) => Err(self.error(format!("expected ')', found {}", token))),
                    None => Err(self.error("unclosed '('".to_string())),
                }
            }
            Some(token) => Err(self.error(format!("unexpected {}", token))),
            None => Err(self.error("unexpected end of expression".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(list: &[&str]) -> Vec<String> {
        list.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn test_empty_expression_selects_everything() {
        let filter = TagFilter::parse("   ").unwrap();
        assert!(filter.matches(&[]));
        assert!(filter.matches(&tags(&["anything"])));
    }

    #[test]
    fn test_and_not() {
        let filter = TagFilter::parse("a & !b").unwrap();
        assert!(filter.matches(&tags(&["a"])));
        assert!(filter.matches(&tags(&["a", "c"])));
        assert!(!filter.matches(&tags(&["a", "b"])));
        assert!(!filter.matches(&tags(&["b"])));
    }

    #[test]
    fn test_precedence_and_parentheses() {
        // & binds tighter than |
        let loose = TagFilter::parse("a | b & c").unwrap();
        assert!(loose.matches(&tags(&["a"])));
        assert!(!loose.matches(&tags(&["b"])));

        let grouped = TagFilter::parse("(a | b) & c").unwrap();
        assert!(!grouped.matches(&tags(&["a"])));
        assert!(grouped.matches(&tags(&["b", "c"])));
    }

    #[test]
    fn test_tag_characters() {
        let filter: TagFilter = "suite/mux-v2 | team:eval".parse().unwrap();
        assert!(filter.matches(&tags(&["suite/mux-v2"])));
        assert!(filter.matches(&tags(&["team:eval"])));
    }

    #[test]
    fn test_malformed_expressions_rejected() {
        for expression in ["a &", "(a | b", "a b", "& a", "a $ b", ")"] {
            let err = TagFilter::parse(expression).unwrap_err();
            assert!(
                matches!(err, LmFlowError::Configuration(_)),
                "{} should be rejected",
                expression
            );
        }
    }

    #[test]
    fn test_custom_predicate() {
        let filter = TagFilter::from_fn(|tags| tags.len() > 1);
        assert!(filter.matches(&tags(&["a", "b"])));
        assert!(!filter.matches(&tags(&["a"])));
    }
}

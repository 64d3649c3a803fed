//! Registration table mapping inputs to handlers
//!
//! Routes are checked in registration order and the first match wins, so
//! register specific matchers before broad ones.

use serde::{Deserialize, Serialize};

use crate::value::Val;

/// Test applied to an input value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum Matcher {
    /// Whole text, case-insensitive, surrounding whitespace ignored
    Exact(String),
    Prefix(String),
    Contains(String),
    /// Any of these words appears as a whole word
    Keywords(Vec<String>),
    /// Recognized intent with at least this score
    Intent { name: String, min_score: f64 },
    Any,
}

impl Matcher {
    pub fn exact(text: &str) -> Self {
        Matcher::Exact(text.to_string())
    }

    pub fn keywords(words: &[&str]) -> Self {
        Matcher::Keywords(words.iter().map(|w| w.to_string()).collect())
    }

    pub fn intent(name: &str, min_score: f64) -> Self {
        Matcher::Intent {
            name: name.to_string(),
            min_score,
        }
    }

    pub fn matches(&self, input: &Val) -> bool {
        match (self, input) {
            (Matcher::Any, _) => true,
            (Matcher::Intent { name, min_score }, Val::Intent(result)) => {
                result.intent.eq_ignore_ascii_case(name) && result.score >= *min_score
            }
            (Matcher::Intent { .. }, _) => false,
            (text_matcher, Val::Str(text)) => text_matcher.matches_text(text),
            _ => false,
        }
    }

    fn matches_text(&self, text: &str) -> bool {
        let text = normalize(text);
        match self {
            Matcher::Exact(expected) => text == normalize(expected),
            Matcher::Prefix(prefix) => text.starts_with(&normalize(prefix)),
            Matcher::Contains(needle) => text.contains(&normalize(needle)),
            Matcher::Keywords(words) => {
                let tokens: Vec<&str> = text
                    .split(|c: char| !c.is_alphanumeric())
                    .filter(|t| !t.is_empty())
                    .collect();
                words
                    .iter()
                    .any(|w| tokens.contains(&normalize(w).as_str()))
            }
            Matcher::Intent { .. } | Matcher::Any => false,
        }
    }
}

fn normalize(text: &str) -> String {
    text.trim().to_lowercase()
}

/// Ordered `(matcher, handler)` pairs
#[derive(Debug, Clone)]
pub struct RouteTable<H> {
    routes: Vec<(Matcher, H)>,
}

impl<H> Default for RouteTable<H> {
    fn default() -> Self {
        Self { routes: Vec::new() }
    }
}

impl<H> RouteTable<H> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, matcher: Matcher, handler: H) -> Self {
        self.routes.push((matcher, handler));
        self
    }

    pub fn add(&mut self, matcher: Matcher, handler: H) {
        self.routes.push((matcher, handler));
    }

    /// Handler of the first matching route
    pub fn resolve(&self, input: &Val) -> Option<&H> {
        self.routes
            .iter()
            .find(|(matcher, _)| matcher.matches(input))
            .map(|(_, handler)| handler)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

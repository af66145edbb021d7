//! Glossary: source term -> target term.
//! Backed by a `BTreeMap` so equality, serialization and cache hashing do not
//! depend on insertion order.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GlossaryError {
    #[error("glossary IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("glossary parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Glossary {
    terms: BTreeMap<String, String>,
}

impl Glossary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a glossary from a JSON object file (`{"source": "target", ...}`).
    pub fn load_from_file(path: &Path) -> Result<Self, GlossaryError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn insert(&mut self, source: impl Into<String>, target: impl Into<String>) {
        self.terms.insert(source.into(), target.into());
    }

    pub fn get(&self, source: &str) -> Option<&str> {
        self.terms.get(source).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.terms.iter().map(|(s, t)| (s.as_str(), t.as_str()))
    }

    /// Entries whose source term occurs literally in at least one of `lines`.
    pub fn filter_for(&self, lines: &[String]) -> Glossary {
        self.terms
            .iter()
            .filter(|(source, _)| lines.iter().any(|line| line.contains(source.as_str())))
            .map(|(s, t)| (s.clone(), t.clone()))
            .collect()
    }

    /// One `source->target` pair per line, for prompt hints.
    pub fn hint(&self) -> String {
        self.terms
            .iter()
            .map(|(s, t)| format!("{s}->{t}"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Replace every source term in `text` with its target, longest terms first
    /// so a short term never splits a longer one.
    pub fn apply(&self, text: &str) -> String {
        let mut sorted: Vec<_> = self.terms.iter().collect();
        sorted.sort_by(|a, b| b.0.chars().count().cmp(&a.0.chars().count()));
        let mut result = text.to_string();
        for (source, target) in sorted {
            if !source.is_empty() {
                result = result.replace(source.as_str(), target);
            }
        }
        result
    }
}

impl<S: Into<String>, T: Into<String>> FromIterator<(S, T)> for Glossary {
    fn from_iter<I: IntoIterator<Item = (S, T)>>(iter: I) -> Self {
        Self {
            terms: iter
                .into_iter()
                .map(|(s, t)| (s.into(), t.into()))
                .collect(),
        }
    }
}

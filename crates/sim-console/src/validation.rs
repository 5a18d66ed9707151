use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::path_value::normalize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    #[serde(alias = "Path")]
    pub path: String,
    #[serde(alias = "Message")]
    pub message: String,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Path-keyed view over one validation result. Rebuilt wholesale, never merged.
#[derive(Debug, Clone, Default)]
pub struct ValidationIndex {
    by_path: HashMap<String, Vec<String>>,
    total: usize,
}

impl ValidationIndex {
    pub fn index(errors: &[ValidationError]) -> Self {
        let mut by_path: HashMap<String, Vec<String>> = HashMap::new();
        for e in errors {
            by_path
                .entry(normalize(&e.path))
                .or_default()
                .push(e.message.clone());
        }
        Self {
            by_path,
            total: errors.len(),
        }
    }

    /// Messages for `path` in the order they arrived; empty when there are none.
    pub fn for_path(&self, path: &str) -> &[String] {
        self.by_path
            .get(&normalize(path))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    pub fn len(&self) -> usize {
        self.total
    }

    /// Paths carrying errors that no form field claims.
    pub fn unclaimed<'a>(&'a self, known: &[&str]) -> Vec<&'a str> {
        let known: Vec<String> = known.iter().map(|p| normalize(p)).collect();
        let mut out: Vec<&str> = self
            .by_path
            .keys()
            .filter(|p| !known.contains(p))
            .map(String::as_str)
            .collect();
        out.sort_unstable();
        out
    }
}

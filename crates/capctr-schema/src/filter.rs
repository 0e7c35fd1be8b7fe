use regex::Regex;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("invalid filter '{0}', expected '<key>=<value>'")]
    Malformed(String),
    #[error("unsupported filter key '{0}'")]
    UnsupportedKey(String),
    #[error("invalid name pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Listing filter with docker-style semantics: every label condition must
/// hold, and when name patterns are given at least one must match.
#[derive(Debug, Clone, Default)]
pub struct ContainerFilter {
    labels: Vec<(String, Option<String>)>,
    names: Vec<Regex>,
}

impl ContainerFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `key` to be present with exactly `value`.
    #[must_use]
    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.labels.push((key.to_owned(), Some(value.to_owned())));
        self
    }

    /// Require `key` to be present with any value.
    #[must_use]
    pub fn label_key(mut self, key: &str) -> Self {
        self.labels.push((key.to_owned(), None));
        self
    }

    /// Add a name regular expression, e.g. `^cluster-a-`.
    pub fn name(mut self, pattern: &str) -> Result<Self, FilterError> {
        let re = Regex::new(pattern).map_err(|source| FilterError::InvalidPattern {
            pattern: pattern.to_owned(),
            source,
        })?;
        self.names.push(re);
        Ok(self)
    }

    /// Build a filter from `key=value` expressions (`label=k=v`, `label=k`,
    /// `name=<regex>`).
    pub fn parse<S: AsRef<str>>(exprs: &[S]) -> Result<Self, FilterError> {
        let mut filter = Self::new();
        for expr in exprs {
            let expr = expr.as_ref();
            let (key, value) = expr
                .split_once('=')
                .ok_or_else(|| FilterError::Malformed(expr.to_owned()))?;
            match key {
                "label" => {
                    filter = match value.split_once('=') {
                        Some((k, v)) => filter.label(k, v),
                        None => filter.label_key(value),
                    };
                }
                "name" => filter = filter.name(value)?,
                other => return Err(FilterError::UnsupportedKey(other.to_owned())),
            }
        }
        Ok(filter)
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty() && self.names.is_empty()
    }

    pub fn matches(&self, name: &str, labels: &BTreeMap<String, String>) -> bool {
        let labels_ok = self.labels.iter().all(|(key, want)| match want {
            Some(want) => labels.get(key) == Some(want),
            None => labels.contains_key(key),
        });
        let name_ok = self.names.is_empty() || self.names.iter().any(|re| re.is_match(name));
        labels_ok && name_ok
    }
}

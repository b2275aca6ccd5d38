//! Named scalar resource vectors.
//!
//! Resources are advertised by the agent (`cpus:2;mem:512`), carried on
//! every task and executor, and summed/subtracted as tasks come and go.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from parsing a resource string.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ResourceError {
    #[error("malformed resource pair '{0}', expected name:value")]
    MalformedPair(String),

    #[error("invalid value for resource '{name}': {value}")]
    InvalidValue { name: String, value: String },
}

/// A vector of named scalar resources.
///
/// Stored as a sorted map so the display form is deterministic. Resources
/// that drop to zero (or below, clamped) are removed from the map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Resources(BTreeMap<String, f64>);

impl Resources {
    /// An empty resource vector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a semicolon-separated `name:value` list, e.g. `cpus:2;mem:512`.
    ///
    /// An empty string parses to the empty vector.
    pub fn parse(s: &str) -> Result<Self, ResourceError> {
        let mut map = BTreeMap::new();

        for pair in s.split(';') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }

            let Some((name, value)) = pair.split_once(':') else {
                return Err(ResourceError::MalformedPair(pair.to_string()));
            };

            let name = name.trim();
            let value: f64 = value
                .trim()
                .parse()
                .map_err(|_| ResourceError::InvalidValue {
                    name: name.to_string(),
                    value: value.trim().to_string(),
                })?;

            map.insert(name.to_string(), value);
        }

        Ok(Self(map))
    }

    /// Gets a named scalar.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied()
    }

    /// Sets a named scalar, removing it if the value is not positive.
    pub fn set(&mut self, name: &str, value: f64) {
        if value > 0.0 {
            self.0.insert(name.to_string(), value);
        } else {
            self.0.remove(name);
        }
    }

    /// CPU cores.
    #[must_use]
    pub fn cpus(&self) -> Option<f64> {
        self.get("cpus")
    }

    /// Memory in MB.
    #[must_use]
    pub fn mem(&self) -> Option<f64> {
        self.get("mem")
    }

    /// Disk in MB.
    #[must_use]
    pub fn disk(&self) -> Option<f64> {
        self.get("disk")
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Adds every scalar of `other` into `self`.
    pub fn add(&mut self, other: &Resources) {
        for (name, value) in &other.0 {
            let entry = self.0.entry(name.clone()).or_insert(0.0);
            *entry += value;
        }
    }

    /// Subtracts every scalar of `other`, clamping at zero.
    pub fn subtract(&mut self, other: &Resources) {
        for (name, value) in &other.0 {
            if let Some(entry) = self.0.get_mut(name) {
                *entry -= value;
                if *entry <= f64::EPSILON {
                    self.0.remove(name);
                }
            }
        }
    }

    /// Returns the sum of two vectors.
    #[must_use]
    pub fn plus(&self, other: &Resources) -> Resources {
        let mut out = self.clone();
        out.add(other);
        out
    }

    /// True if every scalar in `other` fits within `self`.
    #[must_use]
    pub fn contains(&self, other: &Resources) -> bool {
        other
            .0
            .iter()
            .all(|(name, value)| self.get(name).unwrap_or(0.0) + f64::EPSILON >= *value)
    }

    /// Iterates over `(name, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

impl fmt::Display for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, value) in &self.0 {
            if !first {
                write!(f, ";")?;
            }
            first = false;
            write!(f, "{name}:{value}")?;
        }
        Ok(())
    }
}

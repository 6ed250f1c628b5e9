//! Display labels for units (`pioreactor7` -> `"P7 - glucose"`).
//!
//! Lookups always succeed: a unit without a label resolves to its raw id, and a
//! failed refresh leaves the previous map in place.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityMap {
    labels: HashMap<String, String>,
}

impl IdentityMap {
    pub fn new(labels: HashMap<String, String>) -> Self {
        Self { labels }
    }

    pub fn resolve<'a>(&'a self, raw_id: &'a str) -> &'a str {
        self.labels.get(raw_id).map(String::as_str).unwrap_or(raw_id)
    }

    pub fn label(&self, raw_id: &str) -> Option<&str> {
        self.labels.get(raw_id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

impl FromIterator<(String, String)> for IdentityMap {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self {
            labels: iter.into_iter().collect(),
        }
    }
}

#[derive(Debug, Default)]
pub struct IdentityResolver {
    map: IdentityMap,
}

impl IdentityResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn map(&self) -> &IdentityMap {
        &self.map
    }

    pub fn resolve<'a>(&'a self, raw_id: &'a str) -> &'a str {
        self.map.resolve(raw_id)
    }

    /// Replaces the map on success. Failures are logged and swallowed.
    pub fn accept(&mut self, outcome: Result<IdentityMap, crate::error::FetchError>) -> bool {
        match outcome {
            Ok(map) => {
                debug!(labels = map.len(), "unit labels refreshed");
                self.map = map;
                true
            }
            Err(e) => {
                warn!(error = %e, "unit label refresh failed, falling back to raw ids");
                false
            }
        }
    }
}

//! Sample manifests.
//!
//! A manifest is plain text: sample ids separated by newlines and/or commas, with optional
//! surrounding whitespace. Blank entries and duplicates are ignored. Every worker parses the same
//! file into the same lexicographically sorted list, which is the global ordering the work
//! partitioning is defined over.

use crate::errors::ConfigError;
use std::collections::BTreeSet;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Manifest {
    ids: Vec<String>,
}

impl Manifest {
    pub fn parse(text: &str) -> Manifest {
        let ids: BTreeSet<&str> = text
            .split([',', '\n', '\r'])
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .collect();
        Manifest {
            ids: ids.into_iter().map(String::from).collect(),
        }
    }

    pub fn from_path(path: &Path) -> Result<Manifest, ConfigError> {
        let text =
            std::fs::read_to_string(path).map_err(|source| ConfigError::UnreadableManifest {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Manifest::parse(&text))
    }

    /// Keep only the first `limit` ids of the global ordering.
    pub fn limited(mut self, limit: Option<usize>) -> Manifest {
        if let Some(limit) = limit {
            self.ids.truncate(limit);
        }
        self
    }

    /// Sample ids in global order.
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Filesystem layout for persisted connector state.

use std::env;
use std::path::{Path, PathBuf};

use crate::config::{DATA_DIR_ENV, DEFAULT_DATA_DIR};

/// Resolves paths under the connector's data directory.
#[derive(Debug, Clone)]
pub struct StoragePaths {
    root: PathBuf,
}

impl StoragePaths {
    /// Create paths rooted at the given directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create paths from the `DATA_DIR` environment variable.
    pub fn from_env() -> Self {
        let root = env::var(DATA_DIR_ENV).unwrap_or_else(|_| DEFAULT_DATA_DIR.to_string());
        Self::new(root)
    }

    /// The data directory root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding connector state.
    pub fn connector_dir(&self) -> PathBuf {
        self.root.join("connector")
    }

    /// The whitelist record file.
    pub fn whitelist_file(&self) -> PathBuf {
        self.connector_dir().join("whitelist.json")
    }
}

impl Default for StoragePaths {
    fn default() -> Self {
        Self::new(DEFAULT_DATA_DIR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_nest_under_root() {
        let paths = StoragePaths::new("/tmp/bridge");
        assert_eq!(paths.connector_dir(), PathBuf::from("/tmp/bridge/connector"));
        assert_eq!(
            paths.whitelist_file(),
            PathBuf::from("/tmp/bridge/connector/whitelist.json")
        );
    }
}

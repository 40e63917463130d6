//! Purpose: Connection-level configuration for the lookaside store.
//! Exports: `ConnectionConfig`, `LookasideConfig`.
//! Role: Deserialized from JSON by the CLI; constructed directly by embedders.
//! Invariants: Every field has a default so partial documents are accepted.
//! Invariants: Unknown fields are rejected to surface typos early.
use std::path::Path;

use serde::Deserialize;

use crate::core::error::{Error, ErrorKind};
use crate::core::lookaside::DEFAULT_TABLE_NAME;

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectionConfig {
    pub lookaside: LookasideConfig,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct LookasideConfig {
    /// File name of the lookaside table inside the connection directory.
    pub table_name: String,
    /// Create the store while opening the connection instead of on first use.
    pub warm_on_open: bool,
}

impl Default for LookasideConfig {
    fn default() -> Self {
        Self {
            table_name: DEFAULT_TABLE_NAME.to_string(),
            warm_on_open: false,
        }
    }
}

impl ConnectionConfig {
    pub fn from_json_str(text: &str) -> Result<Self, Error> {
        serde_json::from_str(text).map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message(format!("invalid config: {err}"))
                .with_source(err)
        })
    }

    pub fn from_json_file(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to read config")
                .with_path(path)
                .with_source(err)
        })?;
        Self::from_json_str(&text).map_err(|err| err.with_path(path))
    }
}

//! Entry selection by database, key pattern and value kind

use regex::bytes::RegexSet;

use crate::rdb::value_kind;
use ferrite_rmt_core::config::{FilterConfig, ValueKind};
use ferrite_rmt_core::ConfigError;

/// Compiled `[filter]` section. Each empty criterion matches everything.
#[derive(Debug, Clone)]
pub struct EntryFilter {
    dbs: Vec<u32>,
    keys: Option<RegexSet>,
    kinds: Vec<ValueKind>,
}

impl EntryFilter {
    /// A filter that selects every entry
    pub fn all() -> Self {
        Self {
            dbs: Vec::new(),
            keys: None,
            kinds: Vec::new(),
        }
    }

    /// Compile the key patterns of `config`
    pub fn from_config(config: &FilterConfig) -> Result<Self, ConfigError> {
        let keys = if config.keys.is_empty() {
            None
        } else {
            let set = RegexSet::new(&config.keys)
                .map_err(|e| ConfigError::Invalid(format!("filter.keys: {}", e)))?;
            Some(set)
        };
        Ok(Self {
            dbs: config.db.clone(),
            keys,
            kinds: config.types.clone(),
        })
    }

    /// Whether every entry passes
    pub fn is_pass_through(&self) -> bool {
        self.dbs.is_empty() && self.keys.is_none() && self.kinds.is_empty()
    }

    /// Whether an entry with these attributes should be migrated
    pub fn matches(&self, db: u32, key: &[u8], type_code: u8) -> bool {
        if !self.dbs.is_empty() && !self.dbs.contains(&db) {
            return false;
        }
        if !self.kinds.is_empty() {
            match value_kind(type_code) {
                Some(kind) if self.kinds.contains(&kind) => {}
                _ => return false,
            }
        }
        match &self.keys {
            Some(set) => set.is_match(key),
            None => true,
        }
    }
}

impl Default for EntryFilter {
    fn default() -> Self {
        Self::all()
    }
}

//! Compute-side page store settings.
//!
//! The settings are read from a TOML file. All fields are optional, the defaults
//! are in the [`defaults`] module.

use anyhow::{ensure, Context};
use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use utils::id::{TenantId, TimelineId};
use utils::logging::LogFormat;

pub mod defaults {
    pub const DEFAULT_PAGE_SERVER_CONNSTRING: &str = "127.0.0.1:64000";
    pub const DEFAULT_RELSIZE_CACHE_ENTRIES: usize = 64 * 1024;
    pub const DEFAULT_MAX_PREFETCH_REQUESTS: usize = 128;
    pub const DEFAULT_INMEM_MAX_PAGES: usize = 128;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PageStoreConf {
    /// host:port of the page server
    pub page_server_connstring: String,
    pub tenant_id: Option<TenantId>,
    pub timeline_id: Option<TimelineId>,

    /// Serve storage from process memory, for the WAL redo process.
    pub wal_redo: bool,

    /// Refuse to extend relations once the cluster reaches this size.
    /// `None` or 0 means no limit.
    pub max_cluster_size_mb: Option<u64>,

    /// Number of relation forks whose size is cached, 0 disables the cache.
    pub relsize_cache_entries: usize,
    pub max_prefetch_requests: usize,
    pub inmem_max_pages: usize,

    // Which SLRUs are read from the page server rather than local files.
    pub slru_clog: bool,
    pub slru_multixact: bool,
    pub slru_csnlog: bool,

    pub log_format: LogFormat,
}

impl Default for PageStoreConf {
    fn default() -> Self {
        use defaults::*;
        PageStoreConf {
            page_server_connstring: DEFAULT_PAGE_SERVER_CONNSTRING.to_string(),
            tenant_id: None,
            timeline_id: None,
            wal_redo: false,
            max_cluster_size_mb: None,
            relsize_cache_entries: DEFAULT_RELSIZE_CACHE_ENTRIES,
            max_prefetch_requests: DEFAULT_MAX_PREFETCH_REQUESTS,
            inmem_max_pages: DEFAULT_INMEM_MAX_PAGES,
            slru_clog: false,
            slru_multixact: false,
            slru_csnlog: false,
            log_format: LogFormat::Plain,
        }
    }
}

impl PageStoreConf {
    pub fn parse(toml_str: &str) -> anyhow::Result<Self> {
        let conf: PageStoreConf =
            toml::from_str(toml_str).context("could not parse page store config")?;
        conf.validate()?;
        Ok(conf)
    }

    pub fn load(path: &Utf8Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("could not read config file {path}"))?;
        Self::parse(&contents).with_context(|| format!("invalid config file {path}"))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.wal_redo {
            ensure!(
                !self.page_server_connstring.is_empty(),
                "page_server_connstring must be set"
            );
        }
        Ok(())
    }

    pub fn max_cluster_size_bytes(&self) -> Option<u64> {
        match self.max_cluster_size_mb {
            None | Some(0) => None,
            Some(mb) => Some(mb.saturating_mul(1024 * 1024)),
        }
    }
}

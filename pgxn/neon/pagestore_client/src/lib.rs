//! Compute-side client of the page server.
//!
//! Implements the storage manager of a compute node on top of the pagestream
//! protocol: relation pages, sizes and existence come from the page server,
//! writes reach it through the WAL. The WAL redo process uses an in-memory
//! storage manager instead.

pub mod client;
pub mod config;
mod error;
pub mod inmem_smgr;
pub mod neon_smgr;
pub mod relsize_cache;
pub mod slru;
pub mod smgr;

#[cfg(test)]
mod mock;

pub use error::{PageStoreError, SmgrError};

use config::PageStoreConf;

/// Backend that owns a temporary relation, `None` for shared relations.
pub type BackendId = i32;

/// Where the pages of a relation are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmgrKind {
    /// On the page server, see [`neon_smgr::NeonSmgr`].
    Neon,
    /// In process memory, see [`inmem_smgr::InmemSmgr`].
    Inmem,
    /// In local files managed by the host, for backend-local temporary relations.
    Local,
}

pub fn smgr_which(conf: &PageStoreConf, backend: Option<BackendId>) -> SmgrKind {
    if conf.wal_redo {
        SmgrKind::Inmem
    } else if backend.is_some() {
        SmgrKind::Local
    } else {
        SmgrKind::Neon
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_selection() {
        let mut conf = PageStoreConf::default();
        assert_eq!(smgr_which(&conf, None), SmgrKind::Neon);
        assert_eq!(smgr_which(&conf, Some(3)), SmgrKind::Local);

        conf.wal_redo = true;
        assert_eq!(smgr_which(&conf, None), SmgrKind::Inmem);
        assert_eq!(smgr_which(&conf, Some(3)), SmgrKind::Inmem);
    }
}

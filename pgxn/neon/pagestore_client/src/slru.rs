//! Reading SLRU pages from the page server.
//!
//! The transaction status SLRUs can be served by the page server instead of
//! local files, each kind enabled separately in the config. Pages are addressed
//! by segment number and the byte offset of the page within the segment.

use pageserver_api::models::{
    PagestreamBeMessage, PagestreamFeMessage, PagestreamGetSlruPageRequest,
    PagestreamGetSlruPageResponse,
};
use pageserver_api::reltag::SlruKind;
use postgres_ffi_types::constants::{BLCKSZ, SLRU_SEG_SIZE};
use tracing::trace;

use crate::client::PageServerApi;
use crate::config::PageStoreConf;
use crate::neon_smgr::{NeonSmgr, WalLog};
use crate::{PageStoreError, SmgrError};

/// The host's control structure of one SLRU, identified by its directory
/// under the data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlruCtl {
    pub dir: String,
}

impl SlruCtl {
    pub fn new(dir: impl Into<String>) -> Self {
        SlruCtl { dir: dir.into() }
    }

    /// The SLRU kind this directory holds, if any.
    pub fn kind(&self) -> Option<SlruKind> {
        kind_from_string(&self.dir)
    }
}

pub fn kind_to_string(kind: SlruKind) -> &'static str {
    kind.to_str()
}

pub fn kind_from_string(s: &str) -> Option<SlruKind> {
    s.parse().ok()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteSlruKinds {
    pub clog: bool,
    pub multixact: bool,
    pub csnlog: bool,
}

impl RemoteSlruKinds {
    pub fn from_conf(conf: &PageStoreConf) -> Self {
        RemoteSlruKinds {
            clog: conf.slru_clog,
            multixact: conf.slru_multixact,
            csnlog: conf.slru_csnlog,
        }
    }

    pub fn is_remote(&self, kind: SlruKind) -> bool {
        match kind {
            SlruKind::Clog => self.clog,
            SlruKind::MultiXactMembers | SlruKind::MultiXactOffsets => self.multixact,
            SlruKind::Csnlog => self.csnlog,
        }
    }
}

fn offset_to_blkno(offset: u64) -> Result<u32, SmgrError> {
    if offset % BLCKSZ as u64 != 0 || offset >= SLRU_SEG_SIZE as u64 {
        return Err(SmgrError::BadSlruOffset(offset));
    }
    Ok((offset / BLCKSZ as u64) as u32)
}

impl<C: PageServerApi, W: WalLog> NeonSmgr<C, W> {
    /// Whether the SLRU is read from the page server.
    pub fn slru_kind_check(&self, ctl: &SlruCtl) -> bool {
        ctl.kind()
            .map(|kind| self.remote_slru.is_remote(kind))
            .unwrap_or(false)
    }

    /// Read a page of an SLRU segment into `buf`. Returns false, leaving `buf`
    /// untouched, if the page does not exist.
    pub fn slru_read_page(
        &mut self,
        kind: SlruKind,
        segno: u32,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<bool, SmgrError> {
        crate::smgr::check_page_size(buf)?;
        let response = self.slru_request(kind, segno, offset, false)?;
        match (response.page_exists, response.page) {
            (true, Some(page)) => {
                buf.copy_from_slice(&page);
                Ok(true)
            }
            (true, None) => Err(PageStoreError::Protocol(format!(
                "page {offset} of {kind} segment {segno} exists but no page was sent"
            ))
            .into()),
            (false, _) => Ok(false),
        }
    }

    /// Check for a page of an SLRU segment without transferring it.
    pub fn slru_page_exists(
        &mut self,
        kind: SlruKind,
        segno: u32,
        offset: u64,
    ) -> Result<bool, SmgrError> {
        Ok(self.slru_request(kind, segno, offset, true)?.page_exists)
    }

    fn slru_request(
        &mut self,
        kind: SlruKind,
        segno: u32,
        offset: u64,
        check_exists_only: bool,
    ) -> Result<PagestreamGetSlruPageResponse, SmgrError> {
        if !self.remote_slru.is_remote(kind) {
            return Err(SmgrError::SlruNotRemote(kind));
        }
        let blkno = offset_to_blkno(offset)?;
        let hdr = self.request_hdr()?;
        let request = PagestreamFeMessage::GetSlruPage(PagestreamGetSlruPageRequest {
            hdr,
            kind,
            segno,
            blkno,
            check_exists_only,
        });
        match self.round_trip(request)? {
            PagestreamBeMessage::GetSlruPage(response) => {
                trace!(
                    "{kind} segment {segno} block {blkno}: segment exists {}, page exists {}",
                    response.seg_exists,
                    response.page_exists
                );
                Ok(response)
            }
            other => Err(PageStoreError::Protocol(format!(
                "unexpected {} response",
                other.kind()
            ))
            .into()),
        }
    }
}

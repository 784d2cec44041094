//! In-process page server speaking the pagestream protocol, for tests.
//!
//! Requests are decoded from the bytes the client writes and answered when the
//! client flushes. Each flushed batch is computed back to front, but the responses
//! are written in request order like a real server would.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::io::{self, Read, Write};
use std::rc::Rc;

use bytes::Bytes;
use pageserver_api::models::*;
use pageserver_api::reltag::{RelTag, SlruKind};
use postgres_ffi_types::constants::{BLCKSZ, DEFAULTTABLESPACE_OID};
use postgres_ffi_types::BlockNumber;
use utils::lsn::Lsn;

use crate::client::PageServerClient;
use crate::neon_smgr::WalLog;

/// A page with an invalid LSN and `fill` in its body.
pub(crate) fn test_page(fill: u8) -> Vec<u8> {
    let mut page = vec![fill; BLCKSZ as usize];
    page[..24].fill(0);
    page
}

pub(crate) fn test_rel(relnode: u32) -> RelTag {
    RelTag {
        spcnode: DEFAULTTABLESPACE_OID,
        dbnode: 5,
        relnode,
        forknum: 0,
    }
}

#[derive(Debug, Clone)]
pub(crate) struct LoggedRequest {
    pub request: PagestreamFeMessage,
    /// Responses already sent but not yet read by the client when this request
    /// arrived.
    pub unread_responses: usize,
}

struct RelState {
    created_at: Lsn,
    nblocks: BlockNumber,
}

#[derive(Default)]
struct State {
    from_client: Vec<u8>,
    to_client: VecDeque<u8>,
    response_ends: VecDeque<u64>,
    bytes_sent: u64,
    bytes_read: u64,

    last_lsn: Lsn,
    rels: HashMap<RelTag, RelState>,
    pages: HashMap<(RelTag, BlockNumber), BTreeMap<Lsn, Bytes>>,
    slru_segments: HashSet<(SlruKind, u32)>,
    slru_pages: HashMap<(SlruKind, u32, u32), Bytes>,

    fail_next: Option<String>,
    disconnected: bool,
    log: Vec<LoggedRequest>,
}

#[derive(Clone, Default)]
pub(crate) struct MockPageServer {
    state: Rc<RefCell<State>>,
}

pub(crate) struct MockReader(Rc<RefCell<State>>);
pub(crate) struct MockWriter(Rc<RefCell<State>>);

pub(crate) type MockClient = PageServerClient<MockReader, MockWriter>;

impl MockPageServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client(&self) -> MockClient {
        PageServerClient::new(
            MockReader(Rc::clone(&self.state)),
            MockWriter(Rc::clone(&self.state)),
        )
    }

    pub fn create_rel(&self, rel: RelTag, lsn: Lsn) {
        let mut state = self.state.borrow_mut();
        state.last_lsn = state.last_lsn.max(lsn);
        state.rels.insert(
            rel,
            RelState {
                created_at: lsn,
                nblocks: 0,
            },
        );
    }

    /// Store a version of a block, extending the relation if needed.
    pub fn put_page(&self, rel: RelTag, blkno: BlockNumber, lsn: Lsn, fill: u8) {
        let mut state = self.state.borrow_mut();
        state.last_lsn = state.last_lsn.max(lsn);
        let rel_state = state.rels.entry(rel).or_insert(RelState {
            created_at: lsn,
            nblocks: 0,
        });
        rel_state.nblocks = rel_state.nblocks.max(blkno + 1);
        state
            .pages
            .entry((rel, blkno))
            .or_default()
            .insert(lsn, Bytes::from(test_page(fill)));
    }

    pub fn set_nblocks(&self, rel: RelTag, nblocks: BlockNumber) {
        if let Some(rel_state) = self.state.borrow_mut().rels.get_mut(&rel) {
            rel_state.nblocks = nblocks;
        }
    }

    pub fn put_slru_page(&self, kind: SlruKind, segno: u32, blkno: u32, fill: u8) {
        let mut state = self.state.borrow_mut();
        state.slru_segments.insert((kind, segno));
        state
            .slru_pages
            .insert((kind, segno, blkno), Bytes::from(vec![fill; BLCKSZ as usize]));
    }

    pub fn put_slru_segment(&self, kind: SlruKind, segno: u32) {
        self.state.borrow_mut().slru_segments.insert((kind, segno));
    }

    /// Answer the next request with an ErrorResponse.
    pub fn fail_next(&self, message: &str) {
        self.state.borrow_mut().fail_next = Some(message.to_string());
    }

    /// Stop answering, the client sees end of stream.
    pub fn disconnect(&self) {
        self.state.borrow_mut().disconnected = true;
    }

    pub fn log(&self) -> Vec<LoggedRequest> {
        self.state.borrow().log.clone()
    }

    pub fn requests(&self) -> Vec<PagestreamFeMessage> {
        self.log().into_iter().map(|r| r.request).collect()
    }

    pub fn count(&self, kind: PagestreamRequestKind) -> usize {
        self.state
            .borrow()
            .log
            .iter()
            .filter(|r| r.request.kind() == kind)
            .count()
    }
}

impl State {
    fn unread_responses(&self) -> usize {
        self.response_ends
            .iter()
            .filter(|end| **end > self.bytes_read)
            .count()
    }

    fn process_batch(&mut self) {
        let mut requests = Vec::new();
        let mut consumed = 0;
        loop {
            let mut rest = &self.from_client[consumed..];
            if rest.is_empty() {
                break;
            }
            let before = rest.len();
            match PagestreamFeMessage::parse(&mut rest) {
                Ok(request) => {
                    consumed += before - rest.len();
                    requests.push(request);
                }
                Err(PagestreamDecodeError::Truncated { .. }) => break,
                Err(e) => panic!("client sent undecodable request: {e}"),
            }
        }
        self.from_client.drain(..consumed);

        if self.disconnected {
            return;
        }

        let unread = self.unread_responses();
        for request in &requests {
            self.log.push(LoggedRequest {
                request: request.clone(),
                unread_responses: unread,
            });
        }

        let mut responses = Vec::with_capacity(requests.len());
        // an injected failure belongs to the first request of the batch
        let fail = self.fail_next.take();
        for (i, request) in requests.iter().enumerate().rev() {
            let response = match (&fail, i) {
                (Some(message), 0) => PagestreamBeMessage::Error(PagestreamErrorResponse {
                    message: message.clone(),
                }),
                _ => self.respond(request),
            };
            responses.push(response);
        }
        for response in responses.into_iter().rev() {
            let bytes = response.serialize();
            self.to_client.extend(bytes.iter());
            self.bytes_sent += bytes.len() as u64;
            self.response_ends.push_back(self.bytes_sent);
        }
    }

    fn request_lsn(&self, hdr: &PagestreamRequestHeader) -> Lsn {
        if hdr.latest {
            self.last_lsn.max(hdr.lsn)
        } else {
            hdr.lsn
        }
    }

    fn visible_rel(&self, rel: &RelTag, lsn: Lsn) -> Option<&RelState> {
        self.rels.get(rel).filter(|r| r.created_at <= lsn)
    }

    fn respond(&self, request: &PagestreamFeMessage) -> PagestreamBeMessage {
        let lsn = self.request_lsn(request.hdr());
        let error = |message: String| PagestreamBeMessage::Error(PagestreamErrorResponse { message });
        match request {
            PagestreamFeMessage::Exists(req) => {
                PagestreamBeMessage::Exists(PagestreamExistsResponse {
                    lsn,
                    exists: self.visible_rel(&req.rel, lsn).is_some(),
                })
            }
            PagestreamFeMessage::Nblocks(req) => match self.visible_rel(&req.rel, lsn) {
                Some(rel) => PagestreamBeMessage::Nblocks(PagestreamNblocksResponse {
                    lsn,
                    n_blocks: rel.nblocks,
                }),
                None => error(format!("relation {} not found at {lsn}", req.rel)),
            },
            PagestreamFeMessage::GetPage(req) => {
                let version = self
                    .pages
                    .get(&(req.rel, req.blkno))
                    .and_then(|versions| versions.range(..=lsn).next_back());
                match (version, self.visible_rel(&req.rel, lsn)) {
                    (Some((_, page)), _) => PagestreamBeMessage::GetPage(PagestreamGetPageResponse {
                        lsn,
                        page: page.clone(),
                    }),
                    (None, Some(rel)) if req.blkno < rel.nblocks => {
                        PagestreamBeMessage::GetPage(PagestreamGetPageResponse {
                            lsn,
                            page: Bytes::from(vec![0u8; BLCKSZ as usize]),
                        })
                    }
                    _ => error(format!(
                        "could not find page {} of relation {} at {lsn}",
                        req.blkno, req.rel
                    )),
                }
            }
            PagestreamFeMessage::DbSize(req) => {
                let blocks: u64 = self
                    .rels
                    .iter()
                    .filter(|(rel, state)| rel.dbnode == req.dbnode && state.created_at <= lsn)
                    .map(|(_, state)| state.nblocks as u64)
                    .sum();
                PagestreamBeMessage::DbSize(PagestreamDbSizeResponse {
                    db_size: (blocks * BLCKSZ as u64) as i64,
                })
            }
            PagestreamFeMessage::GetSlruPage(req) => {
                let seg_exists = self.slru_segments.contains(&(req.kind, req.segno));
                let page = self.slru_pages.get(&(req.kind, req.segno, req.blkno));
                PagestreamBeMessage::GetSlruPage(PagestreamGetSlruPageResponse {
                    lsn,
                    seg_exists,
                    page_exists: page.is_some(),
                    page: if req.check_exists_only {
                        None
                    } else {
                        page.cloned()
                    },
                })
            }
        }
    }
}

impl Read for MockReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.0.borrow_mut();
        let n = buf.len().min(state.to_client.len());
        for (dst, src) in buf.iter_mut().zip(state.to_client.drain(..n)) {
            *dst = src;
        }
        state.bytes_read += n as u64;
        Ok(n)
    }
}

impl Write for MockWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().from_client.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.borrow_mut().process_batch();
        Ok(())
    }
}

/// Hands out increasing LSNs for logged pages and remembers what was flushed.
#[derive(Debug)]
pub(crate) struct MockWal {
    pub next_lsn: Lsn,
    pub flushed: Lsn,
    pub logged: Vec<(RelTag, BlockNumber)>,
    pub fail: bool,
}

impl Default for MockWal {
    fn default() -> Self {
        MockWal {
            next_lsn: Lsn(0x100),
            flushed: Lsn(0),
            logged: Vec::new(),
            fail: false,
        }
    }
}

impl WalLog for MockWal {
    fn log_page(&mut self, rel: RelTag, blkno: BlockNumber, _page: &[u8]) -> anyhow::Result<Lsn> {
        anyhow::ensure!(!self.fail, "WAL is full");
        self.logged.push((rel, blkno));
        self.next_lsn += 0x10;
        Ok(self.next_lsn)
    }

    fn flush(&mut self, upto: Lsn) -> anyhow::Result<()> {
        self.flushed = self.flushed.max(upto);
        Ok(())
    }
}

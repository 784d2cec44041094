//! The pagestream protocol spoken between the compute-side storage manager and the
//! page server.
//!
//! Every message is a tag byte followed by the variant's fields in a fixed order,
//! integers big-endian. There is no length envelope around a message: the reader
//! learns how many bytes to consume from the tag and the length fields inside the
//! variant, so messages can be read straight off a byte stream.

use std::fmt;
use std::io::Read;

use byteorder::{BigEndian, ReadBytesExt};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use postgres_ffi_types::constants::BLCKSZ;
use utils::lsn::Lsn;

use crate::reltag::{RelTag, SlruKind};

/// Size of the page payload in GetPage and GetSlruPage responses.
pub const PAGESTREAM_PAGE_SIZE: usize = BLCKSZ as usize;

#[derive(Debug, thiserror::Error)]
pub enum PagestreamDecodeError {
    #[error("unknown pagestream message tag {0}")]
    UnknownTag(u8),
    #[error("truncated {kind} message")]
    Truncated { kind: &'static str },
    #[error(
        "page payload of {kind} message is {actual} bytes, expected {}",
        PAGESTREAM_PAGE_SIZE
    )]
    InvalidPageLength { kind: &'static str, actual: usize },
    #[error("error message is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    #[error("unknown SLRU kind {0}")]
    InvalidSlruKind(u8),
    #[error("{remaining} trailing bytes after {kind} message")]
    TrailingBytes { kind: &'static str, remaining: usize },
    #[error("read {kind} message: {source}")]
    Io {
        kind: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl PagestreamDecodeError {
    fn from_io(kind: &'static str) -> impl Fn(std::io::Error) -> Self {
        move |source| {
            if source.kind() == std::io::ErrorKind::UnexpectedEof {
                PagestreamDecodeError::Truncated { kind }
            } else {
                PagestreamDecodeError::Io { kind, source }
            }
        }
    }
}

/// Request kinds. A successful response must be of the same kind as the request
/// that produced it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display, strum_macros::IntoStaticStr,
)]
pub enum PagestreamRequestKind {
    Exists,
    Nblocks,
    GetPage,
    DbSize,
    GetSlruPage,
}

// Wire values shared with the compute's C side
#[repr(u8)]
enum PagestreamFeMessageTag {
    Exists = 0,
    Nblocks = 1,
    GetPage = 2,
    DbSize = 3,
    GetSlruPage = 4,
}

impl TryFrom<u8> for PagestreamFeMessageTag {
    type Error = u8;
    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0 => Ok(PagestreamFeMessageTag::Exists),
            1 => Ok(PagestreamFeMessageTag::Nblocks),
            2 => Ok(PagestreamFeMessageTag::GetPage),
            3 => Ok(PagestreamFeMessageTag::DbSize),
            4 => Ok(PagestreamFeMessageTag::GetSlruPage),
            _ => Err(value),
        }
    }
}

#[repr(u8)]
enum PagestreamBeMessageTag {
    Exists = 100,
    Nblocks = 101,
    GetPage = 102,
    GetSlruPage = 103,
    Error = 104,
    DbSize = 105,
}

impl TryFrom<u8> for PagestreamBeMessageTag {
    type Error = u8;
    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            100 => Ok(PagestreamBeMessageTag::Exists),
            101 => Ok(PagestreamBeMessageTag::Nblocks),
            102 => Ok(PagestreamBeMessageTag::GetPage),
            103 => Ok(PagestreamBeMessageTag::GetSlruPage),
            104 => Ok(PagestreamBeMessageTag::Error),
            105 => Ok(PagestreamBeMessageTag::DbSize),
            _ => Err(value),
        }
    }
}

/// Fields common to all requests.
///
/// If `latest` is true, we are requesting the latest page version, and `lsn`
/// is just a hint to the server that we know there are no versions of the page
/// (or relation size, for exists/nblocks requests) later than the `lsn`.
/// Otherwise `lsn` selects the exact version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagestreamRequestHeader {
    pub latest: bool,
    pub lsn: Lsn,
    pub region: u8,
}

impl PagestreamRequestHeader {
    pub fn latest(lsn: Lsn) -> Self {
        PagestreamRequestHeader {
            latest: true,
            lsn,
            region: 0,
        }
    }

    pub fn at_lsn(lsn: Lsn) -> Self {
        PagestreamRequestHeader {
            latest: false,
            lsn,
            region: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagestreamExistsRequest {
    pub hdr: PagestreamRequestHeader,
    pub rel: RelTag,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagestreamNblocksRequest {
    pub hdr: PagestreamRequestHeader,
    pub rel: RelTag,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagestreamGetPageRequest {
    pub hdr: PagestreamRequestHeader,
    pub rel: RelTag,
    pub blkno: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagestreamDbSizeRequest {
    pub hdr: PagestreamRequestHeader,
    pub dbnode: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagestreamGetSlruPageRequest {
    pub hdr: PagestreamRequestHeader,
    pub kind: SlruKind,
    pub segno: u32,
    pub blkno: u32,
    /// Only report existence, the page payload is not sent back.
    pub check_exists_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagestreamExistsResponse {
    pub lsn: Lsn,
    pub exists: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagestreamNblocksResponse {
    pub lsn: Lsn,
    pub n_blocks: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagestreamGetPageResponse {
    pub lsn: Lsn,
    pub page: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagestreamGetSlruPageResponse {
    pub lsn: Lsn,
    pub seg_exists: bool,
    pub page_exists: bool,
    /// Absent for `check_exists_only` requests and for pages that don't exist.
    pub page: Option<Bytes>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagestreamErrorResponse {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagestreamDbSizeResponse {
    pub db_size: i64,
}

// Sent back to back on the pagestream connection, see the module docs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PagestreamFeMessage {
    Exists(PagestreamExistsRequest),
    Nblocks(PagestreamNblocksRequest),
    GetPage(PagestreamGetPageRequest),
    DbSize(PagestreamDbSizeRequest),
    GetSlruPage(PagestreamGetSlruPageRequest),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PagestreamBeMessage {
    Exists(PagestreamExistsResponse),
    Nblocks(PagestreamNblocksResponse),
    GetPage(PagestreamGetPageResponse),
    GetSlruPage(PagestreamGetSlruPageResponse),
    Error(PagestreamErrorResponse),
    DbSize(PagestreamDbSizeResponse),
}

fn put_hdr(bytes: &mut BytesMut, tag: PagestreamFeMessageTag, hdr: &PagestreamRequestHeader) {
    bytes.put_u8(tag as u8);
    bytes.put_u8(u8::from(hdr.latest));
    bytes.put_u64(hdr.lsn.0);
    bytes.put_u8(hdr.region);
}

fn put_rel(bytes: &mut BytesMut, rel: &RelTag) {
    bytes.put_u32(rel.spcnode);
    bytes.put_u32(rel.dbnode);
    bytes.put_u32(rel.relnode);
    bytes.put_u8(rel.forknum);
}

fn read_hdr<R: Read>(body: &mut R) -> std::io::Result<PagestreamRequestHeader> {
    Ok(PagestreamRequestHeader {
        latest: body.read_u8()? != 0,
        lsn: Lsn::from(body.read_u64::<BigEndian>()?),
        region: body.read_u8()?,
    })
}

fn read_rel<R: Read>(body: &mut R) -> std::io::Result<RelTag> {
    Ok(RelTag {
        spcnode: body.read_u32::<BigEndian>()?,
        dbnode: body.read_u32::<BigEndian>()?,
        relnode: body.read_u32::<BigEndian>()?,
        forknum: body.read_u8()?,
    })
}

fn read_page<R: Read>(body: &mut R) -> std::io::Result<Bytes> {
    let mut page = vec![0; PAGESTREAM_PAGE_SIZE];
    body.read_exact(&mut page)?;
    Ok(page.into())
}

/// Check that a complete message was consumed from `buf`.
fn ensure_consumed(
    kind: &'static str,
    remaining: &[u8],
) -> Result<(), PagestreamDecodeError> {
    if remaining.is_empty() {
        Ok(())
    } else {
        Err(PagestreamDecodeError::TrailingBytes {
            kind,
            remaining: remaining.len(),
        })
    }
}

impl PagestreamFeMessage {
    pub fn kind(&self) -> PagestreamRequestKind {
        match self {
            Self::Exists(_) => PagestreamRequestKind::Exists,
            Self::Nblocks(_) => PagestreamRequestKind::Nblocks,
            Self::GetPage(_) => PagestreamRequestKind::GetPage,
            Self::DbSize(_) => PagestreamRequestKind::DbSize,
            Self::GetSlruPage(_) => PagestreamRequestKind::GetSlruPage,
        }
    }

    pub fn hdr(&self) -> &PagestreamRequestHeader {
        match self {
            Self::Exists(req) => &req.hdr,
            Self::Nblocks(req) => &req.hdr,
            Self::GetPage(req) => &req.hdr,
            Self::DbSize(req) => &req.hdr,
            Self::GetSlruPage(req) => &req.hdr,
        }
    }

    pub fn serialize(&self) -> Bytes {
        let mut bytes = BytesMut::new();

        use PagestreamFeMessageTag as Tag;
        match self {
            Self::Exists(req) => {
                put_hdr(&mut bytes, Tag::Exists, &req.hdr);
                put_rel(&mut bytes, &req.rel);
            }

            Self::Nblocks(req) => {
                put_hdr(&mut bytes, Tag::Nblocks, &req.hdr);
                put_rel(&mut bytes, &req.rel);
            }

            Self::GetPage(req) => {
                put_hdr(&mut bytes, Tag::GetPage, &req.hdr);
                put_rel(&mut bytes, &req.rel);
                bytes.put_u32(req.blkno);
            }

            Self::DbSize(req) => {
                put_hdr(&mut bytes, Tag::DbSize, &req.hdr);
                bytes.put_u32(req.dbnode);
            }

            Self::GetSlruPage(req) => {
                put_hdr(&mut bytes, Tag::GetSlruPage, &req.hdr);
                bytes.put_u8(req.kind as u8);
                bytes.put_u32(req.segno);
                bytes.put_u32(req.blkno);
                bytes.put_u8(u8::from(req.check_exists_only));
            }
        }

        bytes.into()
    }

    /// Read one request from a byte stream.
    pub fn parse<R: Read>(body: &mut R) -> Result<PagestreamFeMessage, PagestreamDecodeError> {
        let msg_tag = body
            .read_u8()
            .map_err(PagestreamDecodeError::from_io("request"))?;
        Self::parse_with_tag(msg_tag, body)
    }

    /// Like [`Self::parse`], for when the caller has already consumed the tag byte.
    pub fn parse_with_tag<R: Read>(
        msg_tag: u8,
        body: &mut R,
    ) -> Result<PagestreamFeMessage, PagestreamDecodeError> {
        use PagestreamFeMessageTag as Tag;
        let tag = Tag::try_from(msg_tag).map_err(PagestreamDecodeError::UnknownTag)?;
        match tag {
            Tag::Exists => {
                let io_err = PagestreamDecodeError::from_io("Exists");
                Ok(Self::Exists(PagestreamExistsRequest {
                    hdr: read_hdr(body).map_err(&io_err)?,
                    rel: read_rel(body).map_err(&io_err)?,
                }))
            }
            Tag::Nblocks => {
                let io_err = PagestreamDecodeError::from_io("Nblocks");
                Ok(Self::Nblocks(PagestreamNblocksRequest {
                    hdr: read_hdr(body).map_err(&io_err)?,
                    rel: read_rel(body).map_err(&io_err)?,
                }))
            }
            Tag::GetPage => {
                let io_err = PagestreamDecodeError::from_io("GetPage");
                Ok(Self::GetPage(PagestreamGetPageRequest {
                    hdr: read_hdr(body).map_err(&io_err)?,
                    rel: read_rel(body).map_err(&io_err)?,
                    blkno: body.read_u32::<BigEndian>().map_err(&io_err)?,
                }))
            }
            Tag::DbSize => {
                let io_err = PagestreamDecodeError::from_io("DbSize");
                Ok(Self::DbSize(PagestreamDbSizeRequest {
                    hdr: read_hdr(body).map_err(&io_err)?,
                    dbnode: body.read_u32::<BigEndian>().map_err(&io_err)?,
                }))
            }
            Tag::GetSlruPage => {
                let io_err = PagestreamDecodeError::from_io("GetSlruPage");
                let hdr = read_hdr(body).map_err(&io_err)?;
                let kind = body.read_u8().map_err(&io_err)?;
                let kind =
                    SlruKind::try_from(kind).map_err(PagestreamDecodeError::InvalidSlruKind)?;
                Ok(Self::GetSlruPage(PagestreamGetSlruPageRequest {
                    hdr,
                    kind,
                    segno: body.read_u32::<BigEndian>().map_err(&io_err)?,
                    blkno: body.read_u32::<BigEndian>().map_err(&io_err)?,
                    check_exists_only: body.read_u8().map_err(&io_err)? != 0,
                }))
            }
        }
    }

    /// Decode a buffer that must hold exactly one request.
    pub fn deserialize(buf: Bytes) -> Result<Self, PagestreamDecodeError> {
        let mut buf = buf.reader();
        let msg = Self::parse(&mut buf)?;
        ensure_consumed(msg.kind().into(), buf.get_ref())?;
        Ok(msg)
    }
}

impl PagestreamBeMessage {
    pub fn serialize(&self) -> Bytes {
        let mut bytes = BytesMut::new();

        use PagestreamBeMessageTag as Tag;
        match self {
            Self::Exists(resp) => {
                bytes.put_u8(Tag::Exists as u8);
                bytes.put_u64(resp.lsn.0);
                bytes.put_u8(resp.exists as u8);
            }

            Self::Nblocks(resp) => {
                bytes.put_u8(Tag::Nblocks as u8);
                bytes.put_u64(resp.lsn.0);
                bytes.put_u32(resp.n_blocks);
            }

            Self::GetPage(resp) => {
                bytes.put_u8(Tag::GetPage as u8);
                bytes.put_u64(resp.lsn.0);
                bytes.put(&resp.page[..]);
            }

            Self::GetSlruPage(resp) => {
                bytes.put_u8(Tag::GetSlruPage as u8);
                bytes.put_u64(resp.lsn.0);
                bytes.put_u8(resp.seg_exists as u8);
                bytes.put_u8(resp.page_exists as u8);
                match &resp.page {
                    Some(page) => {
                        bytes.put_u32(page.len() as u32);
                        bytes.put(&page[..]);
                    }
                    None => bytes.put_u32(0),
                }
            }

            Self::Error(resp) => {
                bytes.put_u8(Tag::Error as u8);
                bytes.put_u32(resp.message.len() as u32);
                bytes.put(resp.message.as_bytes());
            }

            Self::DbSize(resp) => {
                bytes.put_u8(Tag::DbSize as u8);
                bytes.put_i64(resp.db_size);
            }
        }

        bytes.into()
    }

    /// Read one response from a byte stream.
    pub fn parse<R: Read>(body: &mut R) -> Result<Self, PagestreamDecodeError> {
        let msg_tag = body
            .read_u8()
            .map_err(PagestreamDecodeError::from_io("response"))?;
        Self::parse_with_tag(msg_tag, body)
    }

    /// Like [`Self::parse`], for when the caller has already consumed the tag byte.
    pub fn parse_with_tag<R: Read>(msg_tag: u8, body: &mut R) -> Result<Self, PagestreamDecodeError> {
        use PagestreamBeMessageTag as Tag;
        let tag = Tag::try_from(msg_tag).map_err(PagestreamDecodeError::UnknownTag)?;
        let ok = match tag {
            Tag::Exists => {
                let io_err = PagestreamDecodeError::from_io("Exists");
                Self::Exists(PagestreamExistsResponse {
                    lsn: Lsn(body.read_u64::<BigEndian>().map_err(&io_err)?),
                    exists: body.read_u8().map_err(&io_err)? != 0,
                })
            }
            Tag::Nblocks => {
                let io_err = PagestreamDecodeError::from_io("Nblocks");
                Self::Nblocks(PagestreamNblocksResponse {
                    lsn: Lsn(body.read_u64::<BigEndian>().map_err(&io_err)?),
                    n_blocks: body.read_u32::<BigEndian>().map_err(&io_err)?,
                })
            }
            Tag::GetPage => {
                let io_err = PagestreamDecodeError::from_io("GetPage");
                Self::GetPage(PagestreamGetPageResponse {
                    lsn: Lsn(body.read_u64::<BigEndian>().map_err(&io_err)?),
                    page: read_page(body).map_err(&io_err)?,
                })
            }
            Tag::GetSlruPage => {
                let io_err = PagestreamDecodeError::from_io("GetSlruPage");
                let lsn = Lsn(body.read_u64::<BigEndian>().map_err(&io_err)?);
                let seg_exists = body.read_u8().map_err(&io_err)? != 0;
                let page_exists = body.read_u8().map_err(&io_err)? != 0;
                let page_len = body.read_u32::<BigEndian>().map_err(&io_err)? as usize;
                let page = match page_len {
                    0 => None,
                    PAGESTREAM_PAGE_SIZE => Some(read_page(body).map_err(&io_err)?),
                    actual => {
                        return Err(PagestreamDecodeError::InvalidPageLength {
                            kind: "GetSlruPage",
                            actual,
                        })
                    }
                };
                Self::GetSlruPage(PagestreamGetSlruPageResponse {
                    lsn,
                    seg_exists,
                    page_exists,
                    page,
                })
            }
            Tag::Error => {
                let io_err = PagestreamDecodeError::from_io("Error");
                let len = body.read_u32::<BigEndian>().map_err(&io_err)? as usize;
                // Don't trust the length for preallocation, a corrupt stream could
                // claim gigabytes.
                let mut message = Vec::new();
                body.take(len as u64)
                    .read_to_end(&mut message)
                    .map_err(&io_err)?;
                if message.len() != len {
                    return Err(PagestreamDecodeError::Truncated { kind: "Error" });
                }
                Self::Error(PagestreamErrorResponse {
                    message: String::from_utf8(message)?,
                })
            }
            Tag::DbSize => {
                let io_err = PagestreamDecodeError::from_io("DbSize");
                Self::DbSize(PagestreamDbSizeResponse {
                    db_size: body.read_i64::<BigEndian>().map_err(&io_err)?,
                })
            }
        };
        Ok(ok)
    }

    /// Decode a buffer that must hold exactly one response.
    pub fn deserialize(buf: Bytes) -> Result<Self, PagestreamDecodeError> {
        let mut buf = buf.reader();
        let msg = Self::parse(&mut buf)?;
        ensure_consumed(msg.kind(), buf.get_ref())?;
        Ok(msg)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Exists(_) => "Exists",
            Self::Nblocks(_) => "Nblocks",
            Self::GetPage(_) => "GetPage",
            Self::GetSlruPage(_) => "GetSlruPage",
            Self::Error(_) => "Error",
            Self::DbSize(_) => "DbSize",
        }
    }

    /// The request kind this response answers, `None` for an ErrorResponse which
    /// can answer any request.
    pub fn request_kind(&self) -> Option<PagestreamRequestKind> {
        match self {
            Self::Exists(_) => Some(PagestreamRequestKind::Exists),
            Self::Nblocks(_) => Some(PagestreamRequestKind::Nblocks),
            Self::GetPage(_) => Some(PagestreamRequestKind::GetPage),
            Self::GetSlruPage(_) => Some(PagestreamRequestKind::GetSlruPage),
            Self::DbSize(_) => Some(PagestreamRequestKind::DbSize),
            Self::Error(_) => None,
        }
    }
}

/// Human-readable form of a request, used in log messages and errors.
impl fmt::Display for PagestreamFeMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hdr = self.hdr();
        write!(f, "{{\"type\": \"{}Request\"", self.kind())?;
        match self {
            Self::Exists(req) => write!(f, ", \"rel\": \"{}\"", req.rel)?,
            Self::Nblocks(req) => write!(f, ", \"rel\": \"{}\"", req.rel)?,
            Self::GetPage(req) => {
                write!(f, ", \"rel\": \"{}\", \"blkno\": {}", req.rel, req.blkno)?
            }
            Self::DbSize(req) => write!(f, ", \"dbnode\": {}", req.dbnode)?,
            Self::GetSlruPage(req) => write!(
                f,
                ", \"kind\": \"{}\", \"segno\": {}, \"blkno\": {}, \"check_exists_only\": {}",
                req.kind, req.segno, req.blkno, req.check_exists_only
            )?,
        }
        write!(
            f,
            ", \"latest\": {}, \"lsn\": \"{}\", \"region\": {}}}",
            hdr.latest, hdr.lsn, hdr.region
        )
    }
}

/// Human-readable form of a response. Page contents are not printed.
impl fmt::Display for PagestreamBeMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{\"type\": \"{}Response\"", self.kind())?;
        match self {
            Self::Exists(resp) => {
                write!(f, ", \"lsn\": \"{}\", \"exists\": {}", resp.lsn, resp.exists)?
            }
            Self::Nblocks(resp) => write!(
                f,
                ", \"lsn\": \"{}\", \"n_blocks\": {}",
                resp.lsn, resp.n_blocks
            )?,
            Self::GetPage(resp) => write!(
                f,
                ", \"lsn\": \"{}\", \"page\": \"<{} bytes>\"",
                resp.lsn,
                resp.page.len()
            )?,
            Self::GetSlruPage(resp) => write!(
                f,
                ", \"lsn\": \"{}\", \"seg_exists\": {}, \"page_exists\": {}, \"page\": \"<{} bytes>\"",
                resp.lsn,
                resp.seg_exists,
                resp.page_exists,
                resp.page.as_ref().map(|p| p.len()).unwrap_or(0)
            )?,
            Self::Error(resp) => write!(f, ", \"message\": {:?}", resp.message)?,
            Self::DbSize(resp) => write!(f, ", \"db_size\": {}", resp.db_size)?,
        }
        write!(f, "}}")
    }
}

//! Pipelined request/response channel to the page server.
//!
//! The pagestream protocol carries no request ids. The server answers requests
//! strictly in the order they were sent, so the client remembers the kind of
//! every request in flight and checks each response against the oldest one.

use std::collections::VecDeque;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};

use pageserver_api::models::{
    PagestreamBeMessage, PagestreamDecodeError, PagestreamFeMessage, PagestreamRequestKind,
};
use tracing::{debug, warn};

use crate::PageStoreError;

/// The operations the storage managers need from a page server connection.
pub trait PageServerApi {
    /// Queue a request. It is not necessarily transmitted until [`Self::flush`].
    fn send(&mut self, request: &PagestreamFeMessage) -> Result<(), PageStoreError>;

    /// Block for the response to the oldest outstanding request.
    ///
    /// An ErrorResponse from the server is returned as [`PageStoreError::Remote`].
    fn receive(&mut self) -> Result<PagestreamBeMessage, PageStoreError>;

    /// Push all queued requests to the server.
    fn flush(&mut self) -> Result<(), PageStoreError>;

    /// Send one request and wait for its response. Responses to any requests
    /// already outstanding must have been received first.
    fn request(
        &mut self,
        request: &PagestreamFeMessage,
    ) -> Result<PagestreamBeMessage, PageStoreError> {
        self.send(request)?;
        self.flush()?;
        self.receive()
    }
}

pub struct PageServerClient<R: Read, W: Write> {
    reader: BufReader<R>,
    writer: BufWriter<W>,
    inflight: VecDeque<PagestreamRequestKind>,
    unflushed: bool,
    broken: bool,
}

impl<R: Read, W: Write> PageServerClient<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        PageServerClient {
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
            inflight: VecDeque::new(),
            unflushed: false,
            broken: false,
        }
    }

    /// Number of requests sent whose response has not been received yet.
    pub fn inflight(&self) -> usize {
        self.inflight.len()
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    fn check_usable(&self) -> Result<(), PageStoreError> {
        if self.broken {
            Err(PageStoreError::ConnectionBroken)
        } else {
            Ok(())
        }
    }

    fn mark_broken(&mut self, err: PageStoreError) -> PageStoreError {
        warn!(
            "page server connection broken with {} requests in flight: {err}",
            self.inflight.len()
        );
        self.broken = true;
        err
    }

    fn io_error(&mut self, err: std::io::Error) -> PageStoreError {
        let err = match err.kind() {
            ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset | ErrorKind::BrokenPipe => {
                PageStoreError::ConnectionBroken
            }
            _ => PageStoreError::Io(err),
        };
        self.mark_broken(err)
    }
}

impl<R: Read, W: Write> PageServerApi for PageServerClient<R, W> {
    fn send(&mut self, request: &PagestreamFeMessage) -> Result<(), PageStoreError> {
        self.check_usable()?;
        debug!("sending {request}");
        if let Err(e) = self.writer.write_all(&request.serialize()) {
            return Err(self.io_error(e));
        }
        self.inflight.push_back(request.kind());
        self.unflushed = true;
        Ok(())
    }

    fn receive(&mut self) -> Result<PagestreamBeMessage, PageStoreError> {
        self.check_usable()?;
        let Some(expected) = self.inflight.front().copied() else {
            return Err(PageStoreError::Protocol(
                "receive called with no outstanding request".to_string(),
            ));
        };
        if self.unflushed {
            self.flush()?;
        }

        let mut tag = [0u8; 1];
        if let Err(e) = self.reader.read_exact(&mut tag) {
            return Err(self.io_error(e));
        }
        let response = match PagestreamBeMessage::parse_with_tag(tag[0], &mut self.reader) {
            Ok(response) => response,
            // the stream ended or failed inside a response, not a bad message
            Err(PagestreamDecodeError::Truncated { .. }) => {
                return Err(self.mark_broken(PageStoreError::ConnectionBroken))
            }
            Err(PagestreamDecodeError::Io { source, .. }) => return Err(self.io_error(source)),
            Err(e) => return Err(self.mark_broken(e.into())),
        };
        self.inflight.pop_front();

        match response.request_kind() {
            Some(kind) if kind == expected => {
                debug!("received {response}");
                Ok(response)
            }
            Some(_) => {
                let err = PageStoreError::Protocol(format!(
                    "expected response to {expected} request, got {} response",
                    response.kind()
                ));
                Err(self.mark_broken(err))
            }
            None => match response {
                PagestreamBeMessage::Error(e) => {
                    debug!("page server returned error for {expected} request: {}", e.message);
                    Err(PageStoreError::Remote { message: e.message })
                }
                _ => Err(self.mark_broken(PageStoreError::Protocol(format!(
                    "unexpected {} response",
                    response.kind()
                )))),
            },
        }
    }

    fn flush(&mut self) -> Result<(), PageStoreError> {
        self.check_usable()?;
        if let Err(e) = self.writer.flush() {
            return Err(self.io_error(e));
        }
        self.unflushed = false;
        Ok(())
    }
}

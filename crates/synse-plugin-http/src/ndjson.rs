//! Newline-delimited JSON parser
//!
//! The transaction status endpoint streams one JSON document per line.
//! Chunks from the body stream do not respect line boundaries, so bytes are
//! buffered until a full line is available.

use std::marker::PhantomData;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use tracing::trace;

use crate::error::HttpLinkError;

/// Incremental NDJSON decoder
#[derive(Debug)]
pub struct NdjsonParser<T> {
    /// Bytes of an incomplete line
    buffer: Vec<u8>,
    _item: PhantomData<fn() -> T>,
}

impl<T> Default for NdjsonParser<T> {
    fn default() -> Self {
        Self {
            buffer: Vec::new(),
            _item: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> NdjsonParser<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes and decode every line they complete
    pub fn feed(&mut self, bytes: Bytes) -> Vec<Result<T, HttpLinkError>> {
        self.buffer.extend_from_slice(&bytes);

        let mut items = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(item) = decode_line(&line[..line.len() - 1]) {
                items.push(item);
            }
        }
        items
    }

    /// Decode a trailing line that was not newline-terminated
    pub fn finish(&mut self) -> Option<Result<T, HttpLinkError>> {
        let rest = std::mem::take(&mut self.buffer);
        decode_line(&rest)
    }
}

fn decode_line<T: DeserializeOwned>(line: &[u8]) -> Option<Result<T, HttpLinkError>> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    if line.iter().all(u8::is_ascii_whitespace) {
        return None;
    }
    trace!(len = line.len(), "ndjson line");
    Some(serde_json::from_slice(line).map_err(|e| HttpLinkError::Decode(e.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use synse_core::{TransactionStatus, TransactionUpdate};

    #[test]
    fn parses_lines_split_across_chunks() {
        let mut parser = NdjsonParser::<TransactionUpdate>::new();
        assert!(parser.feed(Bytes::from_static(b"{\"status\":\"wri")).is_empty());

        let items = parser.feed(Bytes::from_static(b"ting\"}\n\n{\"status\":\"success\"}\r\n"));
        let statuses: Vec<_> = items.into_iter().map(|i| i.unwrap().status).collect();
        assert_eq!(
            statuses,
            vec![TransactionStatus::Writing, TransactionStatus::Success]
        );
        assert!(parser.finish().is_none());
    }

    #[test]
    fn trailing_line_without_newline() {
        let mut parser = NdjsonParser::<TransactionUpdate>::new();
        assert!(parser
            .feed(Bytes::from_static(b"{\"status\":\"failure\",\"context\":\"jammed\"}"))
            .is_empty());
        let update = parser.finish().unwrap().unwrap();
        assert_eq!(update, TransactionUpdate::failed("jammed"));
    }

    #[test]
    fn garbage_line_is_a_decode_error() {
        let mut parser = NdjsonParser::<TransactionUpdate>::new();
        let items = parser.feed(Bytes::from_static(b"not json\n"));
        assert!(matches!(items[0], Err(HttpLinkError::Decode(_))));
    }
}

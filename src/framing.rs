//! Line framing for requests.
//!
//! A request is one payload line followed by an empty line:
//!
//! ```text
//! <payload>\n\n
//! ```
//!
//! The server stops reading at the first empty or whitespace-only line,
//! or when the peer closes the stream first.

use crate::error::{Error, Result};
use bytes::BytesMut;
use std::io::{self, BufRead, Read, Write};

/// Default upper bound on a single request line.
pub const DEFAULT_MAX_LINE_BYTES: usize = 64 * 1024;

const LINE_TERMINATOR: &[u8] = b"\n";

/// Read chunk size used while draining a response.
const DRAIN_CHUNK: usize = 8 * 1024;

/// Reject payloads the server would split into several lines.
pub fn validate_payload(payload: &str) -> Result<()> {
    if payload.contains(['\n', '\r']) {
        return Err(Error::Argument(
            "payload must not contain line terminators".to_string(),
        ));
    }
    Ok(())
}

/// Write the payload line followed by the terminating blank line.
pub fn send_request<W: Write>(stream: &mut W, payload: &str) -> Result<()> {
    validate_payload(payload)?;
    write_request(stream, payload).map_err(|e| Error::connection("send request", e))
}

fn write_request<W: Write>(stream: &mut W, payload: &str) -> io::Result<()> {
    stream.write_all(payload.as_bytes())?;
    stream.write_all(LINE_TERMINATOR)?;
    stream.write_all(LINE_TERMINATOR)?;
    stream.flush()
}

/// Read everything the peer sends until it closes the stream.
///
/// A TLS peer that drops the connection without `close_notify` surfaces
/// as `UnexpectedEof`; that is treated as the end of the response.
pub fn drain<R: Read>(stream: &mut R) -> Result<BytesMut> {
    let mut received = BytesMut::with_capacity(DRAIN_CHUNK);
    let mut chunk = [0u8; DRAIN_CHUNK];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => received.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(Error::connection("read response", e)),
        }
    }

    Ok(received)
}

/// Lazily read request lines until the blank-line terminator.
pub fn read_request<R: BufRead>(reader: R) -> RequestLines<R> {
    RequestLines::new(reader, DEFAULT_MAX_LINE_BYTES)
}

/// Iterator over the lines of a single request.
///
/// Yields each payload line with its terminator stripped. Ends at the
/// first blank line (which is not yielded), at end of stream, or after
/// the first error.
#[derive(Debug)]
pub struct RequestLines<R> {
    reader: R,
    max_line_bytes: usize,
    buf: Vec<u8>,
    done: bool,
}

impl<R: BufRead> RequestLines<R> {
    pub fn new(reader: R, max_line_bytes: usize) -> Self {
        Self {
            reader,
            max_line_bytes,
            buf: Vec::with_capacity(256),
            done: false,
        }
    }

    fn next_line(&mut self) -> Result<Option<String>> {
        self.buf.clear();
        let limit = self.max_line_bytes as u64 + LINE_TERMINATOR.len() as u64;
        let n = (&mut self.reader)
            .take(limit + 1)
            .read_until(b'\n', &mut self.buf)
            .map_err(|e| Error::connection("read request", e))?;

        if n == 0 {
            return Ok(None);
        }

        let line = strip_terminator(&self.buf);
        if line.len() > self.max_line_bytes {
            return Err(Error::Framing(format!(
                "request line exceeds {} bytes",
                self.max_line_bytes
            )));
        }

        let line = String::from_utf8_lossy(line);
        if line.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(line.into_owned()))
    }
}

impl<R: BufRead> Iterator for RequestLines<R> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_line() {
            Ok(Some(line)) => Some(Ok(line)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

fn strip_terminator(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn lines(input: &[u8]) -> Vec<String> {
        read_request(Cursor::new(input.to_vec()))
            .collect::<Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn test_send_request_wire_format() {
        let mut out = Vec::new();
        send_request(&mut out, "hello").unwrap();
        assert_eq!(out, b"hello\n\n");
    }

    #[test]
    fn test_round_trip_single_line() {
        let mut wire = Vec::new();
        send_request(&mut wire, "hello").unwrap();
        assert_eq!(lines(&wire), vec!["hello".to_string()]);
    }

    #[test]
    fn test_stops_at_blank_line() {
        assert_eq!(lines(b"one\ntwo\n\nignored\n"), vec!["one", "two"]);
    }

    #[test]
    fn test_whitespace_line_terminates() {
        assert_eq!(lines(b"one\n \t \ntwo\n"), vec!["one"]);
    }

    #[test]
    fn test_crlf_terminators() {
        assert_eq!(lines(b"hello\r\n\r\n"), vec!["hello"]);
    }

    #[test]
    fn test_eof_without_blank_line() {
        assert_eq!(lines(b"partial"), vec!["partial"]);
        assert_eq!(lines(b"a\nb\n"), vec!["a", "b"]);
        assert!(lines(b"").is_empty());
    }

    #[test]
    fn test_reader_positioned_after_terminator() {
        let mut cursor = Cursor::new(b"hello\n\nrest".to_vec());
        let mut request = RequestLines::new(&mut cursor, DEFAULT_MAX_LINE_BYTES);
        assert_eq!(request.next().unwrap().unwrap(), "hello");
        assert!(request.next().is_none());
        assert!(request.next().is_none());
        assert_eq!(cursor.position(), 7);
    }

    #[test]
    fn test_line_too_long() {
        let mut input = vec![b'x'; 32];
        input.extend_from_slice(b"\n\n");
        let mut request = RequestLines::new(Cursor::new(input), 16);
        assert!(matches!(request.next(), Some(Err(Error::Framing(_)))));
        assert!(request.next().is_none());
    }

    #[test]
    fn test_line_at_limit_is_accepted() {
        let mut input = vec![b'x'; 16];
        input.extend_from_slice(b"\r\n\r\n");
        let got: Vec<_> = RequestLines::new(Cursor::new(input), 16)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(got, vec!["x".repeat(16)]);
    }

    #[test]
    fn test_invalid_utf8_is_lossy() {
        assert_eq!(lines(b"a\xffb\n\n"), vec!["a\u{fffd}b"]);
    }

    #[test]
    fn test_rejects_embedded_terminators() {
        let mut out = Vec::new();
        assert!(matches!(
            send_request(&mut out, "two\nlines"),
            Err(Error::Argument(_))
        ));
        assert!(validate_payload("carriage\rreturn").is_err());
        assert!(out.is_empty());
    }

    #[test]
    fn test_drain_reads_to_end() {
        let mut cursor = Cursor::new(b"Content-Length: 3\nabc".to_vec());
        let data = drain(&mut cursor).unwrap();
        assert_eq!(&data[..], b"Content-Length: 3\nabc");
    }

    struct AbruptClose {
        served: bool,
    }

    impl Read for AbruptClose {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.served {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "no close_notify"));
            }
            self.served = true;
            buf[..4].copy_from_slice(b"done");
            Ok(4)
        }
    }

    #[test]
    fn test_drain_tolerates_unexpected_eof() {
        let data = drain(&mut AbruptClose { served: false }).unwrap();
        assert_eq!(&data[..], b"done");
    }
}

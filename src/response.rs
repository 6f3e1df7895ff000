//! Response composition.
//!
//! A response is a header line built from a template with exactly one
//! `{0}` slot, followed by the content bytes. The slot receives the byte
//! length of the content:
//!
//! ```text
//! template: Content-Length: {0}
//! content:  abc
//! wire:     Content-Length: 3\nabc
//! ```
//!
//! `{{` and `}}` in the template are literal braces.

use crate::error::{Error, Result};
use bytes::Bytes;
use std::io::{self, Write};
use std::path::PathBuf;

/// Default header template file, relative to the working directory.
pub const DEFAULT_HEADER_FILE: &str = "response_header.txt";

/// Default content file, relative to the working directory.
pub const DEFAULT_CONTENT_FILE: &str = "response_content.txt";

/// A parsed header template with its single length slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderTemplate {
    before: String,
    after: String,
}

impl HeaderTemplate {
    /// Parse a template, requiring exactly one `{0}` slot.
    pub fn parse(template: &str) -> Result<Self> {
        let mut before = String::with_capacity(template.len());
        let mut after = String::new();
        let mut slots = 0usize;
        let mut chars = template.char_indices().peekable();

        while let Some((pos, c)) = chars.next() {
            let out = if slots == 0 { &mut before } else { &mut after };
            match c {
                '{' if matches!(chars.peek(), Some((_, '{'))) => {
                    chars.next();
                    out.push('{');
                }
                '}' if matches!(chars.peek(), Some((_, '}'))) => {
                    chars.next();
                    out.push('}');
                }
                '{' => {
                    let mut inner = String::new();
                    let mut closed = false;
                    for (_, c) in chars.by_ref() {
                        if c == '}' {
                            closed = true;
                            break;
                        }
                        inner.push(c);
                    }
                    if !closed {
                        return Err(Error::Template(format!(
                            "unterminated placeholder at offset {pos}"
                        )));
                    }
                    if inner.trim() != "0" {
                        return Err(Error::Template(format!(
                            "unsupported placeholder '{{{inner}}}' at offset {pos}"
                        )));
                    }
                    slots += 1;
                }
                '}' => {
                    return Err(Error::Template(format!(
                        "unmatched '}}' at offset {pos}"
                    )));
                }
                other => out.push(other),
            }
        }

        match slots {
            1 => Ok(Self { before, after }),
            0 => Err(Error::Template(
                "template has no '{0}' length placeholder".to_string(),
            )),
            n => Err(Error::Template(format!(
                "template has {n} placeholders, expected exactly one"
            ))),
        }
    }

    /// Render the header for a content of `content_length` bytes.
    pub fn render(&self, content_length: usize) -> String {
        format!("{}{}{}", self.before, content_length, self.after)
    }
}

/// A framed response ready to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub header: String,
    pub content: Bytes,
}

impl Response {
    /// Length value carried by the header.
    pub fn content_length(&self) -> usize {
        self.content.len()
    }
}

/// Substitute the content's byte length into the template.
pub fn compose_response(header_template: &str, content: impl Into<Bytes>) -> Result<Response> {
    let template = HeaderTemplate::parse(header_template)?;
    let content = content.into();
    Ok(Response {
        header: template.render(content.len()),
        content,
    })
}

/// Write header, line terminator, then content verbatim.
///
/// The caller closes the stream afterwards.
pub fn write_response<W: Write>(stream: &mut W, response: &Response) -> Result<()> {
    write_parts(stream, response).map_err(|e| Error::connection("write response", e))
}

fn write_parts<W: Write>(stream: &mut W, response: &Response) -> io::Result<()> {
    stream.write_all(response.header.as_bytes())?;
    stream.write_all(b"\n")?;
    stream.write_all(&response.content)?;
    stream.flush()
}

/// Where the server gets its header template and content from.
#[derive(Debug, Clone)]
pub enum ResponseSource {
    /// Read both files every time a response is composed.
    Files { header: PathBuf, content: PathBuf },
    /// Composed once at startup and reused for every connection.
    Preloaded(Response),
}

impl ResponseSource {
    /// Source reading the given files on every request.
    pub fn files(header: impl Into<PathBuf>, content: impl Into<PathBuf>) -> Self {
        ResponseSource::Files {
            header: header.into(),
            content: content.into(),
        }
    }

    /// Read and validate the files now, keeping the result for the process lifetime.
    pub fn preload(header: impl Into<PathBuf>, content: impl Into<PathBuf>) -> Result<Self> {
        let source = Self::files(header, content);
        Ok(ResponseSource::Preloaded(source.response()?))
    }

    /// Produce the response for one connection.
    pub fn response(&self) -> Result<Response> {
        match self {
            ResponseSource::Preloaded(response) => Ok(response.clone()),
            ResponseSource::Files { header, content } => {
                let template = std::fs::read_to_string(header).map_err(|e| {
                    Error::Template(format!("cannot read '{}': {e}", header.display()))
                })?;
                let body = std::fs::read(content).map_err(|e| {
                    Error::Template(format!("cannot read '{}': {e}", content.display()))
                })?;
                compose_response(&template, body)
            }
        }
    }
}

impl Default for ResponseSource {
    fn default() -> Self {
        Self::files(DEFAULT_HEADER_FILE, DEFAULT_CONTENT_FILE)
    }
}

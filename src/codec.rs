//! IMAP line framing and wire types
//!
//! Implements the RFC 3501 lexical grammar needed for commands and
//! status/data responses: atoms, quoted strings, parenthesized lists,
//! and counted literals (`{n}\r\n` followed by exactly `n` bytes, with
//! `{n+}` as the non-synchronizing LITERAL+ form).
//!
//! [`ImapStream`] frames one socket for one role. In the server role
//! it announces `+` continuations when a client sends a synchronizing
//! literal; in the client role literals in responses are read as plain
//! data. Lexical errors are recoverable: the offending line is fully
//! consumed, the caller answers `BAD`, and the stream stays usable.

use std::io;

use bytes::BytesMut;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::{Error, Result};

const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Maximum line length to prevent memory exhaustion.
const MAX_LINE_LENGTH: usize = 1024 * 1024; // 1 MB

/// Maximum literal size to prevent memory exhaustion.
const MAX_LITERAL_SIZE: usize = 64 * 1024 * 1024; // 64 MB

/// One lexical field of a command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    Atom(String),
    Quoted(String),
    Literal(Vec<u8>),
    List(Vec<Field>),
}

impl Field {
    /// The field as text, for arguments that may arrive as an atom, a
    /// quoted string, or a UTF-8 literal.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Atom(s) | Self::Quoted(s) => Some(s),
            Self::Literal(bytes) => std::str::from_utf8(bytes).ok(),
            Self::List(_) => None,
        }
    }
}

/// Status response condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    Ok,
    No,
    Bad,
    Bye,
    Preauth,
}

impl StatusKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::No => "NO",
            Self::Bad => "BAD",
            Self::Bye => "BYE",
            Self::Preauth => "PREAUTH",
        }
    }

    fn from_atom(atom: &str) -> Option<Self> {
        if atom.eq_ignore_ascii_case("OK") {
            Some(Self::Ok)
        } else if atom.eq_ignore_ascii_case("NO") {
            Some(Self::No)
        } else if atom.eq_ignore_ascii_case("BAD") {
            Some(Self::Bad)
        } else if atom.eq_ignore_ascii_case("BYE") {
            Some(Self::Bye)
        } else if atom.eq_ignore_ascii_case("PREAUTH") {
            Some(Self::Preauth)
        } else {
            None
        }
    }
}

/// A status response: `<tag|*> <kind> [code args] info`.
#[derive(Debug, Clone)]
pub struct StatusResponse {
    /// `None` writes the untagged `*` form.
    pub tag: Option<String>,
    pub kind: StatusKind,
    /// Optional bracketed response code, e.g. `[CAPABILITY ...]`.
    pub code: Option<(String, Vec<String>)>,
    pub info: Option<String>,
}

impl StatusResponse {
    pub fn tagged(tag: impl Into<String>, kind: StatusKind, info: impl Into<String>) -> Self {
        Self {
            tag: Some(tag.into()),
            kind,
            code: None,
            info: Some(info.into()),
        }
    }

    pub fn untagged(kind: StatusKind, info: impl Into<String>) -> Self {
        Self {
            tag: None,
            kind,
            code: None,
            info: Some(info.into()),
        }
    }

    pub fn bye(info: impl Into<String>) -> Self {
        Self::untagged(StatusKind::Bye, info)
    }

    #[must_use]
    pub fn with_code(mut self, name: impl Into<String>, args: Vec<String>) -> Self {
        self.code = Some((name.into(), args));
        self
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.extend_from_slice(self.tag.as_deref().unwrap_or("*").as_bytes());
        buf.extend_from_slice(b" ");
        buf.extend_from_slice(self.kind.as_str().as_bytes());
        if let Some((name, args)) = &self.code {
            buf.extend_from_slice(b" [");
            buf.extend_from_slice(name.as_bytes());
            for arg in args {
                buf.extend_from_slice(b" ");
                buf.extend_from_slice(arg.as_bytes());
            }
            buf.extend_from_slice(b"]");
        }
        if let Some(info) = &self.info {
            if !info.is_empty() {
                buf.extend_from_slice(b" ");
                buf.extend_from_slice(info.as_bytes());
            }
        }
        buf.extend_from_slice(b"\r\n");
    }
}

/// An untagged data response: `* <name> fields...`.
#[derive(Debug, Clone)]
pub struct DataResponse {
    pub name: String,
    pub fields: Vec<String>,
}

impl DataResponse {
    pub fn new(name: impl Into<String>, fields: Vec<String>) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.extend_from_slice(b"* ");
        buf.extend_from_slice(self.name.as_bytes());
        for field in &self.fields {
            buf.extend_from_slice(b" ");
            buf.extend_from_slice(field.as_bytes());
        }
        buf.extend_from_slice(b"\r\n");
    }
}

/// A client command for the upstream side: `<tag> <name> args...`.
#[derive(Debug, Clone)]
pub struct Command {
    pub tag: String,
    pub name: String,
    pub args: Vec<String>,
}

impl Command {
    fn encode(&self, buf: &mut BytesMut) {
        buf.extend_from_slice(self.tag.as_bytes());
        buf.extend_from_slice(b" ");
        buf.extend_from_slice(self.name.as_bytes());
        for arg in &self.args {
            buf.extend_from_slice(b" ");
            buf.extend_from_slice(arg.as_bytes());
        }
        buf.extend_from_slice(b"\r\n");
    }
}

/// A server response as seen by the client role, reduced to what an
/// authentication exchange needs to dispatch on.
#[derive(Debug)]
pub enum Response {
    Status { tag: String, kind: StatusKind },
    Data { name: String },
    Continuation { payload: String },
}

/// Framed IMAP reader/writer over one socket.
pub struct ImapStream<S> {
    reader: BufReader<S>,
    /// Server role: emit `+` continuations for synchronizing literals.
    announce_continuations: bool,
    out: BytesMut,
}

impl<S> ImapStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Frame a downstream (server-role) socket.
    pub fn server(stream: S) -> Self {
        Self::new(stream, true)
    }

    /// Frame an upstream (client-role) socket.
    pub fn client(stream: S) -> Self {
        Self::new(stream, false)
    }

    fn new(stream: S, announce_continuations: bool) -> Self {
        Self {
            reader: BufReader::with_capacity(DEFAULT_BUFFER_SIZE, stream),
            announce_continuations,
            out: BytesMut::with_capacity(256),
        }
    }

    /// Read one complete command line as typed fields.
    ///
    /// Returns `Ok(None)` on clean EOF before a new line. Lexical
    /// errors consume the offending line and return [`Error::Parse`].
    pub async fn read_line(&mut self) -> Result<Option<Vec<Field>>> {
        let Some(mut line) = self.read_physical_line(true).await? else {
            return Ok(None);
        };

        let mut parser = LineParser::new();
        loop {
            match parser.feed(strip_crlf(&line))? {
                Feed::Literal { len, sync } => {
                    if sync && self.announce_continuations {
                        self.write_continuation("").await?;
                    }
                    let mut data = vec![0u8; len];
                    self.reader.read_exact(&mut data).await?;
                    parser.push_literal(data);
                    // The command line continues after the literal.
                    line = self.read_physical_line(false).await?.ok_or_else(|| {
                        Error::Io(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "connection closed inside command",
                        ))
                    })?;
                }
                Feed::Done => break,
            }
        }
        parser.finish().map(Some)
    }

    /// Read one raw response line, e.g. a base64 SASL exchange.
    ///
    /// Returns the line without its CRLF; `Ok(None)` on clean EOF.
    pub async fn read_auth_line(&mut self) -> Result<Option<Vec<u8>>> {
        match self.read_physical_line(true).await? {
            None => Ok(None),
            Some(mut line) => {
                line.truncate(line.len() - 2);
                Ok(Some(line))
            }
        }
    }

    /// Read and classify one server response (client role).
    pub async fn read_response(&mut self) -> Result<Response> {
        let fields = self
            .read_line()
            .await?
            .ok_or_else(|| Error::Protocol("connection closed".into()))?;
        interpret_response(fields)
    }

    pub async fn write_status(&mut self, resp: &StatusResponse) -> Result<()> {
        self.out.clear();
        resp.encode(&mut self.out);
        self.flush_out().await
    }

    pub async fn write_data(&mut self, resp: &DataResponse) -> Result<()> {
        self.out.clear();
        resp.encode(&mut self.out);
        self.flush_out().await
    }

    /// Write a `+` continuation request.
    pub async fn write_continuation(&mut self, text: &str) -> Result<()> {
        self.out.clear();
        self.out.extend_from_slice(b"+ ");
        self.out.extend_from_slice(text.as_bytes());
        self.out.extend_from_slice(b"\r\n");
        self.flush_out().await
    }

    pub async fn write_command(&mut self, cmd: &Command) -> Result<()> {
        self.out.clear();
        cmd.encode(&mut self.out);
        self.flush_out().await
    }

    /// Unwrap to the raw socket plus any bytes read past the last
    /// parsed line. The relay takes over from here; the leftover must
    /// be forwarded ahead of anything read afterwards.
    pub fn into_parts(self) -> (S, Vec<u8>) {
        let leftover = self.reader.buffer().to_vec();
        (self.reader.into_inner(), leftover)
    }

    async fn flush_out(&mut self) -> Result<()> {
        let Self { reader, out, .. } = self;
        let stream = reader.get_mut();
        stream.write_all(out.as_ref()).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Read one CRLF-terminated line, including the CRLF.
    ///
    /// `allow_eof` permits a clean EOF before the first byte.
    async fn read_physical_line(&mut self, allow_eof: bool) -> Result<Option<Vec<u8>>> {
        let mut line = Vec::new();
        loop {
            let buf = self.reader.fill_buf().await?;
            if buf.is_empty() {
                if line.is_empty() && allow_eof {
                    return Ok(None);
                }
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed mid-line",
                )));
            }

            if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                line.extend_from_slice(&buf[..=pos]);
                self.reader.consume(pos + 1);
                if line.len() > MAX_LINE_LENGTH {
                    return Err(Error::Parse("line too long".into()));
                }
                if line.len() < 2 || line[line.len() - 2] != b'\r' {
                    return Err(Error::Parse("line not CRLF-terminated".into()));
                }
                return Ok(Some(line));
            }

            let n = buf.len();
            line.extend_from_slice(buf);
            self.reader.consume(n);
            if line.len() > MAX_LINE_LENGTH {
                return Err(Error::Parse("line too long".into()));
            }
        }
    }
}

fn strip_crlf(line: &[u8]) -> &[u8] {
    &line[..line.len() - 2]
}

fn interpret_response(fields: Vec<Field>) -> Result<Response> {
    let mut fields = fields.into_iter();
    let Some(Field::Atom(first)) = fields.next() else {
        return Err(Error::Parse("malformed response".into()));
    };

    if first == "+" {
        let payload = fields
            .filter_map(|f| f.as_text().map(str::to_owned))
            .collect::<Vec<_>>()
            .join(" ");
        return Ok(Response::Continuation { payload });
    }

    let Some(Field::Atom(second)) = fields.next() else {
        return Err(Error::Parse("truncated response".into()));
    };

    match StatusKind::from_atom(&second) {
        Some(kind) => Ok(Response::Status { tag: first, kind }),
        None if first == "*" => Ok(Response::Data { name: second }),
        None => Err(Error::Parse("malformed response".into())),
    }
}

enum Feed {
    /// The line ends with a literal announcement; the caller reads the
    /// bytes, then feeds the continuation line.
    Literal { len: usize, sync: bool },
    Done,
}

/// Lexer state for one command line, kept across literal continuations.
struct LineParser {
    /// Depth 1 is the top-level field list; deeper entries are open
    /// parenthesized lists.
    stack: Vec<Vec<Field>>,
}

impl LineParser {
    fn new() -> Self {
        Self {
            stack: vec![Vec::new()],
        }
    }

    fn feed(&mut self, bytes: &[u8]) -> Result<Feed> {
        let mut i = 0;
        while i < bytes.len() {
            match bytes[i] {
                b' ' => i += 1,
                b'(' => {
                    self.stack.push(Vec::new());
                    i += 1;
                }
                b')' => {
                    if self.stack.len() < 2 {
                        return Err(Error::Parse("unexpected )".into()));
                    }
                    let list = self.stack.pop().unwrap_or_default();
                    self.push(Field::List(list));
                    i += 1;
                }
                b'"' => i = self.feed_quoted(bytes, i)?,
                b'{' => {
                    let (len, sync) = parse_literal_announcement(&bytes[i..])?;
                    return Ok(Feed::Literal { len, sync });
                }
                _ => i = self.feed_atom(bytes, i)?,
            }
        }
        Ok(Feed::Done)
    }

    fn feed_quoted(&mut self, bytes: &[u8], start: usize) -> Result<usize> {
        let mut value = Vec::new();
        let mut i = start + 1;
        loop {
            match bytes.get(i) {
                None => return Err(Error::Parse("unterminated quoted string".into())),
                Some(b'"') => break,
                Some(b'\\') => {
                    let Some(&escaped) = bytes.get(i + 1) else {
                        return Err(Error::Parse("unterminated quoted string".into()));
                    };
                    value.push(escaped);
                    i += 2;
                }
                Some(&c) => {
                    value.push(c);
                    i += 1;
                }
            }
        }
        let value = String::from_utf8(value)
            .map_err(|_| Error::Parse("quoted string is not UTF-8".into()))?;
        self.push(Field::Quoted(value));
        Ok(i + 1)
    }

    fn feed_atom(&mut self, bytes: &[u8], start: usize) -> Result<usize> {
        let mut end = start;
        while end < bytes.len() && !matches!(bytes[end], b' ' | b'(' | b')' | b'"' | b'{') {
            end += 1;
        }
        let atom = std::str::from_utf8(&bytes[start..end])
            .map_err(|_| Error::Parse("atom is not UTF-8".into()))?;
        self.push(Field::Atom(atom.to_string()));
        Ok(end)
    }

    fn push(&mut self, field: Field) {
        if let Some(top) = self.stack.last_mut() {
            top.push(field);
        }
    }

    fn push_literal(&mut self, data: Vec<u8>) {
        self.push(Field::Literal(data));
    }

    fn finish(mut self) -> Result<Vec<Field>> {
        if self.stack.len() != 1 {
            return Err(Error::Parse("unbalanced parentheses".into()));
        }
        Ok(self.stack.pop().unwrap_or_default())
    }
}

/// Parse `{n}` or `{n+}` occupying the rest of the line.
fn parse_literal_announcement(bytes: &[u8]) -> Result<(usize, bool)> {
    let close = bytes
        .iter()
        .position(|&b| b == b'}')
        .ok_or_else(|| Error::Parse("unterminated literal".into()))?;
    if close + 1 != bytes.len() {
        return Err(Error::Parse("literal must end the line".into()));
    }

    let inner = &bytes[1..close];
    let (digits, sync) = match inner.last() {
        Some(b'+') => (&inner[..inner.len() - 1], false),
        _ => (inner, true),
    };

    let len: usize = std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::Parse("bad literal length".into()))?;
    if len > MAX_LITERAL_SIZE {
        return Err(Error::Parse("literal too large".into()));
    }
    Ok((len, sync))
}

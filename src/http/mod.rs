pub mod handler;

use std::{
    io::{self, BufRead, Read},
    num::ParseIntError,
};

use chrono::{DateTime, Utc};
use flate2::read::{MultiGzDecoder, ZlibDecoder};
use serde::Serialize;
use thiserror::Error;

pub use handler::HttpTrafficHandler;

/// Upper bound for a request or status line plus all header lines.
pub const MAX_HEAD_SIZE: usize = 64 * 1024;
const MAX_HEADERS: usize = 128;
const MAX_PREALLOC: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("end of stream")]
    Eof,
    #[error("unexpected end of stream")]
    UnexpectedEof,
    #[error("read failed: {0}")]
    Io(#[from] io::Error),
    #[error("malformed message head: {0}")]
    Parse(#[from] httparse::Error),
    #[error("incomplete message head")]
    Partial,
    #[error("message head exceeds {MAX_HEAD_SIZE} bytes")]
    HeadTooLarge,
    #[error("invalid content length {value:?}: {source}")]
    InvalidContentLength {
        value: String,
        #[source]
        source: ParseIntError,
    },
    #[error("invalid chunk: {0}")]
    InvalidChunk(String),
}

impl HttpError {
    /// The stream ended, cleanly or in the middle of a message.
    pub fn is_eof(&self) -> bool {
        match self {
            HttpError::Eof | HttpError::UnexpectedEof => true,
            HttpError::Io(e) => e.kind() == io::ErrorKind::UnexpectedEof,
            _ => false,
        }
    }
}

/// Fields shared by requests and responses.
#[derive(Clone, Debug, Serialize)]
pub struct HttpEntry {
    pub time: DateTime<Utc>,
    pub stream: u64,
    pub data: String,
    pub version: String,
    pub headers: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Destination {
    pub ip: String,
    pub port: u16,
}

#[derive(Clone, Debug, Serialize)]
pub struct HttpRequest {
    #[serde(flatten)]
    pub entry: HttpEntry,
    pub method: String,
    pub path: String,
    pub query: String,
    pub destination: Destination,
}

#[derive(Clone, Debug, Serialize)]
pub struct HttpResponse {
    #[serde(flatten)]
    pub entry: HttpEntry,
    pub code: u16,
}

/// A request and, when one was seen, its response.
#[derive(Clone, Debug, Serialize)]
pub struct HttpTransaction {
    pub request: HttpRequest,
    pub response: Option<HttpResponse>,
}

/// Receives every completed transaction.
pub trait TransactionProcessor: Send + Sync {
    fn process(&self, transaction: HttpTransaction);
}

impl<F> TransactionProcessor for F
where
    F: Fn(HttpTransaction) + Send + Sync,
{
    fn process(&self, transaction: HttpTransaction) {
        self(transaction)
    }
}

/// A request as read off the wire.
#[derive(Debug)]
pub struct Req {
    pub method: String,
    pub target: String,
    pub version: u8,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// A response as read off the wire.
#[derive(Debug)]
pub struct Resp {
    pub version: u8,
    pub code: u16,
    pub reason: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Req {
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn expects_continue(&self) -> bool {
        self.header("Expect")
            .is_some_and(|v| v.eq_ignore_ascii_case("100-continue"))
    }

    /// True for a WebSocket handshake request.
    pub fn is_websocket_upgrade(&self) -> bool {
        self.header("Upgrade")
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("websocket"))
    }

    pub fn into_request(
        self,
        time: DateTime<Utc>,
        stream: u64,
        destination: Destination,
    ) -> HttpRequest {
        let (path, query) = match self.target.split_once('?') {
            Some((path, query)) => (path, query),
            None => (self.target.as_str(), ""),
        };

        let path = if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("http://{}{}", self.header("Host").unwrap_or_default(), path)
        };

        HttpRequest {
            entry: HttpEntry {
                time,
                stream,
                data: body_text(&self.headers, &self.body),
                version: format!("HTTP/1.{}", self.version),
                headers: header_lines(&self.headers),
            },
            method: self.method.clone(),
            path,
            query: query.to_string(),
            destination,
        }
    }
}

impl Resp {
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn into_response(self, time: DateTime<Utc>, stream: u64) -> HttpResponse {
        HttpResponse {
            entry: HttpEntry {
                time,
                stream,
                data: body_text(&self.headers, &self.body),
                version: format!("HTTP/1.{}", self.version),
                headers: header_lines(&self.headers),
            },
            code: self.code,
        }
    }
}

/// Parse the request head and read its body completely, so the reader is
/// left at the start of the next request.
pub fn parse_request<R: BufRead>(reader: &mut R) -> Result<Req, HttpError> {
    let mut req = parse_request_head(reader)?;
    req.body = read_request_body(reader, &req.headers)?;
    Ok(req)
}

/// Parse only the request line and headers. The body, if any, is still
/// unread and must be consumed with [`read_request_body`].
pub fn parse_request_head<R: BufRead>(reader: &mut R) -> Result<Req, HttpError> {
    let head = read_head(reader)?;

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed_req = httparse::Request::new(&mut headers);
    if parsed_req.parse(&head)?.is_partial() {
        return Err(HttpError::Partial);
    }

    let req = Req {
        method: parsed_req.method.ok_or(HttpError::Partial)?.to_string(),
        target: parsed_req.path.ok_or(HttpError::Partial)?.to_string(),
        version: parsed_req.version.ok_or(HttpError::Partial)?,
        headers: collect_headers(parsed_req.headers),
        body: Vec::new(),
    };

    Ok(req)
}

/// Read the request body announced by `headers`. Requests without framing
/// headers have no body.
pub fn read_request_body<R: BufRead>(
    reader: &mut R,
    headers: &[(String, String)],
) -> Result<Vec<u8>, HttpError> {
    if is_chunked(headers) {
        read_chunked_body(reader)
    } else if let Some(content_length) = get_content_length(headers)? {
        read_sized_body(reader, content_length)
    } else {
        Ok(Vec::new())
    }
}

/// Parse a response to a request made with `request_method`, body included.
pub fn parse_response<R: BufRead>(
    reader: &mut R,
    request_method: &str,
) -> Result<Resp, HttpError> {
    let head = read_head(reader)?;

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed_resp = httparse::Response::new(&mut headers);
    if parsed_resp.parse(&head)?.is_partial() {
        return Err(HttpError::Partial);
    }

    let mut resp = Resp {
        version: parsed_resp.version.ok_or(HttpError::Partial)?,
        code: parsed_resp.code.ok_or(HttpError::Partial)?,
        reason: parsed_resp.reason.map(|r| r.to_string()),
        headers: collect_headers(parsed_resp.headers),
        body: Vec::new(),
    };

    let bodiless = request_method.eq_ignore_ascii_case("HEAD")
        || (100..200).contains(&resp.code)
        || resp.code == 204
        || resp.code == 304;

    if bodiless {
        return Ok(resp);
    }

    resp.body = if is_chunked(&resp.headers) {
        read_chunked_body(reader)?
    } else if let Some(content_length) = get_content_length(&resp.headers)? {
        read_sized_body(reader, content_length)?
    } else {
        let mut body = Vec::new();
        reader.read_to_end(&mut body)?;
        body
    };

    Ok(resp)
}

fn read_head<R: BufRead>(reader: &mut R) -> Result<Vec<u8>, HttpError> {
    let mut head = Vec::new();

    loop {
        let mut line = Vec::new();
        let limit = (MAX_HEAD_SIZE + 1 - head.len()) as u64;
        let n = reader.by_ref().take(limit).read_until(b'\n', &mut line)?;

        if n == 0 {
            return Err(if head.is_empty() {
                HttpError::Eof
            } else {
                HttpError::UnexpectedEof
            });
        }

        let blank = line == b"\r\n" || line == b"\n";
        if blank && head.is_empty() {
            continue;
        }

        head.extend_from_slice(&line);
        if head.len() > MAX_HEAD_SIZE {
            return Err(HttpError::HeadTooLarge);
        }
        if blank {
            return Ok(head);
        }
    }
}

fn read_line<R: BufRead>(reader: &mut R) -> Result<String, HttpError> {
    let mut line = Vec::new();
    let n = reader
        .by_ref()
        .take(MAX_HEAD_SIZE as u64)
        .read_until(b'\n', &mut line)?;

    if n == 0 || line.last() != Some(&b'\n') {
        return Err(HttpError::UnexpectedEof);
    }

    Ok(String::from_utf8_lossy(&line).trim_end().to_string())
}

fn read_sized_body<R: BufRead>(reader: &mut R, len: usize) -> Result<Vec<u8>, HttpError> {
    let mut body = Vec::with_capacity(len.min(MAX_PREALLOC));
    reader.by_ref().take(len as u64).read_to_end(&mut body)?;

    if body.len() < len {
        return Err(HttpError::UnexpectedEof);
    }

    Ok(body)
}

fn read_chunked_body<R: BufRead>(reader: &mut R) -> Result<Vec<u8>, HttpError> {
    let mut body = Vec::new();

    loop {
        let line = read_line(reader)?;
        let size = line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size, 16)
            .map_err(|_| HttpError::InvalidChunk(line.clone()))?;

        if size == 0 {
            // trailers
            while !read_line(reader)?.is_empty() {}
            return Ok(body);
        }

        body.extend_from_slice(&read_sized_body(reader, size)?);

        let end = read_line(reader)?;
        if !end.is_empty() {
            return Err(HttpError::InvalidChunk(end));
        }
    }
}

fn collect_headers(headers: &[httparse::Header]) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|h| {
            (
                h.name.to_string(),
                String::from_utf8_lossy(h.value).into_owned(),
            )
        })
        .collect()
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn is_chunked(headers: &[(String, String)]) -> bool {
    find_header(headers, "Transfer-Encoding")
        .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
}

fn get_content_length(headers: &[(String, String)]) -> Result<Option<usize>, HttpError> {
    match find_header(headers, "Content-Length") {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|source| HttpError::InvalidContentLength {
                value: value.to_string(),
                source,
            }),
        None => Ok(None),
    }
}

fn header_lines(headers: &[(String, String)]) -> Vec<String> {
    headers
        .iter()
        .map(|(name, value)| format!("{name}: {value}"))
        .collect()
}

fn body_text(headers: &[(String, String)], body: &[u8]) -> String {
    let decoded = find_header(headers, "Content-Encoding")
        .and_then(|encoding| unzip_content(encoding, body).ok());

    match decoded {
        Some(decoded) => String::from_utf8_lossy(&decoded).into_owned(),
        None => String::from_utf8_lossy(body).into_owned(),
    }
}

fn unzip_content(encoding: &str, buf: &[u8]) -> io::Result<Vec<u8>> {
    let encoding = encoding.to_ascii_lowercase();
    let mut out = Vec::new();

    if encoding.contains("gzip") {
        MultiGzDecoder::new(buf).read_to_end(&mut out)?;
    } else if encoding.contains("deflate") {
        ZlibDecoder::new(buf).read_to_end(&mut out)?;
    } else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unknown encoding {encoding}"),
        ));
    }

    Ok(out)
}

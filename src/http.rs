//! Just enough HTTP/1.0 to carry the CONNECT upgrade and the registry
//! exchanges. Heads are read byte-at-a-time so a hijacked connection never
//! buffers past the blank line into the RPC framing that follows.

use std::io::{self, Read, Write};

use may::net::TcpStream;

pub(crate) struct RequestHead {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
}

pub(crate) struct ResponseHead {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// Read one `\n`-terminated line, stripping the line ending.
fn read_line<R: Read>(reader: &mut R) -> io::Result<String> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        reader.read_exact(&mut byte)?;
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
        if line.len() > 8 * 1024 {
            return Err(invalid("http line too long"));
        }
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    String::from_utf8(line).map_err(|_| invalid("http line is not utf-8"))
}

fn read_headers<R: Read>(reader: &mut R) -> io::Result<Vec<(String, String)>> {
    let mut headers = Vec::new();
    loop {
        let line = read_line(reader)?;
        if line.is_empty() {
            return Ok(headers);
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| invalid(format!("malformed http header: {line}")))?;
        headers.push((name.trim().to_owned(), value.trim().to_owned()));
    }
}

pub(crate) fn read_request_head<R: Read>(reader: &mut R) -> io::Result<RequestHead> {
    let line = read_line(reader)?;
    let mut parts = line.split_whitespace();
    let method = parts.next().ok_or_else(|| invalid("empty request line"))?;
    let path = parts
        .next()
        .ok_or_else(|| invalid(format!("malformed request line: {line}")))?;
    Ok(RequestHead {
        method: method.to_owned(),
        path: path.to_owned(),
        headers: read_headers(reader)?,
    })
}

pub(crate) fn read_response_head<R: Read>(reader: &mut R) -> io::Result<ResponseHead> {
    let line = read_line(reader)?;
    let rest = line
        .strip_prefix("HTTP/")
        .and_then(|r| r.split_once(' '))
        .map(|(_version, rest)| rest)
        .ok_or_else(|| invalid(format!("malformed status line: {line}")))?;
    let (code, reason) = match rest.split_once(' ') {
        Some((code, reason)) => (code, reason),
        None => (rest, ""),
    };
    let status = code
        .parse::<u16>()
        .map_err(|_| invalid(format!("malformed status code: {line}")))?;
    Ok(ResponseHead {
        status,
        reason: reason.to_owned(),
        headers: read_headers(reader)?,
    })
}

pub(crate) fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Write a complete HTTP/1.0 response; the connection closes afterwards.
pub(crate) fn write_response<W: Write>(
    writer: &mut W,
    status_line: &str,
    headers: &[(&str, &str)],
    body: &str,
) -> io::Result<()> {
    let mut head = format!("HTTP/1.0 {status_line}\r\n");
    for (name, value) in headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    if !body.is_empty() {
        head.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    head.push_str("\r\n");
    head.push_str(body);
    writer.write_all(head.as_bytes())?;
    writer.flush()
}

/// Split `http://host:port/path` (scheme optional) into host and path.
pub(crate) fn split_url(url: &str) -> io::Result<(&str, &str)> {
    let rest = url.strip_prefix("http://").unwrap_or(url);
    if rest.is_empty() {
        return Err(invalid(format!("malformed url: {url}")));
    }
    Ok(match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    })
}

/// One-shot GET, returning the response head. Used by the registry-backed
/// discovery; all useful payload travels in headers.
pub(crate) fn get(url: &str) -> io::Result<ResponseHead> {
    let (host, path) = split_url(url)?;
    let mut stream = TcpStream::connect(host)?;
    stream.write_all(format!("GET {path} HTTP/1.0\r\nHost: {host}\r\n\r\n").as_bytes())?;
    let head = read_response_head(&mut stream)?;
    if head.status != 200 {
        return Err(invalid(format!("GET {url}: status {}", head.status)));
    }
    Ok(head)
}

/// One-shot POST with extra headers and no body. Used by heartbeats.
pub(crate) fn post(url: &str, headers: &[(&str, &str)]) -> io::Result<()> {
    let (host, path) = split_url(url)?;
    let mut stream = TcpStream::connect(host)?;
    let mut req = format!("POST {path} HTTP/1.0\r\nHost: {host}\r\n");
    for (name, value) in headers {
        req.push_str(&format!("{name}: {value}\r\n"));
    }
    req.push_str("\r\n");
    stream.write_all(req.as_bytes())?;
    let head = read_response_head(&mut stream)?;
    if head.status != 200 {
        return Err(invalid(format!("POST {url}: status {}", head.status)));
    }
    Ok(())
}

// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory RTSP messages and their wire form.
//!
//! [RFC 2326 section 4](https://datatracker.ietf.org/doc/html/rfc2326#section-4)
//! messages look like HTTP/1.1: a start line, a header block terminated by an
//! empty line, and an optional body whose length is given by
//! `Content-Length` (in bytes, not characters). Line endings are exactly
//! `\r\n`. The parsing half here is line-oriented; the incremental state
//! machine that feeds it lives in `client::parse`.

use bytes::{BufMut, Bytes, BytesMut};

use crate::headers::HeaderStore;

/// A client- or server-initiated RTSP request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    method: String,
    uri: String,
    version: String,
    pub headers: HeaderStore,
    body: Option<Bytes>,
}

impl Request {
    /// Creates a request with the default `1.0` version and no headers.
    ///
    /// `uri` is an absolute RTSP URI or `"*"`; a `"*"` target is substituted
    /// with the presentation's own URI at submission time.
    pub fn new(method: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            uri: uri.into(),
            version: "1.0".to_owned(),
            headers: HeaderStore::new(),
            body: None,
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub(crate) fn set_uri(&mut self, uri: impl Into<String>) {
        self.uri = uri.into();
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub(crate) fn set_version(&mut self, version: impl Into<String>) {
        self.version = version.into();
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    pub fn set_body(&mut self, body: Bytes) {
        self.body = Some(body);
    }

    /// Returns the `CSeq` header as an integer, if present and parseable.
    pub fn cseq(&self) -> Option<u32> {
        u32::from_str_radix(self.headers.get("CSeq")?.trim(), 10).ok()
    }

    /// Serialises to wire form, stamping `Content-Length` from the body
    /// length first when a body is present.
    pub fn serialise(&mut self) -> Bytes {
        if let Some(b) = &self.body {
            self.headers.set("Content-Length", b.len().to_string());
        }
        let mut dst = BytesMut::with_capacity(128);
        dst.put_slice(self.method.as_bytes());
        dst.put_u8(b' ');
        dst.put_slice(self.uri.as_bytes());
        dst.put_slice(b" RTSP/");
        dst.put_slice(self.version.as_bytes());
        dst.put_slice(b"\r\n");
        self.headers.serialise(&mut dst);
        dst.put_slice(b"\r\n");
        if let Some(b) = &self.body {
            dst.put_slice(b);
        }
        dst.freeze()
    }
}

/// An RTSP response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    version: String,
    status: u16,
    reason: String,
    pub headers: HeaderStore,
    body: Option<Bytes>,
}

impl Response {
    pub fn new(status: u16, reason: impl Into<String>) -> Self {
        Self {
            version: "1.0".to_owned(),
            status,
            reason: reason.into(),
            headers: HeaderStore::new(),
            body: None,
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub(crate) fn set_version(&mut self, version: impl Into<String>) {
        self.version = version.into();
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Returns true for a 2xx status.
    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    pub fn set_body(&mut self, body: Bytes) {
        self.body = Some(body);
    }

    pub fn cseq(&self) -> Option<u32> {
        u32::from_str_radix(self.headers.get("CSeq")?.trim(), 10).ok()
    }

    pub fn serialise(&mut self) -> Bytes {
        if let Some(b) = &self.body {
            self.headers.set("Content-Length", b.len().to_string());
        }
        let mut dst = BytesMut::with_capacity(128);
        dst.put_slice(b"RTSP/");
        dst.put_slice(self.version.as_bytes());
        dst.put_u8(b' ');
        dst.put_slice(self.status.to_string().as_bytes());
        dst.put_u8(b' ');
        dst.put_slice(self.reason.as_bytes());
        dst.put_slice(b"\r\n");
        self.headers.serialise(&mut dst);
        dst.put_slice(b"\r\n");
        if let Some(b) = &self.body {
            dst.put_slice(b);
        }
        dst.freeze()
    }
}

/// Either kind of fully assembled incoming message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Message {
    Request(Request),
    Response(Response),
}

/// A classified start line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum StartLine {
    Request {
        method: String,
        uri: String,
        version: String,
    },
    Response {
        version: String,
        status: u16,
        reason: String,
    },
}

impl StartLine {
    /// Classifies one start line (without its terminating CRLF).
    ///
    /// The line is split on spaces, at most three ways. A first token shaped
    /// `RTSP/<major>.<minor>` makes it a status line; a third token shaped so
    /// makes it a server-initiated request line; anything else is malformed.
    pub(crate) fn parse(line: &str) -> Result<Self, String> {
        let mut parts = line.splitn(3, ' ');
        let first = parts.next().unwrap_or("");
        let second = parts.next();
        let third = parts.next();
        if let Some(version) = rtsp_version(first) {
            let code = second.ok_or_else(|| format!("status line {line:?} has no code"))?;
            let status = u16::from_str_radix(code, 10)
                .map_err(|_| format!("status line {line:?} has non-numeric code {code:?}"))?;
            return Ok(StartLine::Response {
                version: version.to_owned(),
                status,
                reason: third.unwrap_or("").to_owned(),
            });
        }
        if let Some(version) = third.and_then(rtsp_version) {
            if first.is_empty() {
                return Err(format!("request line {line:?} has an empty method"));
            }
            return Ok(StartLine::Request {
                method: first.to_owned(),
                uri: second.unwrap_or("").to_owned(),
                version: version.to_owned(),
            });
        }
        Err(format!("can't classify start line {line:?}"))
    }
}

/// Returns the numeric part of a `RTSP/<major>.<minor>` token, or `None` if
/// the token isn't shaped that way.
fn rtsp_version(token: &str) -> Option<&str> {
    let rest = token.strip_prefix("RTSP/")?;
    let (major, minor) = rest.split_once('.')?;
    let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    (digits(major) && digits(minor)).then_some(rest)
}

/// Parses a header block (everything between the start line and the blank
/// line, with the final `\r\n` still attached) into `dst`.
///
/// A line beginning with a space or tab continues the previous header's
/// value; the continuation is appended as-is, so a value wrapped as
/// `"a,\r\n b"` unfolds back to `"a, b"`.
pub(crate) fn parse_header_block(block: &str, dst: &mut HeaderStore) -> Result<(), String> {
    let mut logical: Vec<String> = Vec::new();
    for line in block.split("\r\n") {
        if line.is_empty() {
            continue;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            match logical.last_mut() {
                Some(prev) => prev.push_str(line),
                None => return Err(format!("header block begins with continuation {line:?}")),
            }
        } else {
            logical.push(line.to_owned());
        }
    }
    for line in logical {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| format!("header line {line:?} has no colon"))?;
        if name.is_empty() {
            return Err(format!("header line {line:?} has an empty name"));
        }
        let value = value.strip_prefix(' ').unwrap_or(value);
        if value.is_empty() {
            dst.add_empty(name);
        } else {
            dst.add(name, value);
        }
    }
    Ok(())
}

/// Reads the `Content-Length` header of an assembled header block, treating
/// absence as zero.
pub(crate) fn content_length(headers: &HeaderStore) -> Result<usize, String> {
    match headers.get("Content-Length") {
        None => Ok(0),
        Some(v) => usize::from_str_radix(v.trim(), 10)
            .map_err(|_| format!("bad Content-Length {v:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_status_line() {
        assert_eq!(
            StartLine::parse("RTSP/1.0 200 OK").unwrap(),
            StartLine::Response {
                version: "1.0".to_owned(),
                status: 200,
                reason: "OK".to_owned(),
            }
        );
        // Multi-word reasons ride in the third token.
        assert_eq!(
            StartLine::parse("RTSP/1.0 454 Session Not Found").unwrap(),
            StartLine::Response {
                version: "1.0".to_owned(),
                status: 454,
                reason: "Session Not Found".to_owned(),
            }
        );
    }

    #[test]
    fn classify_request_line() {
        assert_eq!(
            StartLine::parse("ANNOUNCE rtsp://h/a RTSP/1.0").unwrap(),
            StartLine::Request {
                method: "ANNOUNCE".to_owned(),
                uri: "rtsp://h/a".to_owned(),
                version: "1.0".to_owned(),
            }
        );
    }

    #[test]
    fn classify_malformed() {
        StartLine::parse("").unwrap_err();
        StartLine::parse("GET / HTTP/1.1").unwrap_err();
        StartLine::parse("RTSP/1.0 abc OK").unwrap_err();
        StartLine::parse("RTSP/1. 200 OK").unwrap_err();
        StartLine::parse("just some text").unwrap_err();
    }

    #[test]
    fn request_serialises_with_content_length() {
        let mut r = Request::new("SET_PARAMETER", "rtsp://h/a");
        r.headers.add("CSeq", "3");
        r.set_body(Bytes::from_static(b"volume: 0.5\r\n"));
        let wire = r.serialise();
        assert_eq!(
            &wire[..],
            b"SET_PARAMETER rtsp://h/a RTSP/1.0\r\n\
              CSeq: 3\r\n\
              Content-Length: 13\r\n\
              \r\n\
              volume: 0.5\r\n"
                .as_slice()
        );
    }

    #[test]
    fn response_serialises() {
        let mut r = Response::new(200, "OK");
        r.headers.add("CSeq", "3");
        assert_eq!(&r.serialise()[..], b"RTSP/1.0 200 OK\r\nCSeq: 3\r\n\r\n");
        assert!(r.is_ok());
        assert!(!Response::new(454, "Session Not Found").is_ok());
    }

    #[test]
    fn header_block_unfolds() {
        let mut h = HeaderStore::new();
        parse_header_block(
            "CSeq: 2\r\nPublic: DESCRIBE,\r\n SETUP, PLAY\r\n", &mut h,
        )
        .unwrap();
        assert_eq!(h.get("cseq"), Some("2"));
        assert_eq!(h.get("public"), Some("DESCRIBE, SETUP, PLAY"));
    }

    #[test]
    fn header_block_rejects_garbage() {
        let mut h = HeaderStore::new();
        parse_header_block(" leading continuation\r\n", &mut h).unwrap_err();
        parse_header_block("no colon here\r\n", &mut h).unwrap_err();
        parse_header_block(": empty name\r\n", &mut h).unwrap_err();
    }

    #[test]
    fn content_length_defaults_to_zero() {
        let mut h = HeaderStore::new();
        assert_eq!(content_length(&h).unwrap(), 0);
        h.add("Content-Length", "17");
        assert_eq!(content_length(&h).unwrap(), 17);
        h.set("content_length", "x");
        content_length(&h).unwrap_err();
    }
}

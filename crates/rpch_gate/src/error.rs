// SPDX-FileCopyrightText: 2023 Jade Lovelace
//
// SPDX-License-Identifier: MPL-2.0

//! Error taxonomy and the canonical short error pages.

use std::fmt;
use std::io;

/// An HTTP status for the wire, possibly carrying an internal 4-digit code.
///
/// The 4-digit codes map to their leading three digits on the wire but keep a
/// distinct reason phrase, so a plugin-sourced 503 can be told apart from an
/// allocator-sourced one in the logs.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct HttpStatus(pub u16);

impl HttpStatus {
    pub const BAD_REQUEST: HttpStatus = HttpStatus(400);
    pub const UNAUTHORIZED: HttpStatus = HttpStatus(401);
    pub const NOT_FOUND: HttpStatus = HttpStatus(404);
    pub const METHOD_NOT_ALLOWED: HttpStatus = HttpStatus(405);
    pub const REQUEST_TIMEOUT: HttpStatus = HttpStatus(408);
    pub const URI_TOO_LONG: HttpStatus = HttpStatus(414);
    pub const SERVICE_UNAVAILABLE: HttpStatus = HttpStatus(503);
    /// 416 with its own reason phrase.
    pub const TOO_MANY_RANGES: HttpStatus = HttpStatus(4162);
    /// 503 raised by the gateway itself when a buffer or channel cannot be
    /// allocated.
    pub const RESOURCES_EXHAUSTED: HttpStatus = HttpStatus(5032);
    /// 504 raised when a FastCGI-style handler misses its deadline.
    pub const FCGI_TIMEOUT: HttpStatus = HttpStatus(5042);

    /// The three-digit code that goes on the wire.
    pub fn wire_code(self) -> u16 {
        if self.0 >= 1000 {
            self.0 / 10
        } else {
            self.0
        }
    }

    pub fn reason(self) -> &'static str {
        match self.0 {
            304 => "Not Modified",
            400 => "Bad Request",
            403 => "Permission Denied",
            404 => "Not Found",
            405 => "Method Not Allowed",
            414 => "URI Too Long",
            416 => "Range Not Satisfiable",
            4162 => "Too Many Ranges",
            501 => "Not Implemented",
            502 => "Bad FCGI Gateway",
            503 => "Service Unavailable",
            5032 => "Resources Exhausted",
            5042 => "FCGI Timeout",
            408 => "Request Timeout",
            401 => "Unauthorized",
            _ => "Internal Server Error",
        }
    }
}

impl fmt::Debug for HttpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.0, self.reason())
    }
}

impl fmt::Display for HttpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Renders the canonical short error page for `status`.
///
/// Plain text body, `Connection: close` since an errored tunnel is always
/// terminated, `Date` per RFC 1123.
pub fn error_page(status: HttpStatus) -> String {
    let msg = status.reason();
    format!(
        "HTTP/1.1 {} {}\r\n\
         Date: {}\r\n\
         Content-Length: {}\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         Connection: close\r\n\
         \r\n{}\r\n",
        status.wire_code(),
        msg,
        rfc1123_now(),
        msg.len() + 2,
        msg
    )
}

/// The current time in RFC 1123 form, for `Date:` headers.
pub fn rfc1123_now() -> String {
    chrono::Utc::now()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

/// Errors surfaced by gateway startup; per-tunnel failures never reach this
/// type, they become error pages or closed transports.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("tls setup: {0}")]
    Tls(#[from] openssl::error::ErrorStack),
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("bad configuration: {0}")]
    Config(String),
}

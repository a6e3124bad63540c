// SPDX-FileCopyrightText: 2023 Jade Lovelace
//
// SPDX-License-Identifier: MPL-2.0

//! Request-line and header parsing.
//!
//! Only the subset needed to route RPC-over-HTTP and the content-handler
//! surface is understood; everything else is retained verbatim for the
//! handlers. The parser is linewise and deliberately tolerant: leading blank
//! lines before the request line, padded field names, repeated Cookie
//! headers.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::error::HttpStatus;

/// Longest accepted request URI, after rewriting. At the limit is fine, one
/// byte over is a 414.
pub const URI_LIMIT: usize = 1024;

/// Longest accepted request method.
pub const METHOD_LIMIT: usize = 31;

/// Rewrites a request URI before it is checked and routed. Returning `None`
/// leaves the URI as received.
pub trait UriRewriter: Send + Sync {
    fn rewrite(&self, uri: &str) -> Option<String>;
}

impl<F> UriRewriter for F
where
    F: Fn(&str) -> Option<String> + Send + Sync,
{
    fn rewrite(&self, uri: &str) -> Option<String> {
        self(uri)
    }
}

/// A parsed request head.
#[derive(Clone, Debug, Default)]
pub struct HttpRequest {
    pub method: String,
    pub version: String,
    pub uri: String,
    /// Host header with any `:port` suffix split off; `[v6]` brackets kept
    /// out of the stored name.
    pub host: String,
    pub user_agent: String,
    pub accept: String,
    pub accept_language: String,
    pub accept_encoding: String,
    pub content_type: String,
    pub content_length: String,
    pub transfer_encoding: String,
    /// Repeated Cookie headers concatenated with ", ".
    pub cookie: String,
    /// Everything else, verbatim, for the content handlers.
    pub others: HashMap<String, String>,
}

impl HttpRequest {
    pub fn clear(&mut self) {
        self.method.clear();
        self.version.clear();
        self.uri.clear();
        self.host.clear();
        self.user_agent.clear();
        self.accept.clear();
        self.accept_language.clear();
        self.accept_encoding.clear();
        self.content_type.clear();
        self.content_length.clear();
        self.transfer_encoding.clear();
        self.cookie.clear();
        self.others.clear();
    }

    /// Case-insensitive lookup in the retained header map.
    pub fn other(&self, name: &str) -> Option<&str> {
        self.others
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_length(&self) -> u64 {
        self.content_length.trim().parse().unwrap_or(0)
    }

    /// Re-serializes the request line. Identity with parsing for well-formed
    /// input.
    pub fn request_line(&self) -> String {
        format!("{} {} HTTP/{}", self.method, self.uri, self.version)
    }

    /// Decoded `Authorization: Basic` credentials, if present and decodable.
    pub fn basic_credentials(&self) -> Option<(String, String)> {
        let line = self.other("Authorization")?;
        let rest = line.strip_prefix("Basic ").or_else(|| {
            let scheme = line.get(..6)?;
            if scheme.eq_ignore_ascii_case("basic ") {
                line.get(6..)
            } else {
                None
            }
        })?;
        let decoded = BASE64.decode(rest.trim()).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (user, pass) = decoded.split_once(':')?;
        Some((user.to_string(), pass.to_string()))
    }
}

/// Parses the `METHOD SP URI SP HTTP/1.x` line into `req`.
///
/// Sets `close` for HTTP/1.0. The URI passes through `rewriter` before the
/// length cap is applied.
pub fn parse_request_line(
    req: &mut HttpRequest,
    line: &[u8],
    close: &mut bool,
    rewriter: Option<&dyn UriRewriter>,
) -> Result<(), HttpStatus> {
    let line = std::str::from_utf8(line).map_err(|_| HttpStatus::BAD_REQUEST)?;
    let (method, rest) = line.split_once(' ').ok_or(HttpStatus::BAD_REQUEST)?;
    if method.is_empty() || method.len() > METHOD_LIMIT {
        return Err(HttpStatus::BAD_REQUEST);
    }
    let (uri, version) = rest.rsplit_once(' ').ok_or(HttpStatus::BAD_REQUEST)?;
    match version {
        "HTTP/1.1" => *close = false,
        "HTTP/1.0" => *close = true,
        _ => return Err(HttpStatus::BAD_REQUEST),
    }
    if uri.is_empty() || uri.contains(' ') {
        return Err(HttpStatus::BAD_REQUEST);
    }

    let uri = match rewriter.and_then(|r| r.rewrite(uri)) {
        Some(rewritten) => {
            if rewritten.is_empty() {
                tracing::error!("uri rewrite produced a zero-length uri");
                return Err(HttpStatus::BAD_REQUEST);
            }
            rewritten
        }
        None => uri.to_string(),
    };
    if uri.len() > URI_LIMIT {
        return Err(HttpStatus::URI_TOO_LONG);
    }

    req.method = method.to_string();
    req.uri = uri;
    req.version = version["HTTP/".len()..].to_string();
    Ok(())
}

/// Parses one `Field: value` line into `req`, updating `close` for
/// Connection headers.
pub fn parse_header_line(
    req: &mut HttpRequest,
    line: &[u8],
    close: &mut bool,
) -> Result<(), HttpStatus> {
    let line = std::str::from_utf8(line).map_err(|_| HttpStatus::BAD_REQUEST)?;
    let (name, value) = line.split_once(':').ok_or(HttpStatus::BAD_REQUEST)?;
    let name = name.trim();
    let value = value.trim_start();

    if name.eq_ignore_ascii_case("Host") {
        req.host = split_host(value)?;
    } else if name.eq_ignore_ascii_case("User-Agent") {
        req.user_agent = value.to_string();
    } else if name.eq_ignore_ascii_case("Accept") {
        req.accept = value.to_string();
    } else if name.eq_ignore_ascii_case("Accept-Language") {
        req.accept_language = value.to_string();
    } else if name.eq_ignore_ascii_case("Accept-Encoding") {
        req.accept_encoding = value.to_string();
    } else if name.eq_ignore_ascii_case("Content-Type") {
        req.content_type = value.to_string();
    } else if name.eq_ignore_ascii_case("Content-Length") {
        req.content_length = value.to_string();
    } else if name.eq_ignore_ascii_case("Transfer-Encoding") {
        req.transfer_encoding = value.to_string();
    } else if name.eq_ignore_ascii_case("Cookie") {
        if !req.cookie.is_empty() {
            req.cookie.push_str(", ");
        }
        req.cookie.push_str(value);
    } else {
        if name.eq_ignore_ascii_case("Connection") {
            // "Connection: Upgrade" is treated as close.
            if value.eq_ignore_ascii_case("keep-alive") {
                *close = false;
            } else if value.eq_ignore_ascii_case("close") {
                *close = true;
            }
        }
        req.others.insert(name.to_string(), value.to_string());
    }
    Ok(())
}

/// Splits `addr[:port]` with `[v6]` acceptance, returning the bare host.
fn split_host(value: &str) -> Result<String, HttpStatus> {
    if value.len() > 263 {
        tracing::debug!("Host field of HTTP request too long");
        return Err(HttpStatus::BAD_REQUEST);
    }
    if let Some(rest) = value.strip_prefix('[') {
        let end = rest.find(']').ok_or(HttpStatus::BAD_REQUEST)?;
        return Ok(rest[..end].to_string());
    }
    match value.rsplit_once(':') {
        // More than one colon without brackets means a bare v6 address.
        Some((host, port))
            if !host.contains(':') && (port.is_empty() || port.bytes().all(|b| b.is_ascii_digit())) =>
        {
            Ok(host.to_string())
        }
        _ => Ok(value.to_string()),
    }
}

/// The `(/rpc|/rpcwithcert)/rpcproxy.dll?<host>:<port>` target of an RPC
/// tunnel request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RpcProxyTarget {
    pub host: String,
    pub port: u16,
}

/// Parses an RPC tunnel URI. `<host>` is capped at 127 bytes and `<port>`
/// must be decimal.
pub fn parse_rpc_proxy_uri(uri: &str) -> Option<RpcProxyTarget> {
    let rest = uri
        .strip_prefix("/rpc/rpcproxy.dll?")
        .or_else(|| uri.strip_prefix("/rpcwithcert/rpcproxy.dll?"))?;
    let (host, port) = rest.split_once(':')?;
    if host.is_empty() || host.len() > 127 {
        return None;
    }
    let port: u16 = port.parse().ok()?;
    Some(RpcProxyTarget {
        host: host.to_string(),
        port,
    })
}

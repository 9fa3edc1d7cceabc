// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fmt::Write as _, sync::Arc};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use sha1::{Digest, Sha1};
use tracing::debug;

use crate::{
    error::WsError,
    ws::extension::{
        CompressMethod, DeflateParams, Extension, accept_client, build_offer,
        format_extension, negotiate_server, parse_extensions,
    },
};

/// RFC 6455 accept-key suffix.
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const MAX_HEADERS: usize = 64;

/// Parsed HTTP request surface consumed from the external parser.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
}

impl Request {
    /// Case-insensitive single-header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// True when a comma-separated header contains `needle` (token match).
    fn header_has_token(&self, name: &str, needle: &str) -> bool {
        self.header(name).is_some_and(|v| {
            v.split(',').any(|t| t.trim().eq_ignore_ascii_case(needle))
        })
    }
}

/// Parsed HTTP response surface consumed from the external parser.
#[derive(Debug, Clone)]
pub struct Response {
    pub code: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Pulls one complete HTTP request off the buffer; `None` until the final
/// CRLF CRLF arrived.
pub fn parse_request(buf: &[u8]) -> Result<Option<(Request, usize)>, WsError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(buf) {
        Ok(httparse::Status::Complete(consumed)) => {
            let method = req.method.unwrap_or_default().to_string();
            let path = req.path.unwrap_or_default().to_string();
            let headers = req
                .headers
                .iter()
                .map(|h| {
                    (
                        h.name.to_string(),
                        String::from_utf8_lossy(h.value).into_owned(),
                    )
                })
                .collect();
            Ok(Some((
                Request {
                    method,
                    path,
                    headers,
                },
                consumed,
            )))
        },
        Ok(httparse::Status::Partial) => Ok(None),
        Err(e) => Err(WsError::HandshakeFailed(format!("bad http request: {e}"))),
    }
}

/// Pulls one complete HTTP response off the buffer; `None` until complete.
pub fn parse_response(buf: &[u8]) -> Result<Option<(Response, usize)>, WsError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut res = httparse::Response::new(&mut headers);
    match res.parse(buf) {
        Ok(httparse::Status::Complete(consumed)) => {
            let headers = res
                .headers
                .iter()
                .map(|h| {
                    (
                        h.name.to_string(),
                        String::from_utf8_lossy(h.value).into_owned(),
                    )
                })
                .collect();
            Ok(Some((
                Response {
                    code: res.code.unwrap_or_default(),
                    reason: res.reason.unwrap_or_default().to_string(),
                    headers,
                },
                consumed,
            )))
        },
        Ok(httparse::Status::Partial) => Ok(None),
        Err(e) => Err(WsError::HandshakeFailed(format!("bad http response: {e}"))),
    }
}

/// `Sec-WebSocket-Accept` for a given client key.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

fn key_is_valid(key: &str) -> bool {
    STANDARD.decode(key).map(|raw| raw.len() == 16).unwrap_or(false)
}

/// Server-side acceptance policy.
#[derive(Clone, Default)]
pub struct ServerOptions {
    /// Ordered preference list matched against the client's ordered list.
    pub subprotocols: Vec<String>,
    /// Compression methods this endpoint is willing to negotiate.
    pub compressors: Vec<CompressMethod>,
    /// Additional extensions granted when the client offers them; each entry
    /// is `[name, param, ...]` and is echoed verbatim on a name match.
    pub extensions: Vec<Vec<String>>,
    /// HTTP authentication gate; internals (Basic/Digest) live outside.
    pub auth: Option<Arc<dyn Fn(&Request) -> bool + Send + Sync>>,
}

/// Result of a successful server handshake.
#[derive(Debug, Clone)]
pub struct Accepted {
    pub subprotocol: Option<String>,
    pub method: CompressMethod,
    pub deflate: DeflateParams,
    /// Extensions actually granted in the 101 response, not the raw offer.
    pub extensions: Vec<Extension>,
    pub response: Vec<u8>,
}

/// Server verdict on an upgrade request.
#[derive(Debug, Clone)]
pub enum ServerVerdict {
    Accepted(Box<Accepted>),
    Rejected {
        code: u16,
        reason: String,
        response: Vec<u8>,
    },
}

fn reject(code: u16, reason: &str) -> ServerVerdict {
    let response = format!(
        "HTTP/1.1 {code} {reason}\r\nConnection: close\r\nContent-Length: 0\r\n\r\n"
    )
    .into_bytes();
    ServerVerdict::Rejected {
        code,
        reason: reason.to_string(),
        response,
    }
}

/// Applies the RFC 6455 server acceptance rules to one upgrade request.
pub fn accept(req: &Request, opts: &ServerOptions) -> ServerVerdict {
    if !req.header_has_token("Connection", "upgrade")
        || !req
            .header("Upgrade")
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("websocket"))
    {
        return reject(400, "Not a websocket upgrade");
    }
    if req.header("Sec-WebSocket-Version").map(str::trim) != Some("13") {
        return reject(505, "Unsupported protocol version");
    }
    let Some(key) = req.header("Sec-WebSocket-Key").map(str::trim) else {
        return reject(400, "Wrong client key");
    };
    if !key_is_valid(key) {
        return reject(400, "Wrong client key");
    }
    if let Some(auth) = &opts.auth
        && !auth(req)
    {
        return reject(401, "Unauthorized");
    }

    let subprotocol = req.header("Sec-WebSocket-Protocol").and_then(|offered| {
        offered
            .split(',')
            .map(str::trim)
            .find(|p| opts.subprotocols.iter().any(|s| s == p))
            .map(str::to_string)
    });

    let offered_extensions: Vec<Extension> = req
        .header("Sec-WebSocket-Extensions")
        .map(parse_extensions)
        .unwrap_or_default();
    let negotiated = negotiate_server(&offered_extensions, &opts.compressors);

    // Only what ends up in `granted` is negotiated session state; declined
    // offers never leave this function.
    let mut granted: Vec<Extension> = Vec::new();
    if let Some((_, _, reply)) = &negotiated {
        granted.push(reply.clone());
    }
    for entry in &opts.extensions {
        let Some(name) = entry.first() else {
            continue;
        };
        if CompressMethod::from_token(name).is_some() {
            continue;
        }
        if offered_extensions.iter().any(|o| &o.name == name) {
            granted.push(Extension {
                name: name.clone(),
                params: entry[1..]
                    .iter()
                    .map(|p| match p.split_once('=') {
                        Some((k, v)) => (k.to_string(), Some(v.to_string())),
                        None => (p.clone(), None),
                    })
                    .collect(),
            });
        }
    }

    let mut response = String::with_capacity(192);
    response.push_str("HTTP/1.1 101 Switching Protocols\r\n");
    response.push_str("Upgrade: websocket\r\n");
    response.push_str("Connection: Upgrade\r\n");
    let _ = write!(response, "Sec-WebSocket-Accept: {}\r\n", accept_key(key));
    if let Some(proto) = &subprotocol {
        let _ = write!(response, "Sec-WebSocket-Protocol: {proto}\r\n");
    }
    if !granted.is_empty() {
        let header = granted
            .iter()
            .map(format_extension)
            .collect::<Vec<_>>()
            .join(", ");
        let _ = write!(response, "Sec-WebSocket-Extensions: {header}\r\n");
    }
    response.push_str("\r\n");

    let (method, deflate) = match &negotiated {
        Some((method, params, _)) => (*method, *params),
        None => (CompressMethod::None, DeflateParams::default()),
    };
    debug!(?method, subprotocol = ?subprotocol, "upgrade accepted");
    ServerVerdict::Accepted(Box::new(Accepted {
        subprotocol,
        method,
        deflate,
        extensions: granted,
        response: response.into_bytes(),
    }))
}

/// Client-side request policy.
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    pub host: String,
    pub path: String,
    pub subprotocols: Vec<String>,
    pub compressors: Vec<CompressMethod>,
    pub authorization: Option<String>,
    pub proxy_authorization: Option<String>,
}

/// Builds the upgrade request for a freshly generated key.
pub fn build_request(key: &str, opts: &ClientOptions) -> Vec<u8> {
    let path = if opts.path.is_empty() { "/" } else { &opts.path };
    let mut out = String::with_capacity(256);
    let _ = write!(out, "GET {path} HTTP/1.1\r\n");
    let _ = write!(out, "Host: {}\r\n", opts.host);
    out.push_str("Upgrade: websocket\r\n");
    out.push_str("Connection: Upgrade\r\n");
    let _ = write!(out, "Sec-WebSocket-Key: {key}\r\n");
    out.push_str("Sec-WebSocket-Version: 13\r\n");
    if !opts.subprotocols.is_empty() {
        let _ = write!(
            out,
            "Sec-WebSocket-Protocol: {}\r\n",
            opts.subprotocols.join(", ")
        );
    }
    if let Some(offer) = build_offer(&opts.compressors) {
        let _ = write!(out, "Sec-WebSocket-Extensions: {offer}\r\n");
    }
    if let Some(auth) = &opts.authorization {
        let _ = write!(out, "Authorization: {auth}\r\n");
    }
    if let Some(auth) = &opts.proxy_authorization {
        let _ = write!(out, "Proxy-Authorization: {auth}\r\n");
    }
    out.push_str("\r\n");
    out.into_bytes()
}

/// Outcome of a validated 101 response.
#[derive(Debug, Clone)]
pub struct ClientNegotiated {
    pub subprotocol: Option<String>,
    pub method: CompressMethod,
    pub deflate: DeflateParams,
    pub extensions: Vec<Extension>,
}

/// Validates the server's response against the sent key and stores what was
/// negotiated.
pub fn validate_response(
    key: &str,
    res: &Response,
    opts: &ClientOptions,
) -> Result<ClientNegotiated, WsError> {
    if res.code != 101 {
        return Err(WsError::HandshakeFailed(format!(
            "server refused the upgrade: {} {}",
            res.code, res.reason
        )));
    }
    if res.header("Sec-WebSocket-Accept").map(str::trim)
        != Some(accept_key(key).as_str())
    {
        return Err(WsError::HandshakeFailed(
            "accept hash does not match the key".to_string(),
        ));
    }

    let subprotocol = res
        .header("Sec-WebSocket-Protocol")
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    if let Some(proto) = &subprotocol {
        if !opts.subprotocols.iter().any(|s| s == proto) {
            return Err(WsError::HandshakeFailed(format!(
                "server picked an unknown subprotocol: {proto}"
            )));
        }
    }

    let extensions: Vec<Extension> = res
        .header("Sec-WebSocket-Extensions")
        .map(parse_extensions)
        .unwrap_or_default();
    let (method, deflate) = match accept_client(&extensions, &opts.compressors) {
        Some((method, params)) => (method, params),
        None => (CompressMethod::None, DeflateParams::default()),
    };
    Ok(ClientNegotiated {
        subprotocol,
        method,
        deflate,
        extensions,
    })
}

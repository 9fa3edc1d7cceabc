// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

/// Payload compression negotiated through `Sec-WebSocket-Extensions`.
///
/// Deflate and gzip are built in; the remaining methods are negotiable
/// identifiers that only win negotiation when an external
/// [`crate::ws::deflate::Compressor`] claims them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressMethod {
    None,
    Deflate,
    Gzip,
    Brotli,
    Zstd,
    Lz4,
    Lzma,
    Bzip2,
}

impl CompressMethod {
    /// Extension token for the wire, `None` for uncompressed.
    pub fn token(self) -> Option<&'static str> {
        match self {
            CompressMethod::None => None,
            CompressMethod::Deflate => Some("permessage-deflate"),
            CompressMethod::Gzip => Some("permessage-gzip"),
            CompressMethod::Brotli => Some("permessage-brotli"),
            CompressMethod::Zstd => Some("permessage-zstd"),
            CompressMethod::Lz4 => Some("permessage-lz4"),
            CompressMethod::Lzma => Some("permessage-lzma"),
            CompressMethod::Bzip2 => Some("permessage-bzip2"),
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "permessage-deflate" => Some(CompressMethod::Deflate),
            "permessage-gzip" => Some(CompressMethod::Gzip),
            "permessage-brotli" => Some(CompressMethod::Brotli),
            "permessage-zstd" => Some(CompressMethod::Zstd),
            "permessage-lz4" => Some(CompressMethod::Lz4),
            "permessage-lzma" => Some(CompressMethod::Lzma),
            "permessage-bzip2" => Some(CompressMethod::Bzip2),
            _ => None,
        }
    }
}

/// One parsed extension entry: token plus `key[=value]` parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extension {
    pub name: String,
    pub params: Vec<(String, Option<String>)>,
}

/// Parses a `Sec-WebSocket-Extensions` header value. Quoted parameter values
/// are unwrapped; empty entries are skipped.
pub fn parse_extensions(value: &str) -> Vec<Extension> {
    let mut out = Vec::new();
    for entry in value.split(',') {
        let mut parts = entry.split(';').map(str::trim);
        let Some(name) = parts.next() else {
            continue;
        };
        if name.is_empty() {
            continue;
        }
        let params = parts
            .filter(|p| !p.is_empty())
            .map(|p| match p.split_once('=') {
                Some((k, v)) => {
                    let v = v.trim().trim_matches('"');
                    (k.trim().to_string(), Some(v.to_string()))
                },
                None => (p.to_string(), None),
            })
            .collect();
        out.push(Extension {
            name: name.to_string(),
            params,
        });
    }
    out
}

/// Formats one extension entry back into header form.
pub fn format_extension(ext: &Extension) -> String {
    let mut out = ext.name.clone();
    for (key, value) in &ext.params {
        match value {
            Some(v) => {
                let _ = write!(out, "; {key}={v}");
            },
            None => {
                let _ = write!(out, "; {key}");
            },
        }
    }
    out
}

/// Negotiated permessage-deflate parameters (RFC 7692 §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeflateParams {
    pub server_no_context_takeover: bool,
    pub client_no_context_takeover: bool,
    pub server_max_window_bits: u8,
    pub client_max_window_bits: u8,
}

impl Default for DeflateParams {
    fn default() -> Self {
        Self {
            server_no_context_takeover: false,
            client_no_context_takeover: false,
            server_max_window_bits: 15,
            client_max_window_bits: 15,
        }
    }
}

fn parse_window_bits(value: Option<&String>) -> Option<u8> {
    match value {
        // Parameter present without a value: sender lets the peer choose.
        None => Some(15),
        Some(raw) => match raw.parse::<u8>() {
            Ok(bits) if (8..=15).contains(&bits) => Some(bits),
            _ => None,
        },
    }
}

/// Interprets the parameters of one compression offer. `None` means the
/// offer is malformed and must be declined (RFC 7692 §7.1).
pub fn read_deflate_params(ext: &Extension) -> Option<DeflateParams> {
    let mut params = DeflateParams::default();
    for (key, value) in &ext.params {
        match key.as_str() {
            "server_no_context_takeover" => params.server_no_context_takeover = true,
            "client_no_context_takeover" => params.client_no_context_takeover = true,
            "server_max_window_bits" => {
                params.server_max_window_bits = parse_window_bits(value.as_ref())?;
            },
            "client_max_window_bits" => {
                params.client_max_window_bits = parse_window_bits(value.as_ref())?;
            },
            _ => return None,
        }
    }
    Some(params)
}

/// Server-side negotiation: the first supported method that appears in the
/// client's offer list wins. Returns the method, the agreed parameters and
/// the reply entry to grant in the response.
pub fn negotiate_server(
    offers: &[Extension],
    supported: &[CompressMethod],
) -> Option<(CompressMethod, DeflateParams, Extension)> {
    for method in supported {
        let Some(token) = method.token() else {
            continue;
        };
        for offer in offers.iter().filter(|o| o.name == token) {
            let Some(params) = read_deflate_params(offer) else {
                continue;
            };
            let mut reply = Extension {
                name: token.to_string(),
                params: Vec::new(),
            };
            if params.server_no_context_takeover {
                reply
                    .params
                    .push(("server_no_context_takeover".to_string(), None));
            }
            if params.client_no_context_takeover {
                reply
                    .params
                    .push(("client_no_context_takeover".to_string(), None));
            }
            if params.server_max_window_bits < 15 {
                reply.params.push((
                    "server_max_window_bits".to_string(),
                    Some(params.server_max_window_bits.to_string()),
                ));
            }
            if params.client_max_window_bits < 15 {
                reply.params.push((
                    "client_max_window_bits".to_string(),
                    Some(params.client_max_window_bits.to_string()),
                ));
            }
            return Some((*method, params, reply));
        }
    }
    None
}

/// Client-side offer covering every supported method.
pub fn build_offer(supported: &[CompressMethod]) -> Option<String> {
    let offers: Vec<String> = supported
        .iter()
        .filter_map(|m| m.token())
        .map(|token| format!("{token}; client_max_window_bits"))
        .collect();
    if offers.is_empty() {
        None
    } else {
        Some(offers.join(", "))
    }
}

/// Client-side acceptance of the server's negotiated extension list.
pub fn accept_client(
    negotiated: &[Extension],
    supported: &[CompressMethod],
) -> Option<(CompressMethod, DeflateParams)> {
    for ext in negotiated {
        let Some(method) = CompressMethod::from_token(&ext.name) else {
            continue;
        };
        if !supported.contains(&method) {
            continue;
        }
        let params = read_deflate_params(ext)?;
        return Some((method, params));
    }
    None
}

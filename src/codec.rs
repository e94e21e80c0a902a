//! Wire encodings for the HTTP-Redirect and HTTP-POST bindings.
//!
//! Redirect messages are raw DEFLATE compressed, base64 encoded and then
//! percent-encoded into the query string. POST messages are plain base64.

use std::borrow::Cow;

use base64::{prelude::BASE64_STANDARD, Engine};
use deflate::{deflate_bytes_conf, Compression};
use flate2::{Decompress, FlushDecompress, Status};
use tracing::debug;

use crate::{error::Result, utils::decode_xml_base64, SamlError};

/// Upper bound for an inflated message, guards against DEFLATE bombs.
const MAX_INFLATED_SIZE: usize = 4 * 1024 * 1024;

/// Decodes a message received over either binding.
///
/// Base64 input is decoded first; the result is then speculatively inflated
/// and used verbatim when it is not a DEFLATE stream.
pub fn decode(raw: &str) -> Result<String> {
    let bytes = if is_base64(raw) {
        decode_xml_base64(raw)?
    } else {
        raw.as_bytes().to_vec()
    };
    let bytes = match inflate(&bytes) {
        Ok(inflated) => inflated,
        Err(SamlError::Inflate(reason)) => {
            debug!(%reason, "message is not deflated, using it verbatim");
            bytes
        }
        Err(e) => return Err(e),
    };
    String::from_utf8(bytes)
        .map_err(|_| SamlError::InvalidResponse("message is not valid UTF-8".into()))
}

fn is_base64(raw: &str) -> bool {
    let stripped = raw
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect::<String>();
    if stripped.len() % 4 != 0 {
        return false;
    }
    let body = stripped.trim_end_matches('=');
    stripped.len() - body.len() <= 2
        && body
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '/')
}

pub fn inflate(deflated: &[u8]) -> Result<Vec<u8>> {
    let mut inflater = Decompress::new(false);
    let mut inflated = Vec::with_capacity(deflated.len().saturating_mul(4).max(1024));
    loop {
        let input = &deflated[inflater.total_in() as usize..];
        let status = inflater
            .decompress_vec(input, &mut inflated, FlushDecompress::Finish)
            .map_err(|e| SamlError::Inflate(e.to_string()))?;
        match status {
            Status::StreamEnd => return Ok(inflated),
            _ if inflated.len() < inflated.capacity() => {
                return Err(SamlError::Inflate("truncated deflate stream".into()))
            }
            _ if inflated.len() >= MAX_INFLATED_SIZE => {
                return Err(SamlError::Inflate("inflated message is too large".into()))
            }
            _ => inflated.reserve(inflated.len()),
        }
    }
}

/// Raw DEFLATE (no zlib header or trailer) at best compression.
pub fn deflate(xml: &str) -> Vec<u8> {
    deflate_bytes_conf(xml.as_bytes(), Compression::Best)
}

pub fn encode(bytes: &[u8]) -> String {
    BASE64_STANDARD.encode(bytes)
}

pub fn encode_message(xml: &str, compress: bool) -> String {
    if compress {
        encode(&deflate(xml))
    } else {
        encode(xml.as_bytes())
    }
}

pub fn encode_for_redirect(xml: &str, compress: bool) -> String {
    escape(&encode_message(xml, compress))
}

/// Form-style percent-encoding: unreserved characters are kept and space becomes `+`.
pub fn escape(value: &str) -> String {
    urlencoding::encode(value).replace("%20", "+")
}

pub fn unescape(value: &str) -> Result<String> {
    let value = value.replace('+', " ");
    urlencoding::decode(&value)
        .map(Cow::into_owned)
        .map_err(|_| SamlError::InvalidResponse("query parameter is not valid UTF-8".into()))
}

/// The byte sequence covered by a redirect-binding signature.
pub fn build_query(
    message_type: &str,
    data: &str,
    relay_state: Option<&str>,
    sig_alg: &str,
) -> String {
    build_query_from_raw_parts(
        message_type,
        &escape(data),
        relay_state.map(escape).as_deref(),
        &escape(sig_alg),
    )
}

/// Same as [`build_query`] over values that are already percent-encoded.
pub fn build_query_from_raw_parts(
    message_type: &str,
    raw_data: &str,
    raw_relay_state: Option<&str>,
    raw_sig_alg: &str,
) -> String {
    let mut query = format!("{message_type}={raw_data}");
    if let Some(relay_state) = raw_relay_state {
        query.push_str("&RelayState=");
        query.push_str(relay_state);
    }
    query.push_str("&SigAlg=");
    query.push_str(raw_sig_alg);
    query
}

/// Appends parameters to `target`, escaping each value independently.
pub fn redirect_url(target: &str, params: &[(String, String)]) -> String {
    let mut url = target.to_string();
    let mut separator = if target.contains('?') { '&' } else { '?' };
    for (name, value) in params {
        url.push(separator);
        url.push_str(&escape(name));
        url.push('=');
        url.push_str(&escape(value));
        separator = '&';
    }
    url
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct QueryParam {
    name: String,
    value: String,
    raw: Option<String>,
}

/// Query parameters that remember the exact bytes they were received as.
///
/// Redirect-binding signatures cover the encoded bytes the IdP produced, which
/// may differ from any re-encoding (for example lower-case percent escapes).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams {
    params: Vec<QueryParam>,
}

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a raw query string, with or without the leading `?`.
    pub fn parse(query: &str) -> Result<Self> {
        let query = query.trim().trim_start_matches('?');
        let mut params = Vec::new();
        for pair in query.split('&').filter(|pair| !pair.is_empty()) {
            let (name, raw) = pair.split_once('=').unwrap_or((pair, ""));
            params.push(QueryParam {
                name: unescape(name)?,
                value: unescape(raw)?,
                raw: Some(raw.to_string()),
            });
        }
        Ok(Self { params })
    }

    /// Adds an already decoded value; its encoding is reconstructed on demand.
    pub fn insert(mut self, name: &str, value: &str) -> Self {
        self.params.push(QueryParam {
            name: name.to_string(),
            value: value.to_string(),
            raw: None,
        });
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.find(name).map(|param| param.value.as_str())
    }

    pub fn raw(&self, name: &str) -> Option<&str> {
        self.find(name).and_then(|param| param.raw.as_deref())
    }

    /// The received encoding, falling back to re-encoding the decoded value.
    pub fn raw_or_escaped(&self, name: &str) -> Option<String> {
        self.find(name).map(|param| match &param.raw {
            Some(raw) => raw.clone(),
            None => escape(&param.value),
        })
    }

    fn find(&self, name: &str) -> Option<&QueryParam> {
        self.params.iter().find(|param| param.name == name)
    }
}

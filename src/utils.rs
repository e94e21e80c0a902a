use base64::{prelude::BASE64_STANDARD, Engine};
use libxml::{
    tree::{Document, Node},
    xpath::Context,
};
use openssl::{
    pkey::{PKey, Private},
    x509::X509,
};
use rand::distributions::{Alphanumeric, DistString};
use time::{format_description::well_known::Iso8601, OffsetDateTime};
use url::Url;

use crate::{
    error::Result, SamlError, ASSERTION, DATE_TIME_FORMAT, DSIG, METADATA, PROTOCOL, XENC,
};

pub fn random_string(len: usize) -> String {
    Alphanumeric.sample_string(&mut rand::thread_rng(), len)
}

/// Fresh message identifier. XML IDs must not start with a digit.
pub fn generate_id() -> String {
    format!("_{}", random_string(40))
}

pub fn decode_xml_base64(input: &str) -> std::result::Result<Vec<u8>, base64::DecodeError> {
    let stripped = input.replace([' ', '\n', '\r', '\t'], "");
    BASE64_STANDARD.decode(stripped)
}

/// Accepts a PEM certificate or the bare base64 DER body found in metadata.
pub fn parse_certificate(cert: &str) -> Result<X509> {
    if cert.contains("-----BEGIN CERTIFICATE") {
        return X509::from_pem(cert.trim().as_bytes())
            .map_err(|e| SamlError::Settings(format!("invalid certificate: {e}")));
    }
    let der = decode_xml_base64(cert)?;
    X509::from_der(&der).map_err(|e| SamlError::Settings(format!("invalid certificate: {e}")))
}

pub fn parse_private_key(key: &str) -> Result<PKey<Private>> {
    if key.contains("-----BEGIN") {
        return PKey::private_key_from_pem(key.trim().as_bytes())
            .map_err(|e| SamlError::Settings(format!("invalid private key: {e}")));
    }
    let der = decode_xml_base64(key)?;
    PKey::private_key_from_der(&der)
        .map_err(|e| SamlError::Settings(format!("invalid private key: {e}")))
}

/// Base64 DER body of a certificate, as embedded in `ds:X509Certificate`.
pub fn certificate_body(cert: &X509) -> Result<String> {
    Ok(BASE64_STANDARD.encode(cert.to_der()?))
}

pub fn format_time(instant: OffsetDateTime) -> Result<String> {
    instant
        .format(&DATE_TIME_FORMAT)
        .map_err(|e| SamlError::InvalidResponse(format!("unable to format timestamp: {e}")))
}

pub fn parse_time(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value.trim(), &Iso8601::DEFAULT)
        .map_err(|_| SamlError::InvalidResponse(format!("invalid timestamp '{value}'")))
}

/// XPath context with every prefix used by the crate registered.
pub fn xpath_context(document: &Document) -> Result<Context> {
    let context = Context::new(document)
        .map_err(|_| SamlError::InvalidResponse("failed to create XPath context".into()))?;
    for (prefix, href) in [
        ("samlp", PROTOCOL),
        ("saml", ASSERTION),
        ("md", METADATA),
        ("ds", DSIG),
        ("xenc", XENC),
    ] {
        context
            .register_namespace(prefix, href)
            .map_err(|_| SamlError::InvalidResponse("failed to register namespace".into()))?;
    }
    Ok(context)
}

pub fn find_nodes(context: &Context, xpath: &str, node: Option<&Node>) -> Vec<Node> {
    context.findnodes(xpath, node).unwrap_or_default()
}

pub fn first_node(context: &Context, xpath: &str, node: Option<&Node>) -> Option<Node> {
    find_nodes(context, xpath, node).into_iter().next()
}

pub fn first_text(context: &Context, xpath: &str, node: Option<&Node>) -> Option<String> {
    first_node(context, xpath, node).map(|node| node.get_content().trim().to_string())
}

/// Quotes a value for use inside an XPath expression.
pub fn xpath_literal(value: &str) -> String {
    if !value.contains('"') {
        format!("\"{value}\"")
    } else if !value.contains('\'') {
        format!("'{value}'")
    } else {
        let parts = value
            .split('"')
            .map(|part| format!("\"{part}\""))
            .collect::<Vec<_>>()
            .join(", '\"', ");
        format!("concat({parts})")
    }
}

pub fn namespace_of(node: &Node) -> Option<String> {
    node.get_namespace().map(|ns| ns.get_href())
}

/// Two URIs match when they are byte-equal, or equal once scheme and host are normalized.
pub fn uri_match(destination: &str, settings_url: &str) -> bool {
    if destination == settings_url {
        return true;
    }
    match (split_uri(destination), split_uri(settings_url)) {
        (Some((scheme_a, host_a, rest_a)), Some((scheme_b, host_b, rest_b))) => {
            scheme_a.eq_ignore_ascii_case(scheme_b)
                && host_a.eq_ignore_ascii_case(host_b)
                && rest_a == rest_b
        }
        _ => false,
    }
}

/// `(scheme, authority, rest)` of an absolute URI with a host. The rest is
/// left exactly as received.
fn split_uri(uri: &str) -> Option<(&str, &str, &str)> {
    Url::parse(uri).ok().filter(Url::has_host)?;
    let (scheme, remainder) = uri.split_once("://")?;
    let end = remainder.find(['/', '?', '#']).unwrap_or(remainder.len());
    let (authority, rest) = remainder.split_at(end);
    Some((scheme, authority, rest))
}

/// Builds "<message>, was <code> => <subcode> -> <status message>".
pub fn status_error_msg(error_msg: &str, codes: &[String], status_message: Option<&str>) -> String {
    let mut message = error_msg.to_string();
    if !codes.is_empty() {
        let printable = codes
            .iter()
            .map(|code| code.rsplit(':').next().unwrap_or(code.as_str()))
            .collect::<Vec<_>>()
            .join(" => ");
        message.push_str(", was ");
        message.push_str(&printable);
    }
    if let Some(status_message) = status_message {
        message.push_str(" -> ");
        message.push_str(status_message);
    }
    message
}

//! Plumbing shared by the outbound builders and the inbound validators.

use time::{Duration, OffsetDateTime};
use tracing::{debug, warn};

use crate::{
    codec::{self, QueryParams},
    error::Result,
    settings::Settings,
    xml_security::{
        sign_document, sign_query, verify_query_signature, verify_with_any, SignedDocument,
    },
    SamlError, SignatureAlgorithm,
};

/// A message the SP sends to the IdP.
pub(crate) trait OutboundMessage {
    /// Query parameter (or form field) carrying the encoded message.
    const PARAMETER: &'static str;

    fn settings(&self) -> &Settings;

    fn unsigned_xml(&self) -> Result<String>;

    /// Whether the security policy asks for this kind of message to be signed.
    fn signed(&self) -> bool;

    fn compressed(&self) -> bool;

    fn destination(&self) -> Result<&str>;
}

pub(crate) fn to_xml<M: OutboundMessage>(message: &M) -> Result<String> {
    let xml = message.unsigned_xml()?;
    let settings = message.settings();
    if message.signed() && settings.security.embed_sign {
        if let Some((key, cert)) = settings.sp_signing_credentials()? {
            return sign_document(
                &xml,
                &key,
                &cert,
                settings.security.signature_method,
                settings.security.digest_method,
            );
        }
    }
    Ok(xml)
}

pub(crate) fn create_params<M: OutboundMessage>(
    message: &M,
    params: &[(&str, Option<&str>)],
) -> Result<Vec<(String, String)>> {
    let xml = to_xml(message)?;
    debug!(parameter = M::PARAMETER, %xml, "created SAML message");
    let data = codec::encode_message(&xml, message.compressed());

    let relay_state = params
        .iter()
        .find(|(name, _)| *name == "RelayState")
        .and_then(|(_, value)| *value);
    let mut result = vec![(M::PARAMETER.to_string(), data.clone())];
    for (name, value) in params {
        match (*name, value) {
            ("RelayState", None) => {}
            (name, value) => result.push((name.to_string(), value.unwrap_or_default().to_string())),
        }
    }

    let settings = message.settings();
    if message.signed() && !settings.security.embed_sign {
        if let Some(key) = settings.get_sp_key()? {
            let algorithm = settings.security.signature_method;
            let query = codec::build_query(M::PARAMETER, &data, relay_state, algorithm.uri());
            result.push(("SigAlg".to_string(), algorithm.uri().to_string()));
            result.push(("Signature".to_string(), sign_query(&key, algorithm, &query)?));
        }
    }
    Ok(result)
}

pub(crate) fn create<M: OutboundMessage>(
    message: &M,
    params: &[(&str, Option<&str>)],
) -> Result<String> {
    let destination = message.destination()?;
    Ok(codec::redirect_url(destination, &create_params(message, params)?))
}

/// Options for validating logout messages received from the IdP.
#[derive(Debug, Clone, Default)]
pub struct LogoutOptions {
    /// ID of the request this message must answer.
    pub matches_request_id: Option<String>,
    pub allowed_clock_drift: Duration,
    /// Query parameters the message arrived with, for detached signatures.
    pub get_params: Option<QueryParams>,
    /// Accept signed messages when no IdP certificate is configured.
    pub relax_signature_validation: bool,
    /// Overrides the clock, mainly for tests.
    pub now: Option<OffsetDateTime>,
}

/// Decodes a received message; empty input yields no document.
pub(crate) fn decode_inbound(raw: &str) -> Result<Option<SignedDocument>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    let xml = codec::decode(raw)?;
    if xml.contains("<!DOCTYPE") {
        return Err(SamlError::InvalidResponse(
            "Dangerous XML detected. No Doctype nodes allowed".into(),
        ));
    }
    debug!(%xml, "decoded SAML message");
    SignedDocument::parse(&xml).map(Some)
}

/// Attribute of the message's root element, such as `ID` or `Version`.
pub(crate) fn root_attribute(document: Option<&SignedDocument>, name: &str) -> Option<String> {
    document?.document().get_root_element()?.get_attribute(name)
}

/// Checks the signature of a logout message.
///
/// A `Signature` query parameter is verified over the raw query bytes. Without
/// one, an embedded signature is verified when `embedded` is set. Messages
/// carrying neither pass.
pub(crate) fn logout_signature_valid(
    parameter: &str,
    xml: &str,
    embedded: bool,
    settings: &Settings,
    options: &LogoutOptions,
) -> Result<bool> {
    let certs = settings.idp_signing_certs()?;
    let detached = options
        .get_params
        .as_ref()
        .filter(|params| params.get("Signature").is_some());

    match detached {
        Some(params) => {
            if certs.is_empty() {
                return Ok(options.relax_signature_validation);
            }
            let sig_alg = params
                .get("SigAlg")
                .unwrap_or(SignatureAlgorithm::RsaSha1.uri());
            let raw_sig_alg = params
                .raw_or_escaped("SigAlg")
                .unwrap_or_else(|| codec::escape(sig_alg));
            let query = codec::build_query_from_raw_parts(
                parameter,
                &params.raw_or_escaped(parameter).unwrap_or_default(),
                params.raw_or_escaped("RelayState").as_deref(),
                &raw_sig_alg,
            );
            let signature = params.get("Signature").unwrap_or_default();
            for cert in &certs {
                match verify_query_signature(cert, sig_alg, signature, &query) {
                    Ok(true) => return Ok(true),
                    Ok(false) => warn!(parameter, "query signature rejected"),
                    Err(error) => warn!(parameter, %error, "query signature rejected"),
                }
            }
            Ok(false)
        }
        None if embedded => {
            if certs.is_empty() {
                return Ok(options.relax_signature_validation);
            }
            Ok(verify_with_any(xml, &certs))
        }
        None => Ok(true),
    }
}

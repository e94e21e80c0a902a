use openssl::{
    pkey::{PKey, Private},
    x509::X509,
};
use serde::Deserialize;

use crate::{
    authn_request::ProtocolBinding,
    error::Result,
    utils::{parse_certificate, parse_private_key},
    xml_security::{fingerprint, DigestAlgorithm, SignatureAlgorithm},
};

/// Certificates of an IdP that publishes more than one, keyed by use.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct IdpCertMulti {
    pub signing: Vec<String>,
    pub encryption: Vec<String>,
}

/// Which messages are signed or encrypted, and with what.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SecurityPolicy {
    pub authn_requests_signed: bool,
    pub logout_requests_signed: bool,
    pub logout_responses_signed: bool,
    pub want_assertions_signed: bool,
    pub want_assertions_encrypted: bool,
    pub want_name_id: bool,
    pub metadata_signed: bool,
    /// Sign inside the XML instead of over the redirect query string.
    pub embed_sign: bool,
    pub digest_method: DigestAlgorithm,
    pub signature_method: SignatureAlgorithm,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RequestedAttribute {
    pub name: String,
    pub name_format: Option<String>,
    pub friendly_name: Option<String>,
    pub is_required: bool,
    pub attribute_values: Vec<String>,
}

/// The `AttributeConsumingService` advertised in SP metadata.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AttributeConsumingService {
    pub name: Option<String>,
    pub index: u32,
    pub attributes: Vec<RequestedAttribute>,
}

impl Default for AttributeConsumingService {
    fn default() -> Self {
        AttributeConsumingService {
            name: None,
            index: 1,
            attributes: Vec::new(),
        }
    }
}

impl AttributeConsumingService {
    pub fn service_name(self, name: &str) -> Self {
        AttributeConsumingService {
            name: Some(name.into()),
            ..self
        }
    }

    pub fn service_index(self, index: u32) -> Self {
        AttributeConsumingService { index, ..self }
    }

    pub fn add_attribute(mut self, attribute: RequestedAttribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn configured(&self) -> bool {
        self.name.is_some() && !self.attributes.is_empty()
    }
}

/// Everything the engine needs to know about both sides of the trust relationship.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub idp_entity_id: Option<String>,
    pub idp_sso_target_url: Option<String>,
    pub idp_slo_target_url: Option<String>,
    pub idp_slo_response_service_url: Option<String>,
    pub idp_cert: Option<String>,
    pub idp_cert_fingerprint: Option<String>,
    pub idp_cert_fingerprint_algorithm: DigestAlgorithm,
    pub idp_cert_multi: Option<IdpCertMulti>,
    pub idp_attribute_names: Vec<String>,
    pub idp_name_qualifier: Option<String>,
    pub sp_name_qualifier: Option<String>,
    /// The SP entity ID.
    pub issuer: Option<String>,
    pub assertion_consumer_service_url: Option<String>,
    pub assertion_consumer_service_binding: ProtocolBinding,
    pub single_logout_service_url: Option<String>,
    pub single_logout_service_binding: ProtocolBinding,
    pub protocol_binding: Option<ProtocolBinding>,
    pub name_identifier_format: Option<String>,
    pub name_identifier_value: Option<String>,
    pub name_identifier_value_requested: Option<String>,
    pub sessionindex: Option<String>,
    pub passive: Option<bool>,
    pub force_authn: Option<bool>,
    pub attributes_index: Option<u32>,
    pub authn_context: Vec<String>,
    pub authn_context_comparison: Option<String>,
    pub authn_context_decl_ref: Vec<String>,
    pub compress_request: bool,
    pub compress_response: bool,
    pub certificate: Option<String>,
    pub certificate_new: Option<String>,
    pub private_key: Option<String>,
    pub attribute_consuming_service: AttributeConsumingService,
    pub security: SecurityPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            idp_entity_id: None,
            idp_sso_target_url: None,
            idp_slo_target_url: None,
            idp_slo_response_service_url: None,
            idp_cert: None,
            idp_cert_fingerprint: None,
            idp_cert_fingerprint_algorithm: DigestAlgorithm::Sha1,
            idp_cert_multi: None,
            idp_attribute_names: Vec::new(),
            idp_name_qualifier: None,
            sp_name_qualifier: None,
            issuer: None,
            assertion_consumer_service_url: None,
            assertion_consumer_service_binding: ProtocolBinding::Post,
            single_logout_service_url: None,
            single_logout_service_binding: ProtocolBinding::Redirect,
            protocol_binding: None,
            name_identifier_format: None,
            name_identifier_value: None,
            name_identifier_value_requested: None,
            sessionindex: None,
            passive: None,
            force_authn: None,
            attributes_index: None,
            authn_context: Vec::new(),
            authn_context_comparison: None,
            authn_context_decl_ref: Vec::new(),
            compress_request: true,
            compress_response: true,
            certificate: None,
            certificate_new: None,
            private_key: None,
            attribute_consuming_service: AttributeConsumingService::default(),
            security: SecurityPolicy::default(),
        }
    }
}

impl Settings {
    pub fn get_idp_cert(&self) -> Result<Option<X509>> {
        non_blank(&self.idp_cert).map(parse_certificate).transpose()
    }

    /// Parsed `(signing, encryption)` certificate lists.
    pub fn get_idp_cert_multi(&self) -> Result<Option<(Vec<X509>, Vec<X509>)>> {
        let Some(multi) = &self.idp_cert_multi else {
            return Ok(None);
        };
        let parse = |certs: &[String]| -> Result<Vec<X509>> {
            certs.iter().map(|cert| parse_certificate(cert)).collect()
        };
        Ok(Some((parse(&multi.signing)?, parse(&multi.encryption)?)))
    }

    pub fn get_sp_cert(&self) -> Result<Option<X509>> {
        non_blank(&self.certificate).map(parse_certificate).transpose()
    }

    pub fn get_sp_cert_new(&self) -> Result<Option<X509>> {
        non_blank(&self.certificate_new).map(parse_certificate).transpose()
    }

    pub fn get_sp_key(&self) -> Result<Option<PKey<Private>>> {
        non_blank(&self.private_key).map(parse_private_key).transpose()
    }

    /// The configured fingerprint, else the fingerprint of `idp_cert`.
    pub fn get_fingerprint(&self) -> Result<Option<String>> {
        if let Some(fingerprint) = non_blank(&self.idp_cert_fingerprint) {
            return Ok(Some(fingerprint.to_string()));
        }
        match self.get_idp_cert()? {
            Some(cert) => Ok(Some(fingerprint(&cert, self.idp_cert_fingerprint_algorithm)?)),
            None => Ok(None),
        }
    }

    /// Whether any credential to verify IdP signatures is configured.
    pub fn has_idp_credentials(&self) -> bool {
        non_blank(&self.idp_cert).is_some()
            || non_blank(&self.idp_cert_fingerprint).is_some()
            || self
                .idp_cert_multi
                .as_ref()
                .is_some_and(|multi| !multi.signing.is_empty())
    }

    /// Signing certificates to try in order when verifying IdP signatures.
    pub fn idp_signing_certs(&self) -> Result<Vec<X509>> {
        match self.get_idp_cert_multi()? {
            Some((signing, _)) if !signing.is_empty() => Ok(signing),
            _ => Ok(self.get_idp_cert()?.into_iter().collect()),
        }
    }

    /// Key and certificate pair, present only when both are configured.
    pub(crate) fn sp_signing_credentials(&self) -> Result<Option<(PKey<Private>, X509)>> {
        match (self.get_sp_key()?, self.get_sp_cert()?) {
            (Some(key), Some(cert)) => Ok(Some((key, cert))),
            _ => Ok(None),
        }
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

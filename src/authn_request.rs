use std::{fmt::Display, str::FromStr};

use serde::Deserialize;
use time::OffsetDateTime;
use yaserde::YaSerialize;

use crate::{
    error::Result,
    message::{self, OutboundMessage},
    settings::Settings,
    utils::{format_time, generate_id},
    SamlError, BEARER,
};

#[derive(YaSerialize)]
#[yaserde(
  namespaces = {
    "samlp" = "urn:oasis:names:tc:SAML:2.0:protocol",
    "saml" = "urn:oasis:names:tc:SAML:2.0:assertion",
  },
  prefix = "samlp"
)]
struct AuthnRequest {
    #[yaserde(attribute = true, rename = "ID")]
    id: String,
    #[yaserde(attribute = true, rename = "Version")]
    version: String,
    #[yaserde(attribute = true, rename = "IssueInstant")]
    issue_instant: String,
    #[yaserde(attribute = true, rename = "Destination")]
    destination: Option<String>,
    #[yaserde(attribute = true, rename = "IsPassive")]
    is_passive: Option<String>,
    #[yaserde(attribute = true, rename = "ProtocolBinding")]
    protocol_binding: Option<String>,
    #[yaserde(attribute = true, rename = "AttributeConsumingServiceIndex")]
    attribute_consuming_service_index: Option<String>,
    #[yaserde(attribute = true, rename = "ForceAuthn")]
    force_authn: Option<String>,
    #[yaserde(attribute = true, rename = "AssertionConsumerServiceURL")]
    assertion_consumer_service_url: Option<String>,
    #[yaserde(rename = "Issuer", prefix = "saml")]
    issuer: Option<String>,
    #[yaserde(rename = "Subject", prefix = "saml")]
    subject: Option<Subject>,
    #[yaserde(rename = "NameIDPolicy", prefix = "samlp")]
    name_id_policy: Option<NameIdPolicy>,
    #[yaserde(rename = "RequestedAuthnContext", prefix = "samlp")]
    requested_authn_context: Option<RequestedAuthnContext>,
}

#[derive(YaSerialize)]
struct Subject {
    #[yaserde(rename = "NameID", prefix = "saml")]
    name_id: NameId,
    #[yaserde(rename = "SubjectConfirmation", prefix = "saml")]
    subject_confirmation: SubjectConfirmation,
}

#[derive(YaSerialize)]
struct NameId {
    #[yaserde(attribute = true, rename = "Format")]
    format: Option<String>,
    #[yaserde(text = true)]
    content: String,
}

#[derive(YaSerialize)]
struct SubjectConfirmation {
    #[yaserde(attribute = true, rename = "Method")]
    method: String,
}

#[derive(YaSerialize)]
struct NameIdPolicy {
    #[yaserde(attribute = true, rename = "AllowCreate")]
    allow_create: bool,
    #[yaserde(attribute = true, rename = "Format")]
    format: String,
}

#[derive(YaSerialize)]
struct RequestedAuthnContext {
    #[yaserde(attribute = true, rename = "Comparison")]
    comparison: String,
    #[yaserde(rename = "AuthnContextClassRef", prefix = "saml")]
    class_refs: Vec<String>,
    #[yaserde(rename = "AuthnContextDeclRef", prefix = "saml")]
    decl_refs: Vec<String>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub enum ProtocolBinding {
    Post,
    #[default]
    Redirect,
}

impl Display for ProtocolBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ProtocolBinding::Post => write!(f, "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST"),
            ProtocolBinding::Redirect => {
                write!(f, "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect")
            }
        }
    }
}

impl FromStr for ProtocolBinding {
    type Err = SamlError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST" => Ok(ProtocolBinding::Post),
            "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect" => Ok(ProtocolBinding::Redirect),
            other => Err(SamlError::Settings(format!("unsupported binding '{other}'"))),
        }
    }
}

impl TryFrom<String> for ProtocolBinding {
    type Error = SamlError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

/// Builds the `AuthnRequest` that starts SP-initiated login.
pub struct AuthnRequestBuilder<'a> {
    settings: &'a Settings,
    id: String,
    issue_instant: OffsetDateTime,
}

impl<'a> AuthnRequestBuilder<'a> {
    pub fn new(settings: &'a Settings) -> Self {
        AuthnRequestBuilder {
            settings,
            id: generate_id(),
            issue_instant: OffsetDateTime::now_utc(),
        }
    }

    pub fn id(self, id: &str) -> Self {
        AuthnRequestBuilder {
            id: id.into(),
            ..self
        }
    }

    pub fn issue_instant(self, instant: OffsetDateTime) -> Self {
        AuthnRequestBuilder {
            issue_instant: instant,
            ..self
        }
    }

    /// The ID a later `Response` must carry as `InResponseTo`.
    pub fn request_id(&self) -> &str {
        &self.id
    }

    pub fn to_xml(&self) -> Result<String> {
        message::to_xml(self)
    }

    pub fn create_params(&self, params: &[(&str, Option<&str>)]) -> Result<Vec<(String, String)>> {
        message::create_params(self, params)
    }

    /// Redirect URL to the IdP's SSO endpoint.
    pub fn create(&self, params: &[(&str, Option<&str>)]) -> Result<String> {
        message::create(self, params)
    }
}

impl OutboundMessage for AuthnRequestBuilder<'_> {
    const PARAMETER: &'static str = "SAMLRequest";

    fn settings(&self) -> &Settings {
        self.settings
    }

    fn unsigned_xml(&self) -> Result<String> {
        let settings = self.settings;
        let name_id_format = settings.name_identifier_format.clone();
        let comparison = settings
            .authn_context_comparison
            .clone()
            .unwrap_or_else(|| "exact".to_string());
        let req = AuthnRequest {
            id: self.id.clone(),
            version: "2.0".to_string(),
            issue_instant: format_time(self.issue_instant)?,
            destination: settings.idp_sso_target_url.clone(),
            is_passive: settings.passive.map(|passive| passive.to_string()),
            protocol_binding: settings.protocol_binding.map(|binding| binding.to_string()),
            attribute_consuming_service_index: settings.attributes_index.map(|i| i.to_string()),
            force_authn: settings.force_authn.filter(|force| *force).map(|_| "true".into()),
            assertion_consumer_service_url: settings.assertion_consumer_service_url.clone(),
            issuer: settings.issuer.clone(),
            subject: settings
                .name_identifier_value_requested
                .clone()
                .map(|value| Subject {
                    name_id: NameId {
                        format: name_id_format.clone(),
                        content: value,
                    },
                    subject_confirmation: SubjectConfirmation {
                        method: BEARER.to_string(),
                    },
                }),
            name_id_policy: name_id_format.map(|format| NameIdPolicy {
                allow_create: true,
                format,
            }),
            requested_authn_context: (!settings.authn_context.is_empty()
                || !settings.authn_context_decl_ref.is_empty())
            .then(|| RequestedAuthnContext {
                comparison,
                class_refs: settings.authn_context.clone(),
                decl_refs: settings.authn_context_decl_ref.clone(),
            }),
        };
        yaserde::ser::to_string(&req).map_err(SamlError::Serialization)
    }

    fn signed(&self) -> bool {
        self.settings.security.authn_requests_signed
    }

    fn compressed(&self) -> bool {
        self.settings.compress_request
    }

    fn destination(&self) -> Result<&str> {
        self.settings
            .idp_sso_target_url
            .as_deref()
            .filter(|url| !url.is_empty())
            .ok_or_else(|| {
                SamlError::Settings("Invalid settings, idp_sso_target_url is not set!".into())
            })
    }
}

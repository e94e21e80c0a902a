use time::OffsetDateTime;
use yaserde::YaSerialize;

use crate::{
    error::Result,
    message::{self, OutboundMessage},
    settings::Settings,
    utils::{format_time, generate_id},
    SamlError, NAME_ID_FORMAT_TRANSIENT,
};

#[derive(YaSerialize)]
#[yaserde(
  namespaces = {
    "samlp" = "urn:oasis:names:tc:SAML:2.0:protocol",
    "saml" = "urn:oasis:names:tc:SAML:2.0:assertion",
  },
  prefix = "samlp"
)]
struct LogoutRequest {
    #[yaserde(attribute = true, rename = "ID")]
    id: String,
    #[yaserde(attribute = true, rename = "Version")]
    version: String,
    #[yaserde(attribute = true, rename = "IssueInstant")]
    issue_instant: String,
    #[yaserde(attribute = true, rename = "Destination")]
    destination: Option<String>,
    #[yaserde(rename = "Issuer", prefix = "saml")]
    issuer: Option<String>,
    #[yaserde(rename = "NameID", prefix = "saml")]
    name_id: NameId,
    #[yaserde(rename = "SessionIndex", prefix = "samlp")]
    session_index: Option<String>,
}

#[derive(YaSerialize)]
struct NameId {
    #[yaserde(attribute = true, rename = "NameQualifier")]
    name_qualifier: Option<String>,
    #[yaserde(attribute = true, rename = "SPNameQualifier")]
    sp_name_qualifier: Option<String>,
    #[yaserde(attribute = true, rename = "Format")]
    format: Option<String>,
    #[yaserde(text = true)]
    content: String,
}

/// Builds the `LogoutRequest` for SP-initiated single logout.
pub struct LogoutRequestBuilder<'a> {
    settings: &'a Settings,
    id: String,
    issue_instant: OffsetDateTime,
}

impl<'a> LogoutRequestBuilder<'a> {
    pub fn new(settings: &'a Settings) -> Self {
        LogoutRequestBuilder {
            settings,
            id: generate_id(),
            issue_instant: OffsetDateTime::now_utc(),
        }
    }

    pub fn id(self, id: &str) -> Self {
        LogoutRequestBuilder {
            id: id.into(),
            ..self
        }
    }

    pub fn issue_instant(self, instant: OffsetDateTime) -> Self {
        LogoutRequestBuilder {
            issue_instant: instant,
            ..self
        }
    }

    /// The ID the IdP's `LogoutResponse` must carry as `InResponseTo`.
    pub fn request_id(&self) -> &str {
        &self.id
    }

    pub fn to_xml(&self) -> Result<String> {
        message::to_xml(self)
    }

    pub fn create_params(&self, params: &[(&str, Option<&str>)]) -> Result<Vec<(String, String)>> {
        message::create_params(self, params)
    }

    pub fn create(&self, params: &[(&str, Option<&str>)]) -> Result<String> {
        message::create(self, params)
    }

    fn name_id(&self) -> NameId {
        let settings = self.settings;
        match &settings.name_identifier_value {
            Some(value) => NameId {
                name_qualifier: settings.idp_name_qualifier.clone(),
                sp_name_qualifier: settings.sp_name_qualifier.clone(),
                format: settings.name_identifier_format.clone(),
                content: value.clone(),
            },
            None => NameId {
                name_qualifier: None,
                sp_name_qualifier: None,
                format: Some(NAME_ID_FORMAT_TRANSIENT.to_string()),
                content: generate_id(),
            },
        }
    }
}

impl OutboundMessage for LogoutRequestBuilder<'_> {
    const PARAMETER: &'static str = "SAMLRequest";

    fn settings(&self) -> &Settings {
        self.settings
    }

    fn unsigned_xml(&self) -> Result<String> {
        let req = LogoutRequest {
            id: self.id.clone(),
            version: "2.0".to_string(),
            issue_instant: format_time(self.issue_instant)?,
            destination: self.settings.idp_slo_target_url.clone(),
            issuer: self.settings.issuer.clone(),
            name_id: self.name_id(),
            session_index: self.settings.sessionindex.clone(),
        };
        yaserde::ser::to_string(&req).map_err(SamlError::Serialization)
    }

    fn signed(&self) -> bool {
        self.settings.security.logout_requests_signed
    }

    fn compressed(&self) -> bool {
        self.settings.compress_request
    }

    fn destination(&self) -> Result<&str> {
        self.settings
            .idp_slo_target_url
            .as_deref()
            .filter(|url| !url.is_empty())
            .ok_or_else(|| {
                SamlError::Settings("Invalid settings, idp_slo_target_url is not set!".into())
            })
    }
}

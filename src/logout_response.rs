use time::OffsetDateTime;
use yaserde::YaSerialize;

use crate::{
    error::Result,
    message::{self, OutboundMessage},
    settings::Settings,
    utils::{format_time, generate_id},
    SamlError, STATUS_SUCCESS,
};

const DEFAULT_STATUS_MESSAGE: &str = "Successfully Signed Out";

#[derive(YaSerialize)]
#[yaserde(
  namespaces = {
    "samlp" = "urn:oasis:names:tc:SAML:2.0:protocol",
    "saml" = "urn:oasis:names:tc:SAML:2.0:assertion",
  },
  prefix = "samlp"
)]
struct LogoutResponse {
    #[yaserde(attribute = true, rename = "ID")]
    id: String,
    #[yaserde(attribute = true, rename = "Version")]
    version: String,
    #[yaserde(attribute = true, rename = "IssueInstant")]
    issue_instant: String,
    #[yaserde(attribute = true, rename = "InResponseTo")]
    in_response_to: Option<String>,
    #[yaserde(attribute = true, rename = "Destination")]
    destination: Option<String>,
    #[yaserde(rename = "Issuer", prefix = "saml")]
    issuer: Option<String>,
    #[yaserde(rename = "Status", prefix = "samlp")]
    status: Status,
}

#[derive(YaSerialize)]
struct Status {
    #[yaserde(rename = "StatusCode", prefix = "samlp")]
    status_code: StatusCode,
    #[yaserde(rename = "StatusMessage", prefix = "samlp")]
    status_message: String,
}

#[derive(YaSerialize)]
struct StatusCode {
    #[yaserde(attribute = true, rename = "Value")]
    value: String,
}

/// Builds the SP's answer to a `LogoutRequest` received from the IdP.
pub struct LogoutResponseBuilder<'a> {
    settings: &'a Settings,
    id: String,
    issue_instant: OffsetDateTime,
    in_response_to: Option<String>,
    status_message: String,
}

impl<'a> LogoutResponseBuilder<'a> {
    pub fn new(
        settings: &'a Settings,
        in_response_to: Option<&str>,
        status_message: Option<&str>,
    ) -> Self {
        LogoutResponseBuilder {
            settings,
            id: generate_id(),
            issue_instant: OffsetDateTime::now_utc(),
            in_response_to: in_response_to.map(Into::into),
            status_message: status_message.unwrap_or(DEFAULT_STATUS_MESSAGE).into(),
        }
    }

    pub fn id(self, id: &str) -> Self {
        LogoutResponseBuilder {
            id: id.into(),
            ..self
        }
    }

    pub fn issue_instant(self, instant: OffsetDateTime) -> Self {
        LogoutResponseBuilder {
            issue_instant: instant,
            ..self
        }
    }

    pub fn response_id(&self) -> &str {
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
}

impl OutboundMessage for LogoutResponseBuilder<'_> {
    const PARAMETER: &'static str = "SAMLResponse";

    fn settings(&self) -> &Settings {
        self.settings
    }

    fn unsigned_xml(&self) -> Result<String> {
        let res = LogoutResponse {
            id: self.id.clone(),
            version: "2.0".to_string(),
            issue_instant: format_time(self.issue_instant)?,
            in_response_to: self.in_response_to.clone(),
            destination: self.destination().ok().map(Into::into),
            issuer: self.settings.issuer.clone(),
            status: Status {
                status_code: StatusCode {
                    value: STATUS_SUCCESS.to_string(),
                },
                status_message: self.status_message.clone(),
            },
        };
        yaserde::ser::to_string(&res).map_err(SamlError::Serialization)
    }

    fn signed(&self) -> bool {
        self.settings.security.logout_responses_signed
    }

    fn compressed(&self) -> bool {
        self.settings.compress_response
    }

    /// The IdP's dedicated response endpoint, else its SLO endpoint.
    fn destination(&self) -> Result<&str> {
        let settings = self.settings;
        [
            &settings.idp_slo_response_service_url,
            &settings.idp_slo_target_url,
        ]
        .into_iter()
        .flatten()
        .map(String::as_str)
        .find(|url| !url.is_empty())
        .ok_or_else(|| {
            SamlError::Settings("Invalid settings, idp_slo_target_url is not set!".into())
        })
    }
}

#[cfg(test)]
mod tests {
    use libxml::parser::Parser as XmlParser;

    use super::*;
    use crate::{
        codec::{self, QueryParams},
        utils::{first_node, first_text, parse_certificate, xpath_context},
        xml_security::SignedDocument,
        SecurityPolicy,
    };

    const SP_CERT: &str = include_str!("../static/sp.crt");
    const SP_KEY: &str = include_str!("../static/sp.key");

    fn settings() -> Settings {
        Settings {
            issuer: Some("https://sp.example.com/saml/metadata".into()),
            idp_slo_target_url: Some("https://idp.example.org/slo/redirect".into()),
            ..Settings::default()
        }
    }

    #[test]
    fn answers_logout_request() {
        let settings = settings();
        let xml = LogoutResponseBuilder::new(&settings, Some("_logout_request_7a6b5c4d"), None)
            .to_xml()
            .unwrap();
        let document = XmlParser::default().parse_string(&xml).unwrap();
        let context = xpath_context(&document).unwrap();

        let root = document.get_root_element().unwrap();
        assert_eq!(
            root.get_attribute("InResponseTo").as_deref(),
            Some("_logout_request_7a6b5c4d")
        );
        assert_eq!(
            root.get_attribute("Destination").as_deref(),
            Some("https://idp.example.org/slo/redirect")
        );
        let code = first_node(&context, "//samlp:Status/samlp:StatusCode", None).unwrap();
        assert_eq!(code.get_attribute("Value").as_deref(), Some(STATUS_SUCCESS));
        assert_eq!(
            first_text(&context, "//samlp:Status/samlp:StatusMessage", None).as_deref(),
            Some("Successfully Signed Out")
        );
    }

    #[test]
    fn prefers_response_service_url() {
        let settings = Settings {
            idp_slo_response_service_url: Some("https://idp.example.org/slo/response".into()),
            ..settings()
        };
        let url = LogoutResponseBuilder::new(&settings, None, Some("Bye"))
            .create(&[("RelayState", Some("state"))])
            .unwrap();
        assert!(url.starts_with("https://idp.example.org/slo/response?SAMLResponse="));

        let params = QueryParams::parse(url.split_once('?').unwrap().1).unwrap();
        assert_eq!(params.get("RelayState"), Some("state"));
        let xml = codec::decode(params.get("SAMLResponse").unwrap()).unwrap();
        assert!(xml.contains("Bye"));
        assert!(!xml.contains("InResponseTo"));
    }

    #[test]
    fn embeds_signature_in_post_binding() {
        let settings = Settings {
            private_key: Some(SP_KEY.into()),
            certificate: Some(SP_CERT.into()),
            compress_response: false,
            security: SecurityPolicy {
                logout_responses_signed: true,
                embed_sign: true,
                ..SecurityPolicy::default()
            },
            ..settings()
        };
        let builder = LogoutResponseBuilder::new(&settings, Some("_logout_request_7a6b5c4d"), None);
        let xml = builder.to_xml().unwrap();
        let signed = SignedDocument::parse(&xml).unwrap();
        assert_eq!(signed.signed_element_id().as_deref(), Some(builder.response_id()));
        signed
            .validate_signature(&parse_certificate(SP_CERT).unwrap())
            .unwrap();
    }

    #[test]
    fn create_requires_a_destination() {
        let settings = Settings {
            idp_slo_target_url: None,
            ..settings()
        };
        assert!(LogoutResponseBuilder::new(&settings, None, None)
            .create(&[])
            .is_err());
    }
}

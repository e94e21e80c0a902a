//! `LogoutResponse` returned by the IdP after SP-initiated single logout.

use libxml::tree::Node;

use crate::{
    error::{Result, ValidationErrors},
    message::{decode_inbound, logout_signature_valid, root_attribute, LogoutOptions},
    schema,
    settings::Settings,
    utils::{find_nodes, uri_match, xpath_context},
    validation::{run_checks, Check, CheckResult},
    xml_security::SignedDocument,
    STATUS_SUCCESS,
};

pub struct IdpLogoutResponse<'a> {
    settings: &'a Settings,
    options: LogoutOptions,
    document: Option<SignedDocument>,
    errors: ValidationErrors,
}

impl<'a> IdpLogoutResponse<'a> {
    pub fn new(raw: &str, settings: &'a Settings, options: LogoutOptions) -> Result<Self> {
        Ok(IdpLogoutResponse {
            settings,
            options,
            document: decode_inbound(raw)?,
            errors: ValidationErrors::default(),
        })
    }

    pub fn validate(&self, collect_errors: bool) -> std::result::Result<(), ValidationErrors> {
        let checks: [Check<Self>; 5] = [
            Self::validate_success_status,
            Self::validate_structure,
            Self::validate_in_response_to,
            Self::validate_issuer,
            Self::validate_signature,
        ];
        run_checks(self, Self::validate_response_state, &checks, collect_errors)
    }

    pub fn is_valid(&mut self, collect_errors: bool) -> bool {
        self.errors = match self.validate(collect_errors) {
            Ok(()) => ValidationErrors::default(),
            Err(errors) => errors,
        };
        self.errors.is_empty()
    }

    pub fn errors(&self) -> &ValidationErrors {
        &self.errors
    }

    pub fn response(&self) -> &str {
        self.document.as_ref().map_or("", SignedDocument::xml)
    }

    pub fn id(&self) -> Option<String> {
        root_attribute(self.document.as_ref(), "ID")
    }

    pub fn in_response_to(&self) -> Option<String> {
        root_attribute(self.document.as_ref(), "InResponseTo")
    }

    pub fn issuer(&self) -> Option<String> {
        self.text("/samlp:LogoutResponse/saml:Issuer")
    }

    pub fn status_code(&self) -> Option<String> {
        self.nodes("/samlp:LogoutResponse/samlp:Status/samlp:StatusCode")
            .first()
            .and_then(|code| code.get_attribute("Value"))
    }

    pub fn status_message(&self) -> Option<String> {
        self.text("/samlp:LogoutResponse/samlp:Status/samlp:StatusMessage")
    }

    pub fn success(&self) -> bool {
        self.status_code().as_deref() == Some(STATUS_SUCCESS)
    }

    fn nodes(&self, xpath: &str) -> Vec<Node> {
        let Some(document) = &self.document else {
            return Vec::new();
        };
        match xpath_context(document.document()) {
            Ok(context) => find_nodes(&context, xpath, None),
            Err(_) => Vec::new(),
        }
    }

    fn text(&self, xpath: &str) -> Option<String> {
        self.nodes(xpath).first().map(Node::get_content)
    }

    fn validate_response_state(&self) -> CheckResult {
        if self.document.is_none() {
            return Err("Blank logout response".into());
        }
        if self.settings.issuer.is_none() {
            return Err("No issuer in settings of the logout response".into());
        }
        if !self.settings.has_idp_credentials() {
            return Err("No fingerprint or certificate on settings of the logout response".into());
        }
        Ok(())
    }

    fn validate_success_status(&self) -> CheckResult {
        if self.success() {
            return Ok(());
        }
        Err(format!(
            "The status code of the Logout Response was not Success, was {}",
            self.status_code().unwrap_or_default()
        ))
    }

    fn validate_structure(&self) -> CheckResult {
        let Some(document) = &self.document else {
            return Ok(());
        };
        schema::validate_message(document.document()).map_err(|_| {
            "Invalid SAML Logout Response. Not match the saml-schema-protocol-2.0.xsd".to_string()
        })
    }

    fn validate_in_response_to(&self) -> CheckResult {
        let Some(expected) = self
            .options
            .matches_request_id
            .as_deref()
            .filter(|id| !id.is_empty())
        else {
            return Ok(());
        };
        let in_response_to = self.in_response_to();
        if in_response_to.as_deref() == Some(expected) {
            return Ok(());
        }
        Err(format!(
            "The InResponseTo of the Logout Response: {}, does not match the ID of the Logout Request sent by the SP: {expected}",
            in_response_to.unwrap_or_default()
        ))
    }

    fn validate_issuer(&self) -> CheckResult {
        let (Some(expected), Some(issuer)) = (self.settings.idp_entity_id.as_deref(), self.issuer())
        else {
            return Ok(());
        };
        if !uri_match(&issuer, expected) {
            return Err(format!(
                "Doesn't match the issuer, expected: <{expected}>, but was: <{issuer}>"
            ));
        }
        Ok(())
    }

    fn validate_signature(&self) -> CheckResult {
        const ERROR: &str = "Invalid Signature on Logout Response";
        let Some(document) = &self.document else {
            return Ok(());
        };
        let embedded = !self.nodes("/samlp:LogoutResponse/ds:Signature").is_empty();
        match logout_signature_valid(
            "SAMLResponse",
            document.xml(),
            embedded,
            self.settings,
            &self.options,
        ) {
            Ok(true) => Ok(()),
            Ok(false) => Err(ERROR.into()),
            Err(error) => Err(format!("{ERROR}: {error}")),
        }
    }
}

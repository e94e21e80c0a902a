//! `LogoutRequest` sent by the IdP for IdP-initiated single logout.

use std::cell::OnceCell;

use libxml::tree::Node;
use time::OffsetDateTime;

use crate::{
    error::{Result, ValidationErrors},
    message::{decode_inbound, logout_signature_valid, root_attribute, LogoutOptions},
    schema,
    settings::Settings,
    utils::{find_nodes, first_node, format_time, parse_time, uri_match, xpath_context},
    validation::{run_checks, Check, CheckResult},
    xml_encryption::{decrypt_nameid, wrapped_elements},
    xml_security::SignedDocument,
    SamlError,
};

#[derive(Debug, Clone)]
struct NameId {
    value: String,
    format: Option<String>,
}

pub struct IdpLogoutRequest<'a> {
    settings: &'a Settings,
    options: LogoutOptions,
    document: Option<SignedDocument>,
    errors: ValidationErrors,
    name_id: OnceCell<Option<NameId>>,
}

impl<'a> IdpLogoutRequest<'a> {
    pub fn new(raw: &str, settings: &'a Settings, options: LogoutOptions) -> Result<Self> {
        Ok(IdpLogoutRequest {
            settings,
            options,
            document: decode_inbound(raw)?,
            errors: ValidationErrors::default(),
            name_id: OnceCell::new(),
        })
    }

    pub fn validate(&self, collect_errors: bool) -> std::result::Result<(), ValidationErrors> {
        let checks: [Check<Self>; 6] = [
            Self::validate_id,
            Self::validate_version,
            Self::validate_structure,
            Self::validate_not_on_or_after,
            Self::validate_issuer,
            Self::validate_signature,
        ];
        run_checks(self, Self::validate_request_state, &checks, collect_errors)
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

    pub fn request(&self) -> &str {
        self.document.as_ref().map_or("", SignedDocument::xml)
    }

    pub fn id(&self) -> Option<String> {
        root_attribute(self.document.as_ref(), "ID")
    }

    pub fn version(&self) -> Option<String> {
        root_attribute(self.document.as_ref(), "Version")
    }

    /// The NameID being logged out, decrypting an `EncryptedID` with the SP key.
    pub fn name_id(&self) -> Result<Option<&str>> {
        Ok(self.name_id_node()?.map(|name_id| name_id.value.as_str()))
    }

    pub fn name_id_format(&self) -> Result<Option<&str>> {
        Ok(self.name_id_node()?.and_then(|name_id| name_id.format.as_deref()))
    }

    pub fn issuer(&self) -> Option<String> {
        self.nodes("/samlp:LogoutRequest/saml:Issuer")
            .first()
            .map(Node::get_content)
    }

    pub fn not_on_or_after(&self) -> Result<Option<OffsetDateTime>> {
        root_attribute(self.document.as_ref(), "NotOnOrAfter")
            .map(|value| parse_time(&value))
            .transpose()
    }

    pub fn session_indexes(&self) -> Vec<String> {
        self.nodes("/samlp:LogoutRequest/samlp:SessionIndex")
            .iter()
            .map(Node::get_content)
            .collect()
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

    fn name_id_node(&self) -> Result<Option<&NameId>> {
        if let Some(name_id) = self.name_id.get() {
            return Ok(name_id.as_ref());
        }
        let name_id = match &self.document {
            Some(document) => {
                let context = xpath_context(document.document())?;
                match first_node(&context, "/samlp:LogoutRequest/saml:EncryptedID", None) {
                    Some(encrypted) => {
                        let key = self.settings.get_sp_key()?.ok_or_else(|| {
                            SamlError::Decryption(
                                "An EncryptedID found and no SP private key found on the settings to decrypt it"
                                    .into(),
                            )
                        })?;
                        let decrypted = decrypt_nameid(&context, &encrypted, &key)?;
                        let elements = wrapped_elements(&decrypted);
                        elements.first().map(name_id_from)
                    }
                    None => first_node(&context, "/samlp:LogoutRequest/saml:NameID", None)
                        .as_ref()
                        .map(name_id_from),
                }
            }
            None => None,
        };
        Ok(self.name_id.get_or_init(|| name_id).as_ref())
    }

    fn validate_request_state(&self) -> CheckResult {
        if self.document.is_none() {
            return Err("Blank logout request".into());
        }
        Ok(())
    }

    fn validate_id(&self) -> CheckResult {
        if self.id().is_none() {
            return Err("Missing ID attribute on Logout Request".into());
        }
        Ok(())
    }

    fn validate_version(&self) -> CheckResult {
        if self.version().as_deref() != Some("2.0") {
            return Err("Unsupported SAML version".into());
        }
        Ok(())
    }

    fn validate_structure(&self) -> CheckResult {
        let Some(document) = &self.document else {
            return Ok(());
        };
        schema::validate_message(document.document()).map_err(|_| {
            "Invalid SAML Logout Request. Not match the saml-schema-protocol-2.0.xsd".to_string()
        })
    }

    fn validate_not_on_or_after(&self) -> CheckResult {
        let Some(not_on_or_after) = self.not_on_or_after().map_err(|e| e.to_string())? else {
            return Ok(());
        };
        let now = self.options.now.unwrap_or_else(OffsetDateTime::now_utc);
        let limit = not_on_or_after + self.options.allowed_clock_drift;
        if now >= limit {
            return Err(format!(
                "Current time is on or after NotOnOrAfter ({} >= {})",
                format_time(now).map_err(|e| e.to_string())?,
                format_time(limit).map_err(|e| e.to_string())?
            ));
        }
        Ok(())
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
        const ERROR: &str = "Invalid Signature on Logout Request";
        let Some(document) = &self.document else {
            return Ok(());
        };
        let embedded = !self.nodes("/samlp:LogoutRequest/ds:Signature").is_empty();
        match logout_signature_valid(
            "SAMLRequest",
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

fn name_id_from(node: &Node) -> NameId {
    NameId {
        value: node.get_content(),
        format: node.get_attribute("Format"),
    }
}

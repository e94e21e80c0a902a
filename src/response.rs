//! The SAML `Response` delivered to the assertion consumer service.

use std::cell::OnceCell;

use libxml::{tree::Node, xpath::Context};
use time::{Duration, OffsetDateTime};
use tracing::{debug, warn};

use crate::{
    attributes::Attributes,
    error::{Result, ValidationErrors},
    message::{decode_inbound, root_attribute},
    schema,
    settings::Settings,
    utils::{
        find_nodes, first_node, format_time, namespace_of, parse_time, status_error_msg,
        uri_match, xpath_context, xpath_literal,
    },
    validation::{run_checks, Check, CheckResult},
    xml_encryption::{decrypt_assertion, decrypt_attribute, decrypt_nameid, wrapped_elements},
    xml_security::{verify_with_any, SignedDocument},
    SamlError, ASSERTION, BEARER, STATUS_SUCCESS,
};

/// Per-call knobs for [`Response::validate`].
#[derive(Debug, Clone, Default)]
pub struct ResponseOptions {
    /// ID of the `AuthnRequest` this response must answer.
    pub matches_request_id: Option<String>,
    pub allowed_clock_drift: Duration,
    pub skip_conditions: bool,
    pub skip_subject_confirmation: bool,
    pub skip_recipient_check: bool,
    pub skip_destination: bool,
    pub check_duplicated_attributes: bool,
    /// Overrides the clock, mainly for tests.
    pub now: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conditions {
    pub not_before: Option<OffsetDateTime>,
    pub not_on_or_after: Option<OffsetDateTime>,
}

#[derive(Debug, Clone)]
struct NameId {
    value: String,
    format: Option<String>,
    sp_name_qualifier: Option<String>,
    name_qualifier: Option<String>,
}

impl NameId {
    fn from_node(node: &Node) -> Self {
        NameId {
            value: node.get_content(),
            format: node.get_attribute("Format"),
            sp_name_qualifier: node.get_attribute("SPNameQualifier"),
            name_qualifier: node.get_attribute("NameQualifier"),
        }
    }
}

pub struct Response<'a> {
    settings: &'a Settings,
    options: ResponseOptions,
    document: Option<SignedDocument>,
    /// Twin of `document` with the `EncryptedAssertion` replaced by its plaintext.
    decrypted_document: Option<SignedDocument>,
    errors: ValidationErrors,
    name_id: OnceCell<Option<NameId>>,
    attributes: OnceCell<Attributes>,
}

impl<'a> Response<'a> {
    /// Decodes a response received over either binding, decrypting an
    /// `EncryptedAssertion` when there is one.
    pub fn new(raw: &str, settings: &'a Settings, options: ResponseOptions) -> Result<Self> {
        let document = decode_inbound(raw)?;
        let decrypted_document = match &document {
            Some(document) => decrypt_document(document, settings)?,
            None => None,
        };
        Ok(Response {
            settings,
            options,
            document,
            decrypted_document,
            errors: ValidationErrors::default(),
            name_id: OnceCell::new(),
            attributes: OnceCell::new(),
        })
    }

    /// Runs every check in order, stopping at the first failure unless
    /// `collect_errors` is set.
    pub fn validate(&self, collect_errors: bool) -> std::result::Result<(), ValidationErrors> {
        let checks: [Check<Self>; 18] = [
            Self::validate_version,
            Self::validate_id,
            Self::validate_success_status,
            Self::validate_num_assertion,
            Self::validate_no_duplicated_attributes,
            Self::validate_signed_elements,
            Self::validate_structure,
            Self::validate_in_response_to,
            Self::validate_one_conditions,
            Self::validate_conditions,
            Self::validate_one_authnstatement,
            Self::validate_audience,
            Self::validate_destination,
            Self::validate_issuer,
            Self::validate_session_expiration,
            Self::validate_subject_confirmation,
            Self::validate_name_id,
            Self::validate_signature,
        ];
        run_checks(self, Self::validate_response_state, &checks, collect_errors)
    }

    /// Like [`Response::validate`], keeping the failures for [`Response::errors`].
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

    /// The decoded XML as received.
    pub fn response(&self) -> &str {
        self.document.as_ref().map_or("", SignedDocument::xml)
    }

    pub fn document(&self) -> Option<&SignedDocument> {
        self.document.as_ref()
    }

    pub fn decrypted_document(&self) -> Option<&SignedDocument> {
        self.decrypted_document.as_ref()
    }

    pub fn allowed_clock_drift(&self) -> Duration {
        self.options.allowed_clock_drift
    }

    pub fn id(&self) -> Option<String> {
        root_attribute(self.document.as_ref(), "ID")
    }

    pub fn version(&self) -> Option<String> {
        root_attribute(self.document.as_ref(), "Version")
    }

    pub fn in_response_to(&self) -> Option<String> {
        self.response_node()?.get_attribute("InResponseTo")
    }

    pub fn destination(&self) -> Option<String> {
        self.response_node()?.get_attribute("Destination")
    }

    pub fn name_id(&self) -> Result<Option<&str>> {
        Ok(self.name_id_node()?.map(|name_id| name_id.value.as_str()))
    }

    pub fn name_id_format(&self) -> Result<Option<&str>> {
        Ok(self.name_id_node()?.and_then(|name_id| name_id.format.as_deref()))
    }

    pub fn name_id_spnamequalifier(&self) -> Result<Option<&str>> {
        Ok(self
            .name_id_node()?
            .and_then(|name_id| name_id.sp_name_qualifier.as_deref()))
    }

    pub fn name_id_namequalifier(&self) -> Result<Option<&str>> {
        Ok(self
            .name_id_node()?
            .and_then(|name_id| name_id.name_qualifier.as_deref()))
    }

    pub fn sessionindex(&self) -> Option<String> {
        self.signed_assertion_node("/saml:AuthnStatement")?
            .get_attribute("SessionIndex")
    }

    /// `SessionNotOnOrAfter` of the authentication statement.
    pub fn session_expires_at(&self) -> Result<Option<OffsetDateTime>> {
        match self.signed_assertion_node("/saml:AuthnStatement") {
            Some(node) => time_attribute(&node, "SessionNotOnOrAfter"),
            None => Ok(None),
        }
    }

    /// Attributes of the signed assertion, decrypting `EncryptedAttribute`s.
    pub fn attributes(&self) -> Result<&Attributes> {
        if let Some(attributes) = self.attributes.get() {
            return Ok(attributes);
        }
        let mut attributes = Attributes::new();
        for statement in self.signed_assertion_nodes("/saml:AttributeStatement") {
            for element in statement.get_child_elements() {
                if element.get_name() == "EncryptedAttribute" {
                    let key = self.settings.get_sp_key()?.ok_or_else(|| {
                        SamlError::Decryption(
                            "An EncryptedAttribute found and no SP private key found on the settings to decrypt it"
                                .into(),
                        )
                    })?;
                    let decrypted =
                        decrypt_attribute(&self.assertion_context()?, &element, &key)?;
                    for attribute in wrapped_elements(&decrypted) {
                        self.add_attribute(&mut attributes, &attribute)?;
                    }
                } else {
                    self.add_attribute(&mut attributes, &element)?;
                }
            }
        }
        Ok(self.attributes.get_or_init(|| attributes))
    }

    /// Value of the top-level `StatusCode`.
    pub fn status_code(&self) -> Option<String> {
        match self
            .response_nodes("/samlp:Response/samlp:Status/samlp:StatusCode")
            .as_slice()
        {
            [code] => code.get_attribute("Value"),
            _ => None,
        }
    }

    /// The top-level status code followed by its nested subcodes.
    pub fn status_codes(&self) -> Vec<String> {
        let mut codes = self.status_code().into_iter().collect::<Vec<_>>();
        codes.extend(
            self.response_nodes("/samlp:Response/samlp:Status/samlp:StatusCode/samlp:StatusCode")
                .iter()
                .filter_map(|node| node.get_attribute("Value")),
        );
        codes
    }

    pub fn status_message(&self) -> Option<String> {
        match self
            .response_nodes("/samlp:Response/samlp:Status/samlp:StatusMessage")
            .as_slice()
        {
            [message] => Some(message.get_content()),
            _ => None,
        }
    }

    pub fn success(&self) -> bool {
        self.status_code().as_deref() == Some(STATUS_SUCCESS)
    }

    pub fn conditions(&self) -> Result<Option<Conditions>> {
        let Some(node) = self.signed_assertion_node("/saml:Conditions") else {
            return Ok(None);
        };
        Ok(Some(Conditions {
            not_before: time_attribute(&node, "NotBefore")?,
            not_on_or_after: time_attribute(&node, "NotOnOrAfter")?,
        }))
    }

    /// Distinct issuers of the Response and of its signed Assertion.
    pub fn issuers(&self) -> Result<Vec<String>> {
        let response_issuers = self.response_nodes("/samlp:Response/saml:Issuer");
        if response_issuers.len() != 1 {
            return Err(SamlError::Validation(
                "Issuer of the Response not found or multiple.".into(),
            ));
        }
        let assertion_issuers = self.signed_assertion_nodes("/saml:Issuer");
        if assertion_issuers.len() != 1 {
            return Err(SamlError::Validation(
                "Issuer of the Assertion not found or multiple.".into(),
            ));
        }
        let mut issuers = Vec::new();
        for node in response_issuers.iter().chain(&assertion_issuers) {
            let issuer = node.get_content();
            if !issuer.is_empty() && !issuers.contains(&issuer) {
                issuers.push(issuer);
            }
        }
        Ok(issuers)
    }

    pub fn audiences(&self) -> Vec<String> {
        self.signed_assertion_nodes("/saml:Conditions/saml:AudienceRestriction/saml:Audience")
            .iter()
            .map(Node::get_content)
            .filter(|audience| !audience.is_empty())
            .collect()
    }

    fn now(&self) -> OffsetDateTime {
        self.options.now.unwrap_or_else(OffsetDateTime::now_utc)
    }

    fn response_node(&self) -> Option<Node> {
        self.response_nodes("/samlp:Response").into_iter().next()
    }

    fn response_nodes(&self, xpath: &str) -> Vec<Node> {
        let Some(document) = &self.document else {
            return Vec::new();
        };
        match xpath_context(document.document()) {
            Ok(context) => find_nodes(&context, xpath, None),
            Err(_) => Vec::new(),
        }
    }

    /// The document assertions are read from: the decrypted twin when there is one.
    fn assertion_document(&self) -> Option<&SignedDocument> {
        self.decrypted_document.as_ref().or(self.document.as_ref())
    }

    fn assertion_context(&self) -> Result<Context> {
        let document = self
            .assertion_document()
            .ok_or_else(|| SamlError::InvalidResponse("Blank response".into()))?;
        xpath_context(document.document())
    }

    /// Nodes below the assertion that is signed itself or whose parent
    /// Response is signed; nothing else is trusted.
    fn signed_assertion_nodes(&self, subelement: &str) -> Vec<Node> {
        let Some(document) = self.assertion_document() else {
            return Vec::new();
        };
        let Some(id) = document.signed_element_id() else {
            return Vec::new();
        };
        let Ok(context) = xpath_context(document.document()) else {
            return Vec::new();
        };
        let id = xpath_literal(&id);
        let mut nodes = find_nodes(
            &context,
            &format!("/samlp:Response/saml:Assertion[@ID={id}]{subelement}"),
            None,
        );
        nodes.extend(find_nodes(
            &context,
            &format!("/samlp:Response[@ID={id}]/saml:Assertion{subelement}"),
            None,
        ));
        nodes
    }

    fn signed_assertion_node(&self, subelement: &str) -> Option<Node> {
        self.signed_assertion_nodes(subelement).into_iter().next()
    }

    fn name_id_node(&self) -> Result<Option<&NameId>> {
        if let Some(name_id) = self.name_id.get() {
            return Ok(name_id.as_ref());
        }
        let name_id = match self.signed_assertion_node("/saml:Subject/saml:EncryptedID") {
            Some(encrypted) => {
                let key = self.settings.get_sp_key()?.ok_or_else(|| {
                    SamlError::Decryption(
                        "An EncryptedID found and no SP private key found on the settings to decrypt it"
                            .into(),
                    )
                })?;
                let decrypted = decrypt_nameid(&self.assertion_context()?, &encrypted, &key)?;
                let elements = wrapped_elements(&decrypted);
                elements.first().map(NameId::from_node)
            }
            None => self
                .signed_assertion_node("/saml:Subject/saml:NameID")
                .as_ref()
                .map(NameId::from_node),
        };
        Ok(self.name_id.get_or_init(|| name_id).as_ref())
    }

    fn add_attribute(&self, attributes: &mut Attributes, node: &Node) -> Result<()> {
        let name = node.get_attribute("Name").unwrap_or_default();
        if self.options.check_duplicated_attributes && attributes.contains(&name) {
            return Err(SamlError::Validation(
                "Found an Attribute element with duplicated Name".into(),
            ));
        }
        let values = node
            .get_child_elements()
            .iter()
            .flat_map(attribute_values)
            .collect::<Vec<_>>();
        attributes.add(&name, values);
        Ok(())
    }

    fn validate_response_state(&self) -> CheckResult {
        if self.document.is_none() {
            return Err("Blank response".into());
        }
        if !self.settings.has_idp_credentials() {
            return Err("No fingerprint or certificate on settings".into());
        }
        Ok(())
    }

    fn validate_version(&self) -> CheckResult {
        if self.version().as_deref() != Some("2.0") {
            return Err("Unsupported SAML version".into());
        }
        Ok(())
    }

    fn validate_id(&self) -> CheckResult {
        if self.id().is_none() {
            return Err("Missing ID attribute on SAML Response".into());
        }
        Ok(())
    }

    fn validate_success_status(&self) -> CheckResult {
        if self.success() {
            return Ok(());
        }
        Err(status_error_msg(
            "The status code of the Response was not Success",
            &self.status_codes(),
            self.status_message().as_deref(),
        ))
    }

    fn validate_num_assertion(&self) -> CheckResult {
        const ERROR: &str = "SAML Response must contain 1 assertion";
        let Some(document) = &self.document else {
            return Err(ERROR.into());
        };
        if count_nodes(document, "//saml:Assertion | //saml:EncryptedAssertion") != 1 {
            return Err(ERROR.into());
        }
        if let Some(decrypted) = &self.decrypted_document {
            if count_nodes(decrypted, "//saml:Assertion") != 1 {
                return Err(ERROR.into());
            }
        }
        Ok(())
    }

    fn validate_no_duplicated_attributes(&self) -> CheckResult {
        if !self.options.check_duplicated_attributes {
            return Ok(());
        }
        self.attributes().map(|_| ()).map_err(|e| e.to_string())
    }

    /// Only the Response and the Assertion may be signed, each at most once,
    /// and every signature must reference its own parent.
    fn validate_signed_elements(&self) -> CheckResult {
        let Some(document) = self.assertion_document() else {
            return Err("Blank response".into());
        };
        let context = xpath_context(document.document()).map_err(|e| e.to_string())?;
        let signatures = find_nodes(&context, "//ds:Signature", None);

        let mut signed_elements = Vec::new();
        let mut ids = Vec::new();
        let mut references = Vec::new();
        for signature in &signatures {
            let Some(parent) = signature.get_parent() else {
                return Err("Signed Element must contain an ID. SAML Response rejected".into());
            };
            let signed_element = parent.get_name();
            if signed_element != "Response" && signed_element != "Assertion" {
                return Err(format!(
                    "Invalid Signature Element '{signed_element}'. SAML Response rejected"
                ));
            }
            let Some(id) = parent.get_attribute("ID") else {
                return Err("Signed Element must contain an ID. SAML Response rejected".into());
            };
            if ids.contains(&id) {
                return Err("Duplicated ID. SAML Response rejected".into());
            }

            let uri = first_node(&context, ".//ds:Reference", Some(signature))
                .and_then(|reference| reference.get_attribute("URI"))
                .filter(|uri| !uri.is_empty());
            if let Some(uri) = uri {
                let reference = uri.chars().skip(1).collect::<String>();
                if reference != id {
                    return Err("Found an invalid Signed Element. SAML Response rejected".into());
                }
                if references.contains(&reference) {
                    return Err("Duplicated Reference URI. SAML Response rejected".into());
                }
                references.push(reference);
            }
            ids.push(id);
            signed_elements.push(signed_element);
        }

        if signatures.len() > 2 || signed_elements.is_empty() {
            return Err(
                "Found an unexpected number of Signature Element. SAML Response rejected".into(),
            );
        }
        if self.settings.security.want_assertions_signed
            && !signed_elements.iter().any(|element| element == "Assertion")
        {
            return Err(
                "The Assertion of the Response is not signed and the SP requires it".into(),
            );
        }
        Ok(())
    }

    fn validate_structure(&self) -> CheckResult {
        for document in self.document.iter().chain(&self.decrypted_document) {
            if let Err(reason) = schema::validate_message(document.document()) {
                debug!(%reason, "response does not match the schema");
                return Err(
                    "Invalid SAML Response. Not match the saml-schema-protocol-2.0.xsd".into(),
                );
            }
        }
        Ok(())
    }

    fn validate_in_response_to(&self) -> CheckResult {
        let Some(expected) = &self.options.matches_request_id else {
            return Ok(());
        };
        let in_response_to = self.in_response_to();
        if in_response_to.as_ref() == Some(expected) {
            return Ok(());
        }
        Err(format!(
            "The InResponseTo of the Response: {}, does not match the ID of the AuthNRequest sent by the SP: {expected}",
            in_response_to.unwrap_or_default()
        ))
    }

    fn validate_one_conditions(&self) -> CheckResult {
        if self.signed_assertion_nodes("/saml:Conditions").len() != 1 {
            return Err("The Assertion must include one Conditions element".into());
        }
        Ok(())
    }

    fn validate_conditions(&self) -> CheckResult {
        if self.options.skip_conditions {
            return Ok(());
        }
        let Some(conditions) = self.conditions().map_err(|e| e.to_string())? else {
            return Ok(());
        };
        let now = self.now();
        let drift = self.options.allowed_clock_drift;
        if let Some(not_before) = conditions.not_before {
            let now_with_drift = now + drift;
            if now_with_drift < not_before {
                return Err(format!(
                    "Current time is earlier than NotBefore condition ({} < {})",
                    timestamp(now_with_drift),
                    timestamp(not_before)
                ));
            }
        }
        if let Some(not_on_or_after) = conditions.not_on_or_after {
            let not_on_or_after_with_drift = not_on_or_after + drift;
            if now >= not_on_or_after_with_drift {
                return Err(format!(
                    "Current time is on or after NotOnOrAfter condition ({} >= {})",
                    timestamp(now),
                    timestamp(not_on_or_after_with_drift)
                ));
            }
        }
        Ok(())
    }

    fn validate_one_authnstatement(&self) -> CheckResult {
        if self.signed_assertion_nodes("/saml:AuthnStatement").len() != 1 {
            return Err("The Assertion must include one AuthnStatement element".into());
        }
        Ok(())
    }

    fn validate_audience(&self) -> CheckResult {
        let Some(issuer) = self.settings.issuer.as_deref().filter(|i| !i.is_empty()) else {
            return Ok(());
        };
        let audiences = self.audiences();
        if audiences.is_empty() || audiences.iter().any(|audience| audience == issuer) {
            return Ok(());
        }
        Err(format!(
            "{issuer} is not a valid audience for this Response - Valid audiences: {}",
            audiences.join(",")
        ))
    }

    fn validate_destination(&self) -> CheckResult {
        let Some(destination) = self.destination() else {
            return Ok(());
        };
        if self.options.skip_destination {
            return Ok(());
        }
        if destination.is_empty() {
            return Err("The response has an empty Destination value".into());
        }
        let Some(acs) = self
            .settings
            .assertion_consumer_service_url
            .as_deref()
            .filter(|url| !url.is_empty())
        else {
            return Ok(());
        };
        if !uri_match(&destination, acs) {
            return Err(format!(
                "The response was received at {destination} instead of {acs}"
            ));
        }
        Ok(())
    }

    fn validate_issuer(&self) -> CheckResult {
        let Some(expected) = self.settings.idp_entity_id.as_deref() else {
            return Ok(());
        };
        for issuer in self.issuers().map_err(|e| e.to_string())? {
            if !uri_match(&issuer, expected) {
                return Err(format!(
                    "Doesn't match the issuer, expected: <{expected}>, but was: <{issuer}>"
                ));
            }
        }
        Ok(())
    }

    fn validate_session_expiration(&self) -> CheckResult {
        let Some(expires_at) = self.session_expires_at().map_err(|e| e.to_string())? else {
            return Ok(());
        };
        if self.now() < expires_at + self.options.allowed_clock_drift {
            return Ok(());
        }
        Err("The attributes have expired, based on the SessionNotOnOrAfter of the AttributeStatement of this Response".into())
    }

    fn validate_subject_confirmation(&self) -> CheckResult {
        if self.options.skip_subject_confirmation {
            return Ok(());
        }
        let now = self.now();
        let drift = self.options.allowed_clock_drift;
        let in_response_to = self.in_response_to();
        let acs = self.settings.assertion_consumer_service_url.as_deref();

        for confirmation in self.signed_assertion_nodes("/saml:Subject/saml:SubjectConfirmation") {
            if confirmation
                .get_attribute("Method")
                .is_some_and(|method| method != BEARER)
            {
                continue;
            }
            let Some(data) = confirmation.get_child_elements().into_iter().find(|child| {
                child.get_name() == "SubjectConfirmationData"
                    && namespace_of(child).as_deref() == Some(ASSERTION)
            }) else {
                continue;
            };
            if data
                .get_attribute("InResponseTo")
                .is_some_and(|value| Some(&value) != in_response_to.as_ref())
            {
                continue;
            }
            if let Some(value) = data.get_attribute("NotOnOrAfter") {
                match parse_time(&value) {
                    Ok(not_on_or_after) if not_on_or_after + drift > now => {}
                    _ => continue,
                }
            }
            if let Some(value) = data.get_attribute("NotBefore") {
                match parse_time(&value) {
                    Ok(not_before) if not_before <= now + drift => {}
                    _ => continue,
                }
            }
            if let Some(recipient) = data.get_attribute("Recipient") {
                if !self.options.skip_recipient_check && Some(recipient.as_str()) != acs {
                    continue;
                }
            }
            return Ok(());
        }
        Err("A valid SubjectConfirmation was not found on this Response".into())
    }

    fn validate_name_id(&self) -> CheckResult {
        let Some(name_id) = self.name_id_node().map_err(|e| e.to_string())? else {
            if self.settings.security.want_name_id {
                return Err("No NameID element found in the assertion of the Response".into());
            }
            return Ok(());
        };
        if name_id.value.is_empty() {
            return Err("An empty NameID value found".into());
        }
        if let Some(issuer) = self.settings.issuer.as_deref().filter(|i| !i.is_empty()) {
            if name_id
                .sp_name_qualifier
                .as_deref()
                .is_some_and(|qualifier| !qualifier.is_empty() && qualifier != issuer)
            {
                return Err("The SPNameQualifier value mistmatch the SP entityID value.".into());
            }
        }
        Ok(())
    }

    /// Verifies the Response signature when there is one, else the signature
    /// of the Assertion.
    fn validate_signature(&self) -> CheckResult {
        const ERROR: &str = "Invalid Signature on SAML Response";
        let Some(original) = &self.document else {
            return Err(ERROR.into());
        };

        let response_signatures = original.signed_element_id().map_or(0, |id| {
            count_nodes(
                original,
                &format!("/samlp:Response[@ID={}]/ds:Signature", xpath_literal(&id)),
            )
        });
        let document = match &self.decrypted_document {
            Some(decrypted) if response_signatures != 1 => decrypted,
            _ => original,
        };
        let signatures = if response_signatures == 0 {
            document.signed_element_id().map_or(0, |id| {
                count_nodes(
                    document,
                    &format!(
                        "/samlp:Response/saml:Assertion[@ID={}]/ds:Signature",
                        xpath_literal(&id)
                    ),
                )
            })
        } else {
            response_signatures
        };
        if signatures != 1 {
            return Err(ERROR.into());
        }

        if self.signature_verified(document) {
            Ok(())
        } else {
            Err(ERROR.into())
        }
    }

    /// Rollover certificates take precedence over the single certificate or
    /// fingerprint.
    fn signature_verified(&self, document: &SignedDocument) -> bool {
        let settings = self.settings;
        let multi = match settings.get_idp_cert_multi() {
            Ok(multi) => multi,
            Err(error) => {
                warn!(%error, "unusable IdP certificate");
                return false;
            }
        };
        if let Some((signing, _)) = multi.filter(|(signing, _)| !signing.is_empty()) {
            return verify_with_any(document.xml(), &signing);
        }

        match (settings.get_fingerprint(), settings.get_idp_cert()) {
            (Ok(Some(fingerprint)), Ok(cert)) => match document.validate_document(
                &fingerprint,
                settings.idp_cert_fingerprint_algorithm,
                cert.as_ref(),
            ) {
                Ok(()) => true,
                Err(error) => {
                    warn!(%error, "response signature rejected");
                    false
                }
            },
            (Err(error), _) | (_, Err(error)) => {
                warn!(%error, "unusable IdP certificate");
                false
            }
            _ => false,
        }
    }
}

fn decrypt_document(
    document: &SignedDocument,
    settings: &Settings,
) -> Result<Option<SignedDocument>> {
    let context = xpath_context(document.document())?;
    let Some(encrypted) = first_node(&context, "/samlp:Response/saml:EncryptedAssertion", None)
    else {
        return Ok(None);
    };
    let key = settings.get_sp_key()?.ok_or_else(|| {
        SamlError::Decryption(
            "An EncryptedAssertion found and no SP private key found on the settings to decrypt it"
                .into(),
        )
    })?;
    let assertion = decrypt_assertion(&context, &encrypted, &key)?;
    let xml = replace_element(document.xml(), &encrypted, &assertion)?;
    debug!(%xml, "decrypted assertion");
    SignedDocument::parse(&xml).map(Some)
}

/// Splices `replacement` over the first occurrence of `node` in `xml`.
fn replace_element(xml: &str, node: &Node, replacement: &str) -> Result<String> {
    let name = match node.get_namespace().map(|ns| ns.get_prefix()) {
        Some(prefix) if !prefix.is_empty() => format!("{prefix}:{}", node.get_name()),
        _ => node.get_name(),
    };
    let missing = || SamlError::Decryption(format!("{name} element not found"));
    let start = xml.find(&format!("<{name}")).ok_or_else(missing)?;
    let closing = format!("</{name}>");
    let end = xml[start..]
        .find(&closing)
        .map(|index| start + index + closing.len())
        .ok_or_else(missing)?;
    Ok(format!("{}{}{}", &xml[..start], replacement, &xml[end..]))
}

fn count_nodes(document: &SignedDocument, xpath: &str) -> usize {
    xpath_context(document.document())
        .map(|context| find_nodes(&context, xpath, None).len())
        .unwrap_or(0)
}

fn time_attribute(node: &Node, name: &str) -> Result<Option<OffsetDateTime>> {
    node.get_attribute(name)
        .map(|value| parse_time(&value))
        .transpose()
}

fn timestamp(instant: OffsetDateTime) -> String {
    format_time(instant).unwrap_or_else(|_| instant.to_string())
}

/// Values of one `AttributeValue`: its text, nothing when it is `xsi:nil`, or
/// the nested NameIDs as `NameQualifier/value`.
fn attribute_values(value: &Node) -> Vec<String> {
    let children = value.get_child_elements();
    if children.is_empty() {
        return match value.get_attribute("nil").as_deref() {
            Some("true") | Some("1") => Vec::new(),
            _ => vec![value.get_content()],
        };
    }
    children
        .iter()
        .filter(|child| {
            child.get_name() == "NameID" && namespace_of(child).as_deref() == Some(ASSERTION)
        })
        .map(|name_id| match name_id.get_attribute("NameQualifier") {
            Some(qualifier) => format!("{qualifier}/{}", name_id.get_content()),
            None => name_id.get_content(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;
    use crate::{codec, IdpCertMulti, SecurityPolicy, NAME_ID_FORMAT_EMAIL_ADDRESS};

    const IDP_CERT: &str = include_str!("../static/idp.crt");
    const IDP2_CERT: &str = include_str!("../static/idp2.crt");
    const SP_KEY: &str = include_str!("../static/sp.key");
    const WRONG_KEY: &str = include_str!("../static/wrong.key");

    const SIGNED_ASSERTION: &str = include_str!("../static/response_signed_assertion.xml");
    const SIGNED_MESSAGE: &str = include_str!("../static/response_signed_message.xml");
    const DOUBLE_SIGNED: &str = include_str!("../static/response_double_signed.xml");
    const UNSIGNED: &str = include_str!("../static/response_unsigned.xml");
    const WRAPPED: &str = include_str!("../static/response_wrapped.xml");
    const TWO_ASSERTIONS: &str = include_str!("../static/response_two_assertions.xml");
    const STATUS_REQUESTER: &str = include_str!("../static/response_status_requester.xml");
    const ENCRYPTED_ASSERTION: &str = include_str!("../static/response_encrypted_assertion.xml");
    const ENCRYPTED_NAMEID: &str = include_str!("../static/response_encrypted_nameid.xml");

    const IDP: &str = "https://idp.example.org/metadata";
    const SP: &str = "https://sp.example.com/saml/metadata";
    const ACS: &str = "https://sp.example.com/saml/acs";
    const REQUEST_ID: &str = "_request_0123456789abcdef";

    fn settings() -> Settings {
        Settings {
            idp_entity_id: Some(IDP.into()),
            idp_cert: Some(IDP_CERT.into()),
            issuer: Some(SP.into()),
            assertion_consumer_service_url: Some(ACS.into()),
            private_key: Some(SP_KEY.into()),
            ..Settings::default()
        }
    }

    fn options() -> ResponseOptions {
        ResponseOptions {
            matches_request_id: Some(REQUEST_ID.into()),
            now: Some(datetime!(2025-01-08 16:31:00 UTC)),
            ..ResponseOptions::default()
        }
    }

    fn parse<'a>(xml: &str, settings: &'a Settings, options: ResponseOptions) -> Response<'a> {
        Response::new(&codec::encode_message(xml, false), settings, options).unwrap()
    }

    fn first_error(xml: &str, settings: &Settings, options: ResponseOptions) -> String {
        let response = parse(xml, settings, options);
        response.validate(false).unwrap_err().0.remove(0)
    }

    #[test]
    fn validates_signed_assertion() {
        let settings = settings();
        let response = parse(SIGNED_ASSERTION, &settings, options());
        response.validate(false).unwrap();
        response.validate(true).unwrap();

        assert_eq!(response.name_id().unwrap(), Some("user@example.org"));
        assert_eq!(
            response.name_id_format().unwrap(),
            Some(NAME_ID_FORMAT_EMAIL_ADDRESS)
        );
        assert_eq!(response.name_id_spnamequalifier().unwrap(), Some(SP));
        assert_eq!(response.name_id_namequalifier().unwrap(), None);
        assert_eq!(response.sessionindex().as_deref(), Some("_session_5f4e3d2c1b"));
        assert_eq!(
            response.session_expires_at().unwrap(),
            Some(datetime!(2025-01-09 00:30:00 UTC))
        );
        assert!(response.success());
        assert_eq!(response.status_code().as_deref(), Some(STATUS_SUCCESS));
        assert_eq!(response.issuers().unwrap(), [IDP]);
        assert_eq!(response.audiences(), [SP]);
        assert_eq!(response.in_response_to().as_deref(), Some(REQUEST_ID));
        assert_eq!(response.destination().as_deref(), Some(ACS));
        assert_eq!(
            response.conditions().unwrap(),
            Some(Conditions {
                not_before: Some(datetime!(2025-01-08 16:25:00 UTC)),
                not_on_or_after: Some(datetime!(2025-01-08 16:35:00 UTC)),
            })
        );

        let attributes = response.attributes().unwrap();
        assert_eq!(
            attributes.names().collect::<Vec<_>>(),
            ["mail", "groups", "uid", "nickname"]
        );
        assert_eq!(attributes.single("mail"), Some("user@example.org"));
        assert_eq!(
            attributes.multi("groups").unwrap(),
            ["admins".to_string(), "staff".to_string()]
        );
        assert_eq!(attributes.multi("nickname").unwrap().len(), 0);
    }

    #[test]
    fn validates_signed_and_double_signed_messages() {
        let settings = settings();
        for xml in [SIGNED_MESSAGE, DOUBLE_SIGNED] {
            let response = parse(xml, &settings, options());
            response.validate(false).unwrap();
            assert_eq!(response.name_id().unwrap(), Some("user@example.org"));
        }
    }

    #[test]
    fn accepts_fingerprint_and_rollover_certificates() {
        let by_fingerprint = Settings {
            idp_cert: None,
            idp_cert_fingerprint: Some(
                "1A:32:76:47:E6:10:C9:82:A2:8B:8F:ED:AE:C7:81:F9:FB:C4:65:D1".into(),
            ),
            ..settings()
        };
        parse(SIGNED_ASSERTION, &by_fingerprint, options())
            .validate(false)
            .unwrap();

        let rollover = Settings {
            idp_cert: None,
            idp_cert_multi: Some(IdpCertMulti {
                signing: vec![IDP2_CERT.into(), IDP_CERT.into()],
                encryption: Vec::new(),
            }),
            ..settings()
        };
        parse(DOUBLE_SIGNED, &rollover, options())
            .validate(false)
            .unwrap();
    }

    #[test]
    fn rejects_blank_response_and_missing_credentials() {
        let settings = settings();
        let response = Response::new("", &settings, options()).unwrap();
        assert_eq!(response.validate(true).unwrap_err().0, ["Blank response"]);
        assert_eq!(response.response(), "");

        let no_credentials = Settings {
            idp_cert: None,
            ..settings.clone()
        };
        assert_eq!(
            first_error(SIGNED_ASSERTION, &no_credentials, options()),
            "No fingerprint or certificate on settings"
        );
    }

    #[test]
    fn rejects_unsupported_version_and_missing_id() {
        let settings = settings();
        let old = SIGNED_ASSERTION.replace(
            r#"ID="_response_9f8e7d6c5b4a" Version="2.0""#,
            r#"ID="_response_9f8e7d6c5b4a" Version="1.0""#,
        );
        assert_eq!(first_error(&old, &settings, options()), "Unsupported SAML version");

        let anonymous = SIGNED_ASSERTION.replace(r#"ID="_response_9f8e7d6c5b4a" "#, "");
        assert_eq!(
            first_error(&anonymous, &settings, options()),
            "Missing ID attribute on SAML Response"
        );
    }

    #[test]
    fn reports_failed_status() {
        let settings = settings();
        let response = parse(STATUS_REQUESTER, &settings, options());
        assert!(!response.success());
        assert_eq!(
            response.status_codes(),
            [
                "urn:oasis:names:tc:SAML:2.0:status:Requester",
                "urn:oasis:names:tc:SAML:2.0:status:RequestDenied"
            ]
        );
        assert_eq!(
            response.status_message().as_deref(),
            Some("The request was denied")
        );
        assert_eq!(
            response.validate(false).unwrap_err().0,
            ["The status code of the Response was not Success, was Requester => RequestDenied -> The request was denied"]
        );
    }

    #[test]
    fn rejects_two_assertions() {
        assert_eq!(
            first_error(TWO_ASSERTIONS, &settings(), options()),
            "SAML Response must contain 1 assertion"
        );
    }

    #[test]
    fn rejects_duplicated_attributes() {
        let settings = settings();
        let duplicated = SIGNED_ASSERTION.replace(r#"Name="uid""#, r#"Name="mail""#);
        let options = ResponseOptions {
            check_duplicated_attributes: true,
            ..options()
        };
        let response = parse(&duplicated, &settings, options);
        assert!(matches!(response.attributes(), Err(SamlError::Validation(_))));
        assert_eq!(
            response.validate(false).unwrap_err().0,
            ["Found an Attribute element with duplicated Name"]
        );
    }

    #[test]
    fn rejects_unsigned_and_wrapped_responses() {
        let settings = settings();
        assert_eq!(
            first_error(UNSIGNED, &settings, options()),
            "Found an unexpected number of Signature Element. SAML Response rejected"
        );
        assert_eq!(
            parse(UNSIGNED, &settings, options()).name_id().unwrap(),
            None
        );
        let errors = parse(UNSIGNED, &settings, options()).validate(true).unwrap_err();
        assert_eq!(
            errors.iter().last(),
            Some("Invalid Signature on SAML Response")
        );
        assert_eq!(
            first_error(WRAPPED, &settings, options()),
            "Found an invalid Signed Element. SAML Response rejected"
        );
    }

    #[test]
    fn rejects_misplaced_signatures() {
        let settings = settings();
        let in_subject = SIGNED_ASSERTION.replacen(
            "<saml:Subject>",
            "<saml:Subject><ds:Signature xmlns:ds=\"http://www.w3.org/2000/09/xmldsig#\"><ds:SignedInfo><ds:Reference URI=\"#_assertion_0a1b2c3d4e5f\"/></ds:SignedInfo></ds:Signature>",
            1,
        );
        assert_eq!(
            first_error(&in_subject, &settings, options()),
            "Invalid Signature Element 'Subject'. SAML Response rejected"
        );

        let without_id = SIGNED_ASSERTION.replacen(
            "<saml:Assertion ID=\"_assertion_0a1b2c3d4e5f\"",
            "<saml:Assertion",
            1,
        );
        assert_eq!(
            first_error(&without_id, &settings, options()),
            "Signed Element must contain an ID. SAML Response rejected"
        );

        let shared_id = DOUBLE_SIGNED.replacen(
            "ID=\"_assertion_0a1b2c3d4e5f\"",
            "ID=\"_response_9f8e7d6c5b4a\"",
            1,
        );
        assert_eq!(
            first_error(&shared_id, &settings, options()),
            "Duplicated ID. SAML Response rejected"
        );
    }

    #[test]
    fn requires_signed_assertion_when_asked() {
        let settings = Settings {
            security: SecurityPolicy {
                want_assertions_signed: true,
                ..SecurityPolicy::default()
            },
            ..settings()
        };
        assert_eq!(
            first_error(SIGNED_MESSAGE, &settings, options()),
            "The Assertion of the Response is not signed and the SP requires it"
        );
        parse(DOUBLE_SIGNED, &settings, options())
            .validate(false)
            .unwrap();
    }

    #[test]
    fn rejects_invalid_structure() {
        let reordered = SIGNED_ASSERTION.replace(
            "<samlp:Status><samlp:StatusCode Value=\"urn:oasis:names:tc:SAML:2.0:status:Success\"/></samlp:Status>",
            "",
        );
        let reordered = reordered.replace(
            "</samlp:Response>",
            "<samlp:Status><samlp:StatusCode Value=\"urn:oasis:names:tc:SAML:2.0:status:Success\"/></samlp:Status></samlp:Response>",
        );
        let settings = settings();
        let response = parse(&reordered, &settings, options());
        assert!(response.success());
        assert_eq!(
            response.validate(false).unwrap_err().0,
            ["Invalid SAML Response. Not match the saml-schema-protocol-2.0.xsd"]
        );
    }

    #[test]
    fn rejects_unexpected_in_response_to() {
        let options = ResponseOptions {
            matches_request_id: Some("_other_request".into()),
            ..options()
        };
        assert_eq!(
            first_error(SIGNED_ASSERTION, &settings(), options),
            "The InResponseTo of the Response: _request_0123456789abcdef, does not match the ID of the AuthNRequest sent by the SP: _other_request"
        );
    }

    #[test]
    fn enforces_conditions_with_clock_drift() {
        let settings = settings();
        let early = ResponseOptions {
            now: Some(datetime!(2025-01-08 16:20:00 UTC)),
            ..options()
        };
        assert!(first_error(SIGNED_ASSERTION, &settings, early)
            .starts_with("Current time is earlier than NotBefore condition"));

        let late = ResponseOptions {
            now: Some(datetime!(2025-01-08 16:40:00 UTC)),
            ..options()
        };
        assert!(first_error(SIGNED_ASSERTION, &settings, late.clone())
            .starts_with("Current time is on or after NotOnOrAfter condition"));

        let drifting = ResponseOptions {
            allowed_clock_drift: Duration::minutes(10),
            ..late.clone()
        };
        parse(SIGNED_ASSERTION, &settings, drifting)
            .validate(false)
            .unwrap();

        let skipping = ResponseOptions {
            skip_conditions: true,
            ..late
        };
        assert_eq!(
            first_error(SIGNED_ASSERTION, &settings, skipping),
            "A valid SubjectConfirmation was not found on this Response"
        );
    }

    #[test]
    fn requires_one_conditions_element_even_when_skipping_conditions() {
        let start = SIGNED_ASSERTION.find("<saml:Conditions").unwrap();
        let end = SIGNED_ASSERTION.find("</saml:Conditions>").unwrap() + "</saml:Conditions>".len();
        let without_conditions = format!(
            "{}{}",
            &SIGNED_ASSERTION[..start],
            &SIGNED_ASSERTION[end..]
        );
        let settings = settings();
        let skipping = ResponseOptions {
            skip_conditions: true,
            ..options()
        };
        assert_eq!(
            first_error(&without_conditions, &settings, skipping.clone()),
            "The Assertion must include one Conditions element"
        );
        let errors = parse(&without_conditions, &settings, skipping)
            .validate(true)
            .unwrap_err();
        assert!(errors.contains("The Assertion must include one Conditions element"));
    }

    #[test]
    fn requires_one_authn_statement() {
        let start = SIGNED_ASSERTION.find("<saml:AuthnStatement").unwrap();
        let end =
            SIGNED_ASSERTION.find("</saml:AuthnStatement>").unwrap() + "</saml:AuthnStatement>".len();
        let statement = &SIGNED_ASSERTION[start..end];
        let two_statements = SIGNED_ASSERTION.replacen(statement, &statement.repeat(2), 1);
        assert_eq!(
            first_error(&two_statements, &settings(), options()),
            "The Assertion must include one AuthnStatement element"
        );
    }

    #[test]
    fn rejects_foreign_audience() {
        let settings = Settings {
            issuer: Some("https://other-sp.example.com".into()),
            ..settings()
        };
        assert_eq!(
            first_error(SIGNED_ASSERTION, &settings, options()),
            "https://other-sp.example.com is not a valid audience for this Response - Valid audiences: https://sp.example.com/saml/metadata"
        );
    }

    #[test]
    fn checks_destination() {
        let moved = Settings {
            assertion_consumer_service_url: Some("https://sp.example.com/other".into()),
            ..settings()
        };
        assert_eq!(
            first_error(SIGNED_ASSERTION, &moved, options()),
            "The response was received at https://sp.example.com/saml/acs instead of https://sp.example.com/other"
        );

        let settings = settings();
        let empty = SIGNED_ASSERTION.replace(&format!(r#"Destination="{ACS}""#), r#"Destination="""#);
        assert_eq!(
            first_error(&empty, &settings, options()),
            "The response has an empty Destination value"
        );
        let skipping = ResponseOptions {
            skip_destination: true,
            ..options()
        };
        parse(&empty, &settings, skipping).validate(false).unwrap();
    }

    #[test]
    fn checks_issuers() {
        let settings = Settings {
            idp_entity_id: Some("https://other-idp.example.net/metadata".into()),
            ..settings()
        };
        assert_eq!(
            first_error(SIGNED_ASSERTION, &settings, options()),
            "Doesn't match the issuer, expected: <https://other-idp.example.net/metadata>, but was: <https://idp.example.org/metadata>"
        );

        let without_issuer = SIGNED_ASSERTION.replacen(
            &format!("<saml:Issuer>{IDP}</saml:Issuer><samlp:Status>"),
            "<samlp:Status>",
            1,
        );
        let settings = self::settings();
        let response = parse(&without_issuer, &settings, options());
        assert!(matches!(response.issuers(), Err(SamlError::Validation(_))));
        assert_eq!(
            response.validate(false).unwrap_err().0,
            ["Issuer of the Response not found or multiple."]
        );

        let without_assertion_issuer = SIGNED_ASSERTION.replacen(
            &format!("<saml:Issuer>{IDP}</saml:Issuer><ds:Signature"),
            "<ds:Signature",
            1,
        );
        let response = parse(&without_assertion_issuer, &settings, options());
        assert!(matches!(response.issuers(), Err(SamlError::Validation(_))));
        assert!(response
            .validate(true)
            .unwrap_err()
            .contains("Issuer of the Assertion not found or multiple."));
    }

    #[test]
    fn rejects_expired_session() {
        let options = ResponseOptions {
            now: Some(datetime!(2025-01-09 01:00:00 UTC)),
            skip_conditions: true,
            skip_subject_confirmation: true,
            ..options()
        };
        assert_eq!(
            first_error(SIGNED_ASSERTION, &settings(), options),
            "The attributes have expired, based on the SessionNotOnOrAfter of the AttributeStatement of this Response"
        );
    }

    #[test]
    fn checks_subject_confirmation_recipient() {
        let settings = Settings {
            assertion_consumer_service_url: Some("https://sp.example.com/other".into()),
            ..settings()
        };
        let options = ResponseOptions {
            skip_destination: true,
            ..options()
        };
        assert_eq!(
            first_error(SIGNED_ASSERTION, &settings, options.clone()),
            "A valid SubjectConfirmation was not found on this Response"
        );
        let skipping = ResponseOptions {
            skip_recipient_check: true,
            ..options
        };
        parse(SIGNED_ASSERTION, &settings, skipping)
            .validate(false)
            .unwrap();
    }

    #[test]
    fn checks_name_id() {
        let settings = Settings {
            security: SecurityPolicy {
                want_name_id: true,
                ..SecurityPolicy::default()
            },
            ..settings()
        };
        let errors = parse(UNSIGNED, &settings, options())
            .validate(true)
            .unwrap_err();
        assert!(errors.contains("No NameID element found in the assertion of the Response"));
        assert!(errors.len() > 1);

        let qualified = Settings {
            issuer: Some("https://other-sp.example.com".into()),
            ..settings.clone()
        };
        let errors = parse(SIGNED_ASSERTION, &qualified, options())
            .validate(true)
            .unwrap_err();
        assert!(errors.contains("The SPNameQualifier value mistmatch the SP entityID value."));
    }

    #[test]
    fn rejects_untrusted_or_tampered_signatures() {
        let untrusted = Settings {
            idp_cert: Some(IDP2_CERT.into()),
            ..settings()
        };
        assert_eq!(
            parse(SIGNED_ASSERTION, &untrusted, options())
                .validate(true)
                .unwrap_err()
                .0,
            ["Invalid Signature on SAML Response"]
        );

        let settings = settings();
        let tampered = SIGNED_ASSERTION.replace("jdoe", "root");
        let response = parse(&tampered, &settings, options());
        assert_eq!(
            response.validate(false).unwrap_err().0,
            ["Invalid Signature on SAML Response"]
        );
    }

    #[test]
    fn is_valid_keeps_errors() {
        let settings = settings();
        let mut response = parse(UNSIGNED, &settings, options());
        assert!(!response.is_valid(false));
        assert_eq!(response.errors().len(), 1);

        let mut response = parse(SIGNED_ASSERTION, &settings, options());
        assert!(response.is_valid(true));
        assert!(response.errors().is_empty());
    }

    #[test]
    fn decrypts_encrypted_assertion() {
        let settings = settings();
        let response = parse(ENCRYPTED_ASSERTION, &settings, options());
        assert!(response.decrypted_document().is_some());
        response.validate(false).unwrap();
        assert_eq!(response.name_id().unwrap(), Some("user@example.org"));
        assert_eq!(
            response.attributes().unwrap().single("uid"),
            Some("jdoe")
        );
    }

    #[test]
    fn encrypted_assertion_needs_the_right_key() {
        let encoded = codec::encode_message(ENCRYPTED_ASSERTION, false);
        let keyless = Settings {
            private_key: None,
            ..settings()
        };
        assert!(matches!(
            Response::new(&encoded, &keyless, options()),
            Err(SamlError::Decryption(_))
        ));

        let wrong = Settings {
            private_key: Some(WRONG_KEY.into()),
            ..settings()
        };
        assert!(matches!(
            Response::new(&encoded, &wrong, options()),
            Err(SamlError::Decryption(_))
        ));
    }

    #[test]
    fn decrypts_name_id_and_attributes() {
        let settings = settings();
        let response = parse(ENCRYPTED_NAMEID, &settings, options());
        assert!(response.decrypted_document().is_none());
        response.validate(false).unwrap();
        assert_eq!(response.name_id().unwrap(), Some("user@example.org"));
        let attributes = response.attributes().unwrap();
        assert_eq!(attributes.single("mail"), Some("user@example.org"));
        assert_eq!(attributes.single("department"), Some("engineering"));

        let keyless = Settings {
            private_key: None,
            ..settings.clone()
        };
        let response = parse(ENCRYPTED_NAMEID, &keyless, options());
        assert!(matches!(response.name_id(), Err(SamlError::Decryption(_))));
    }
}

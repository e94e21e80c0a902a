use libxml::{parser::Parser as XmlParser, tree::Node, xpath::Context};
use tracing::{debug, info};
use url::Url;

use crate::{
    authn_request::ProtocolBinding,
    error::Result,
    settings::{IdpCertMulti, Settings},
    utils::{find_nodes, first_node, first_text, parse_certificate, xpath_context, xpath_literal},
    xml_security::fingerprint,
    DigestAlgorithm, SamlError,
};

/// Trust configuration read from an IdP's metadata document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct IdpMetadata {
    pub entity_id: String,
    pub name_identifier_format: Option<String>,
    pub sso_url: Option<String>,
    pub slo_url: Option<String>,
    pub attribute_names: Vec<String>,
    pub idp_cert: Option<String>,
    pub idp_cert_fingerprint: Option<String>,
    pub idp_cert_multi: Option<IdpCertMulti>,
}

impl IdpMetadata {
    /// Overwrites the IdP fields of `settings` with the parsed values.
    pub fn merge_into(self, settings: Settings) -> Settings {
        Settings {
            idp_entity_id: Some(self.entity_id),
            name_identifier_format: self.name_identifier_format,
            idp_sso_target_url: self.sso_url,
            idp_slo_target_url: self.slo_url,
            idp_attribute_names: self.attribute_names,
            idp_cert: self.idp_cert,
            idp_cert_fingerprint: self.idp_cert_fingerprint,
            idp_cert_multi: self.idp_cert_multi,
            ..settings
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct IdpMetadataOptions {
    /// Picks this entity when the document describes several.
    pub entity_id: Option<String>,
    /// Preferred SSO bindings, most preferred first.
    pub sso_binding: Vec<ProtocolBinding>,
    pub slo_binding: Vec<ProtocolBinding>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IdpMetadataParser;

impl IdpMetadataParser {
    pub fn new() -> Self {
        IdpMetadataParser
    }

    /// Fetches the metadata and merges it into default settings.
    pub fn parse_remote(
        &self,
        url: &str,
        validate_cert: bool,
        options: &IdpMetadataOptions,
    ) -> Result<Settings> {
        let metadata = self.parse_remote_to_metadata(url, validate_cert, options)?;
        Ok(metadata.merge_into(Settings::default()))
    }

    pub fn parse_remote_to_metadata(
        &self,
        url: &str,
        validate_cert: bool,
        options: &IdpMetadataOptions,
    ) -> Result<IdpMetadata> {
        let xml = fetch_metadata(url, validate_cert)?;
        self.parse_to_metadata(&xml, options)
    }

    /// Merges the metadata into `settings`, or into default settings.
    pub fn parse(
        &self,
        xml: &str,
        options: &IdpMetadataOptions,
        settings: Option<Settings>,
    ) -> Result<Settings> {
        let metadata = self.parse_to_metadata(xml, options)?;
        Ok(metadata.merge_into(settings.unwrap_or_default()))
    }

    pub fn parse_to_metadata(
        &self,
        xml: &str,
        options: &IdpMetadataOptions,
    ) -> Result<IdpMetadata> {
        let document = XmlParser::default()
            .parse_string(xml)
            .map_err(SamlError::InvalidXml)?;
        let context = xpath_context(&document)?;

        let path = match &options.entity_id {
            Some(entity_id) => format!(
                "//md:EntityDescriptor[@entityID={}]",
                xpath_literal(entity_id)
            ),
            None => "//md:EntityDescriptor".to_string(),
        };
        let descriptor = first_node(&context, &path, None)
            .filter(|entity| first_node(&context, "md:IDPSSODescriptor", Some(entity)).is_some())
            .ok_or_else(|| {
                SamlError::InvalidMetadata(
                    "idp_metadata must contain an IDPSSODescriptor element".into(),
                )
            })?;

        let (signing, encryption) = certificates(&context, &descriptor);
        let (idp_cert, idp_cert_multi) = split_certificates(signing, encryption);
        let idp_cert_fingerprint = match &idp_cert {
            Some(cert) => Some(fingerprint(&parse_certificate(cert)?, DigestAlgorithm::Sha1)?),
            None => None,
        };

        let metadata = IdpMetadata {
            entity_id: descriptor.get_attribute("entityID").unwrap_or_default(),
            name_identifier_format: first_text(
                &context,
                "md:IDPSSODescriptor/md:NameIDFormat",
                Some(&descriptor),
            ),
            sso_url: endpoint(&context, &descriptor, "SingleSignOnService", &options.sso_binding),
            slo_url: endpoint(&context, &descriptor, "SingleLogoutService", &options.slo_binding),
            attribute_names: find_nodes(
                &context,
                "md:IDPSSODescriptor/saml:Attribute/@Name",
                Some(&descriptor),
            )
            .iter()
            .map(Node::get_content)
            .collect(),
            idp_cert,
            idp_cert_fingerprint,
            idp_cert_multi,
        };
        debug!(entity_id = %metadata.entity_id, "parsed IdP metadata");
        Ok(metadata)
    }
}

/// Location of the first endpoint whose binding is most preferred, else of the
/// first endpoint.
fn endpoint(
    context: &Context,
    descriptor: &Node,
    service: &str,
    preferred: &[ProtocolBinding],
) -> Option<String> {
    let endpoints = find_nodes(
        context,
        &format!("md:IDPSSODescriptor/md:{service}"),
        Some(descriptor),
    );
    preferred
        .iter()
        .find_map(|binding| {
            let binding = binding.to_string();
            endpoints
                .iter()
                .find(|node| node.get_attribute("Binding").as_deref() == Some(binding.as_str()))
        })
        .or_else(|| endpoints.first())
        .and_then(|node| node.get_attribute("Location"))
}

/// Certificate bodies usable for `(signing, encryption)`; a `KeyDescriptor`
/// without `use` serves both.
fn certificates(context: &Context, descriptor: &Node) -> (Vec<String>, Vec<String>) {
    let bodies = |excluded: &str| {
        find_nodes(
            context,
            &format!(
                "md:IDPSSODescriptor/md:KeyDescriptor[not(contains(@use, '{excluded}'))]/ds:KeyInfo/ds:X509Data/ds:X509Certificate"
            ),
            Some(descriptor),
        )
        .iter()
        .map(|node| node.get_content().split_whitespace().collect::<String>())
        .collect::<Vec<_>>()
    };
    (bodies("encryption"), bodies("signing"))
}

/// A single certificate serving every listed role becomes `idp_cert`; anything
/// else becomes `idp_cert_multi`.
fn split_certificates(
    signing: Vec<String>,
    encryption: Vec<String>,
) -> (Option<String>, Option<IdpCertMulti>) {
    match (signing.as_slice(), encryption.as_slice()) {
        ([], []) => (None, None),
        ([cert], []) | ([], [cert]) => (Some(cert.clone()), None),
        ([signing], [encryption]) if signing == encryption => (Some(signing.clone()), None),
        _ => (None, Some(IdpCertMulti { signing, encryption })),
    }
}

fn fetch_metadata(url: &str, validate_cert: bool) -> Result<String> {
    let url = Url::parse(url).map_err(|e| SamlError::Http(format!("invalid metadata url: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(SamlError::Http("url must begin with http or https".into()));
    }

    info!(%url, validate_cert, "fetching IdP metadata");
    let client = reqwest::blocking::Client::builder()
        .danger_accept_invalid_certs(!validate_cert)
        .build()
        .map_err(|e| SamlError::Http(format!("Failed to build HTTP client: {e}")))?;
    let response = client
        .get(url)
        .send()
        .map_err(|e| SamlError::Http(format!("Failed to fetch idp metadata: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(SamlError::Http(format!(
            "Failed to fetch idp metadata: {}: {}",
            status.as_u16(),
            status.canonical_reason().unwrap_or_default()
        )));
    }
    response
        .text()
        .map_err(|e| SamlError::Http(format!("Failed to read idp metadata: {e}")))
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        net::TcpListener,
        thread,
    };

    use super::*;
    use crate::NAME_ID_FORMAT_EMAIL_ADDRESS;

    const METADATA: &str = include_str!("../static/idp_metadata.xml");
    const MULTI_CERTS: &str = include_str!("../static/idp_metadata_multi_certs.xml");
    const SAME_CERT: &str = include_str!("../static/idp_metadata_same_cert.xml");
    const MULTIPLE_ENTITIES: &str = include_str!("../static/idp_metadata_multiple_entities.xml");
    const NO_IDP: &str = include_str!("../static/idp_metadata_no_idp.xml");
    const IDP_FINGERPRINT: &str = "1A:32:76:47:E6:10:C9:82:A2:8B:8F:ED:AE:C7:81:F9:FB:C4:65:D1";

    /// Serves one canned HTTP response on a local port.
    fn serve_once(status_line: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut request = [0u8; 4096];
            let _ = stream.read(&mut request).unwrap();
            write!(
                stream,
                "HTTP/1.1 {status_line}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            )
            .unwrap();
        });
        format!("http://{address}/metadata")
    }

    #[test]
    fn parses_single_certificate_metadata() {
        let metadata = IdpMetadataParser::new()
            .parse_to_metadata(METADATA, &IdpMetadataOptions::default())
            .unwrap();
        assert_eq!(metadata.entity_id, "https://idp.example.org/metadata");
        assert_eq!(
            metadata.name_identifier_format.as_deref(),
            Some(NAME_ID_FORMAT_EMAIL_ADDRESS)
        );
        assert_eq!(
            metadata.sso_url.as_deref(),
            Some("https://idp.example.org/sso/post")
        );
        assert_eq!(
            metadata.slo_url.as_deref(),
            Some("https://idp.example.org/slo/redirect")
        );
        assert_eq!(metadata.attribute_names, ["mail", "groups"]);
        assert!(metadata.idp_cert.as_deref().unwrap().starts_with("MIID"));
        assert_eq!(metadata.idp_cert_fingerprint.as_deref(), Some(IDP_FINGERPRINT));
        assert_eq!(metadata.idp_cert_multi, None);
    }

    #[test]
    fn prefers_requested_bindings() {
        let options = IdpMetadataOptions {
            sso_binding: vec![ProtocolBinding::Redirect, ProtocolBinding::Post],
            slo_binding: vec![ProtocolBinding::Post],
            ..IdpMetadataOptions::default()
        };
        let metadata = IdpMetadataParser::new()
            .parse_to_metadata(METADATA, &options)
            .unwrap();
        assert_eq!(
            metadata.sso_url.as_deref(),
            Some("https://idp.example.org/sso/redirect")
        );
        assert_eq!(
            metadata.slo_url.as_deref(),
            Some("https://idp.example.org/slo/post")
        );
    }

    #[test]
    fn splits_certificates_by_use() {
        let parser = IdpMetadataParser::new();
        let metadata = parser
            .parse_to_metadata(MULTI_CERTS, &IdpMetadataOptions::default())
            .unwrap();
        assert_eq!(metadata.idp_cert, None);
        assert_eq!(metadata.idp_cert_fingerprint, None);
        let multi = metadata.idp_cert_multi.unwrap();
        assert_eq!(multi.signing.len(), 2);
        assert_eq!(multi.encryption.len(), 1);
        assert_eq!(multi.encryption[0], multi.signing[1]);

        let same = parser
            .parse_to_metadata(SAME_CERT, &IdpMetadataOptions::default())
            .unwrap();
        assert!(same.idp_cert.is_some());
        assert_eq!(same.idp_cert_multi, None);
    }

    #[test]
    fn selects_entity_by_id() {
        let parser = IdpMetadataParser::new();
        let first = parser
            .parse_to_metadata(MULTIPLE_ENTITIES, &IdpMetadataOptions::default())
            .unwrap();
        assert_eq!(first.entity_id, "https://other-idp.example.net/metadata");

        let options = IdpMetadataOptions {
            entity_id: Some("https://idp.example.org/metadata".into()),
            ..IdpMetadataOptions::default()
        };
        let chosen = parser.parse_to_metadata(MULTIPLE_ENTITIES, &options).unwrap();
        assert_eq!(
            chosen.sso_url.as_deref(),
            Some("https://idp.example.org/sso/post")
        );
        assert_eq!(chosen.idp_cert_fingerprint.as_deref(), Some(IDP_FINGERPRINT));
    }

    #[test]
    fn requires_idp_descriptor() {
        let result =
            IdpMetadataParser::new().parse_to_metadata(NO_IDP, &IdpMetadataOptions::default());
        assert!(matches!(result, Err(SamlError::InvalidMetadata(_))));
    }

    #[test]
    fn merges_into_settings() {
        let existing = Settings {
            issuer: Some("https://sp.example.com/saml/metadata".into()),
            idp_cert_fingerprint: Some("stale".into()),
            ..Settings::default()
        };
        let settings = IdpMetadataParser::new()
            .parse(MULTI_CERTS, &IdpMetadataOptions::default(), Some(existing))
            .unwrap();
        assert_eq!(
            settings.issuer.as_deref(),
            Some("https://sp.example.com/saml/metadata")
        );
        assert_eq!(
            settings.idp_entity_id.as_deref(),
            Some("https://idp.example.org/metadata")
        );
        assert_eq!(settings.idp_cert_fingerprint, None);
        assert_eq!(settings.idp_signing_certs().unwrap().len(), 2);
    }

    #[test]
    fn fetches_remote_metadata() {
        let url = serve_once("200 OK", METADATA);
        let settings = IdpMetadataParser::new()
            .parse_remote(&url, true, &IdpMetadataOptions::default())
            .unwrap();
        assert_eq!(
            settings.idp_sso_target_url.as_deref(),
            Some("https://idp.example.org/sso/post")
        );
        assert_eq!(settings.idp_cert_fingerprint.as_deref(), Some(IDP_FINGERPRINT));
    }

    #[test]
    fn reports_remote_failures() {
        let parser = IdpMetadataParser::new();
        let url = serve_once("404 Not Found", "");
        let error = parser
            .parse_remote_to_metadata(&url, true, &IdpMetadataOptions::default())
            .unwrap_err();
        assert_eq!(error.to_string(), "Failed to fetch idp metadata: 404: Not Found");

        assert!(matches!(
            parser.parse_remote(
                "ftp://idp.example.org/metadata",
                true,
                &IdpMetadataOptions::default()
            ),
            Err(SamlError::Http(_))
        ));
    }
}

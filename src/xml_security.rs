//! XML-DSig signing and verification.
//!
//! Enveloped signatures are computed and checked by xmlsec; this module adds
//! the SAML specific rules on top (which element may be signed, certificate
//! pinning by fingerprint) and the detached signatures of the redirect binding.

use std::{fmt::Display, str::FromStr};

use base64::{prelude::BASE64_STANDARD, Engine};
use libxml::{parser::Parser as XmlParser, tree::Document};
use openssl::{
    hash::MessageDigest,
    pkey::{PKey, Private},
    sign::{Signer, Verifier},
    x509::X509,
};
use serde::Deserialize;
use tracing::warn;
use xmlsec::{XmlSecDocumentExt as _, XmlSecKey, XmlSecKeyFormat, XmlSecSignatureContext};

use crate::{
    error::Result,
    utils::{certificate_body, decode_xml_base64, first_node, first_text, xpath_context},
    SamlError, DSIG,
};

const C14N_EXCLUSIVE: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";
const ENVELOPED_SIGNATURE: &str = "http://www.w3.org/2000/09/xmldsig#enveloped-signature";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum DigestAlgorithm {
    #[default]
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl DigestAlgorithm {
    pub fn uri(&self) -> &'static str {
        match self {
            DigestAlgorithm::Sha1 => "http://www.w3.org/2000/09/xmldsig#sha1",
            DigestAlgorithm::Sha256 => "http://www.w3.org/2001/04/xmlenc#sha256",
            DigestAlgorithm::Sha384 => "http://www.w3.org/2001/04/xmldsig-more#sha384",
            DigestAlgorithm::Sha512 => "http://www.w3.org/2001/04/xmlenc#sha512",
        }
    }

    pub fn message_digest(&self) -> MessageDigest {
        match self {
            DigestAlgorithm::Sha1 => MessageDigest::sha1(),
            DigestAlgorithm::Sha256 => MessageDigest::sha256(),
            DigestAlgorithm::Sha384 => MessageDigest::sha384(),
            DigestAlgorithm::Sha512 => MessageDigest::sha512(),
        }
    }
}

impl Display for DigestAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.uri())
    }
}

/// Accepts the algorithm URI or any string naming the hash, e.g. `SHA256`.
impl FromStr for DigestAlgorithm {
    type Err = SamlError;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.to_ascii_lowercase();
        if lower.ends_with("sha1") {
            Ok(DigestAlgorithm::Sha1)
        } else if lower.ends_with("sha256") {
            Ok(DigestAlgorithm::Sha256)
        } else if lower.ends_with("sha384") {
            Ok(DigestAlgorithm::Sha384)
        } else if lower.ends_with("sha512") {
            Ok(DigestAlgorithm::Sha512)
        } else {
            Err(SamlError::Settings(format!("unsupported digest algorithm '{s}'")))
        }
    }
}

impl TryFrom<String> for DigestAlgorithm {
    type Error = SamlError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum SignatureAlgorithm {
    #[default]
    RsaSha1,
    RsaSha256,
    RsaSha384,
    RsaSha512,
}

impl SignatureAlgorithm {
    pub fn uri(&self) -> &'static str {
        match self {
            SignatureAlgorithm::RsaSha1 => "http://www.w3.org/2000/09/xmldsig#rsa-sha1",
            SignatureAlgorithm::RsaSha256 => "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256",
            SignatureAlgorithm::RsaSha384 => "http://www.w3.org/2001/04/xmldsig-more#rsa-sha384",
            SignatureAlgorithm::RsaSha512 => "http://www.w3.org/2001/04/xmldsig-more#rsa-sha512",
        }
    }

    pub fn digest(&self) -> DigestAlgorithm {
        match self {
            SignatureAlgorithm::RsaSha1 => DigestAlgorithm::Sha1,
            SignatureAlgorithm::RsaSha256 => DigestAlgorithm::Sha256,
            SignatureAlgorithm::RsaSha384 => DigestAlgorithm::Sha384,
            SignatureAlgorithm::RsaSha512 => DigestAlgorithm::Sha512,
        }
    }
}

impl Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.uri())
    }
}

impl FromStr for SignatureAlgorithm {
    type Err = SamlError;

    fn from_str(s: &str) -> Result<Self> {
        let digest = s.parse::<DigestAlgorithm>().map_err(|_| {
            SamlError::Settings(format!("unsupported signature algorithm '{s}'"))
        })?;
        Ok(match digest {
            DigestAlgorithm::Sha1 => SignatureAlgorithm::RsaSha1,
            DigestAlgorithm::Sha256 => SignatureAlgorithm::RsaSha256,
            DigestAlgorithm::Sha384 => SignatureAlgorithm::RsaSha384,
            DigestAlgorithm::Sha512 => SignatureAlgorithm::RsaSha512,
        })
    }
}

impl TryFrom<String> for SignatureAlgorithm {
    type Error = SamlError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

/// Upper-case, colon separated hex digest of the certificate's DER encoding.
pub fn fingerprint(cert: &X509, algorithm: DigestAlgorithm) -> Result<String> {
    let digest = cert.digest(algorithm.message_digest())?;
    Ok(hex::encode_upper(&*digest)
        .as_bytes()
        .chunks(2)
        .map(|pair| String::from_utf8_lossy(pair).into_owned())
        .collect::<Vec<_>>()
        .join(":"))
}

fn normalize_fingerprint(fingerprint: &str) -> String {
    fingerprint
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .collect::<String>()
        .to_ascii_lowercase()
}

/// Signs `xml` with an enveloped signature referencing the root element's `ID`.
///
/// The `ds:Signature` element is placed right after the root's `Issuer`, or as
/// the first child when the root has none.
pub fn sign_document(
    xml: &str,
    private_key: &PKey<Private>,
    certificate: &X509,
    signature_algorithm: SignatureAlgorithm,
    digest_algorithm: DigestAlgorithm,
) -> Result<String> {
    let parser = XmlParser::default();
    let document = parser.parse_string(xml).map_err(SamlError::InvalidXml)?;
    let root = document
        .get_root_element()
        .ok_or_else(|| SamlError::Signing("document has no root element".into()))?;
    let id = root
        .get_attribute("ID")
        .ok_or_else(|| SamlError::Signing("root element has no ID".into()))?;

    let template = signature_template(
        &id,
        signature_algorithm,
        digest_algorithm,
        &certificate_body(certificate)?,
    );

    let issuer = root
        .get_child_elements()
        .into_iter()
        .next()
        .filter(|child| child.get_name() == "Issuer");
    let position = match issuer {
        Some(issuer) => {
            let name = match issuer.get_namespace().map(|ns| ns.get_prefix()) {
                Some(prefix) if !prefix.is_empty() => format!("{prefix}:Issuer"),
                _ => "Issuer".to_string(),
            };
            let closing = format!("</{name}>");
            xml.find(&closing).map(|index| index + closing.len())
        }
        None => root_start_tag_end(xml),
    }
    .ok_or_else(|| SamlError::Signing("unable to place the signature".into()))?;

    let mut templated = String::with_capacity(xml.len() + template.len());
    templated.push_str(&xml[..position]);
    templated.push_str(&template);
    templated.push_str(&xml[position..]);

    let document = parser
        .parse_string(&templated)
        .map_err(SamlError::InvalidXml)?;
    document.specify_idattr("//*[@ID]", "ID", None)?;

    let key = XmlSecKey::from_memory(
        &private_key.private_key_to_pem_pkcs8()?,
        XmlSecKeyFormat::Pem,
        None,
    )?;
    let mut sigctx = XmlSecSignatureContext::new();
    sigctx.insert_key(key);
    sigctx.sign_document(&document)?;

    Ok(document.to_string())
}

fn signature_template(
    id: &str,
    signature_algorithm: SignatureAlgorithm,
    digest_algorithm: DigestAlgorithm,
    certificate: &str,
) -> String {
    format!(
        concat!(
            r#"<ds:Signature xmlns:ds="{dsig}"><ds:SignedInfo>"#,
            r#"<ds:CanonicalizationMethod Algorithm="{c14n}"/>"#,
            r#"<ds:SignatureMethod Algorithm="{signature}"/>"#,
            r##"<ds:Reference URI="#{id}"><ds:Transforms>"##,
            r#"<ds:Transform Algorithm="{enveloped}"/>"#,
            r#"<ds:Transform Algorithm="{c14n}"/></ds:Transforms>"#,
            r#"<ds:DigestMethod Algorithm="{digest}"/><ds:DigestValue></ds:DigestValue>"#,
            r#"</ds:Reference></ds:SignedInfo><ds:SignatureValue></ds:SignatureValue>"#,
            r#"<ds:KeyInfo><ds:X509Data><ds:X509Certificate>{certificate}</ds:X509Certificate>"#,
            r#"</ds:X509Data></ds:KeyInfo></ds:Signature>"#,
        ),
        dsig = DSIG,
        c14n = C14N_EXCLUSIVE,
        signature = signature_algorithm.uri(),
        id = id,
        enveloped = ENVELOPED_SIGNATURE,
        digest = digest_algorithm.uri(),
        certificate = certificate,
    )
}

/// Byte offset just past the root element's start tag.
fn root_start_tag_end(xml: &str) -> Option<usize> {
    let bytes = xml.as_bytes();
    let start = bytes
        .windows(2)
        .position(|w| w[0] == b'<' && w[1] != b'?' && w[1] != b'!')?;
    let mut quote = None;
    for (index, &byte) in bytes.iter().enumerate().skip(start + 1) {
        match quote {
            Some(q) if byte == q => quote = None,
            Some(_) => {}
            None if byte == b'"' || byte == b'\'' => quote = Some(byte),
            None if byte == b'>' => return Some(index + 1),
            None => {}
        }
    }
    None
}

/// A received document carrying an enveloped signature.
pub struct SignedDocument {
    xml: String,
    document: Document,
}

impl SignedDocument {
    pub fn parse(xml: &str) -> Result<Self> {
        let document = XmlParser::default()
            .parse_string(xml)
            .map_err(SamlError::InvalidXml)?;
        Ok(SignedDocument {
            xml: xml.to_string(),
            document,
        })
    }

    pub fn xml(&self) -> &str {
        &self.xml
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    /// ID referenced by the first signature, or the ID of the signature's parent
    /// when the reference URI is empty.
    pub fn signed_element_id(&self) -> Option<String> {
        let context = xpath_context(&self.document).ok()?;
        let reference = first_node(&context, "//ds:Signature/ds:SignedInfo/ds:Reference", None)?;
        match reference.get_attribute("URI") {
            Some(uri) if !uri.is_empty() => Some(uri.trim_start_matches('#').to_string()),
            _ => {
                let signature = reference.get_parent()?.get_parent()?;
                signature.get_parent()?.get_attribute("ID")
            }
        }
    }

    fn embedded_certificate(&self) -> Result<Option<X509>> {
        let context = xpath_context(&self.document)?;
        match first_text(&context, "//ds:X509Certificate", None) {
            Some(body) if !body.is_empty() => {
                let der = decode_xml_base64(&body)?;
                Ok(Some(X509::from_der(&der)?))
            }
            _ => Ok(None),
        }
    }

    /// Checks the embedded certificate against a pinned fingerprint, then the signature.
    ///
    /// Without an embedded certificate the fallback certificate is used.
    pub fn validate_document(
        &self,
        idp_cert_fingerprint: &str,
        algorithm: DigestAlgorithm,
        fallback: Option<&X509>,
    ) -> Result<()> {
        match self.embedded_certificate()? {
            Some(cert) => {
                let actual = normalize_fingerprint(&fingerprint(&cert, algorithm)?);
                if actual != normalize_fingerprint(idp_cert_fingerprint) {
                    return Err(SamlError::Validation("Fingerprint mismatch".into()));
                }
                self.validate_signature(&cert)
            }
            None => match fallback {
                Some(cert) => self.validate_signature(cert),
                None => Err(SamlError::Validation(
                    "Certificate element missing in response (ds:X509Certificate) and not cert provided at settings".into(),
                )),
            },
        }
    }

    /// Verifies with a configured certificate, which an embedded one must equal.
    pub fn validate_document_with_cert(&self, idp_cert: &X509) -> Result<()> {
        if let Some(cert) = self.embedded_certificate()? {
            if cert.to_der()? != idp_cert.to_der()? {
                return Err(SamlError::Validation(
                    "Certificate of the Signature element does not match provided certificate"
                        .into(),
                ));
            }
        }
        self.validate_signature(idp_cert)
    }

    /// Verifies the first signature of the document with `cert`.
    pub fn validate_signature(&self, cert: &X509) -> Result<()> {
        let context = xpath_context(&self.document)?;
        let signature = first_node(&context, "//ds:Signature", None)
            .ok_or_else(|| SamlError::Validation("Signature element not found".into()))?;
        let reference = first_node(&context, "ds:SignedInfo/ds:Reference", Some(&signature))
            .ok_or_else(|| SamlError::Validation("Reference element not found".into()))?;
        let signed_id = signature.get_parent().and_then(|parent| parent.get_attribute("ID"));
        let uri = reference.get_attribute("URI").unwrap_or_default();
        if !uri.is_empty() && signed_id.as_deref() != Some(uri.trim_start_matches('#')) {
            return Err(SamlError::Validation(
                "Reference URI does not match the signed element".into(),
            ));
        }

        // Signature checks run on a fresh tree so ID registration cannot leak
        // into the caller's document.
        let document = XmlParser::default()
            .parse_string(&self.xml)
            .map_err(SamlError::InvalidXml)?;
        document.specify_idattr("//*[@ID]", "ID", None)?;

        let key = XmlSecKey::from_memory(&cert.to_der()?, XmlSecKeyFormat::CertDer, None)?;
        let mut sigctx = XmlSecSignatureContext::new();
        sigctx.insert_key(key);
        if sigctx.verify_document(&document)? {
            Ok(())
        } else {
            Err(SamlError::Validation("Key validation error".into()))
        }
    }
}

/// True when any of `certs` verifies the document (certificate rollover).
pub fn verify_with_any(xml: &str, certs: &[X509]) -> bool {
    let document = match SignedDocument::parse(xml) {
        Ok(document) => document,
        Err(e) => {
            warn!(error = %e, "unable to parse signed document");
            return false;
        }
    };
    certs
        .iter()
        .any(|cert| match document.validate_document_with_cert(cert) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "signature rejected");
                false
            }
        })
}

/// Base64 signature over a redirect-binding query string.
pub fn sign_query(
    private_key: &PKey<Private>,
    algorithm: SignatureAlgorithm,
    query: &str,
) -> Result<String> {
    let mut signer = Signer::new(algorithm.digest().message_digest(), private_key)?;
    signer.update(query.as_bytes())?;
    Ok(BASE64_STANDARD.encode(signer.sign_to_vec()?))
}

/// Verifies a detached redirect-binding signature with the algorithm named by `SigAlg`.
pub fn verify_query_signature(
    cert: &X509,
    sig_alg: &str,
    signature: &str,
    query: &str,
) -> Result<bool> {
    let algorithm = sig_alg.parse::<SignatureAlgorithm>()?;
    let signature = decode_xml_base64(signature)?;
    let public_key = cert.public_key()?;
    let mut verifier = Verifier::new(algorithm.digest().message_digest(), &public_key)?;
    verifier.update(query.as_bytes())?;
    Ok(verifier.verify(&signature).unwrap_or(false))
}

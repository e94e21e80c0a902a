use std::fmt;

use libxml::parser::XmlParseError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SamlError>;

#[derive(Debug, Error)]
pub enum SamlError {
    #[error("invalid SAML message: {0}")]
    InvalidResponse(String),
    #[error("invalid XML: {0:?}")]
    InvalidXml(XmlParseError),
    #[error("unable to serialize XML: {0}")]
    Serialization(String),
    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("unable to inflate payload: {0}")]
    Inflate(String),
    #[error("invalid settings: {0}")]
    Settings(String),
    #[error("signing failed: {0}")]
    Signing(String),
    #[error("decryption failed: {0}")]
    Decryption(String),
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Http(String),
    #[error("openssl failure: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),
    #[error("xmlsec failure: {0}")]
    XmlSec(String),
}

impl From<xmlsec::XmlSecError> for SamlError {
    fn from(error: xmlsec::XmlSecError) -> Self {
        SamlError::XmlSec(format!("{error:?}"))
    }
}

/// Ordered list of failed checks, as reported by `validate`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ValidationErrors(pub Vec<String>);

impl ValidationErrors {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn contains(&self, message: &str) -> bool {
        self.0.iter().any(|error| error == message)
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("; "))
    }
}

impl std::error::Error for ValidationErrors {}

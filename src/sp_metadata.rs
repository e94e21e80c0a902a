use time::{Duration, OffsetDateTime};
use tracing::debug;
use yaserde::YaSerialize;

use crate::{
    error::Result,
    settings::{RequestedAttribute, Settings},
    utils::{certificate_body, format_time, generate_id},
    xml_security::sign_document,
    SamlError,
};

#[derive(YaSerialize)]
#[yaserde(
  namespaces = {
    "md" = "urn:oasis:names:tc:SAML:2.0:metadata",
    "ds" = "http://www.w3.org/2000/09/xmldsig#",
    "saml" = "urn:oasis:names:tc:SAML:2.0:assertion",
  },
  prefix = "md"
)]
struct EntityDescriptor {
    #[yaserde(attribute = true, rename = "ID")]
    id: String,
    #[yaserde(attribute = true, rename = "entityID")]
    entity_id: Option<String>,
    #[yaserde(attribute = true, rename = "validUntil")]
    valid_until: Option<String>,
    #[yaserde(attribute = true, rename = "cacheDuration")]
    cache_duration: Option<String>,
    #[yaserde(rename = "SPSSODescriptor", prefix = "md")]
    sp_sso_descriptor: SPSSODescriptor,
}

#[derive(YaSerialize)]
struct SPSSODescriptor {
    #[yaserde(attribute = true, rename = "protocolSupportEnumeration")]
    protocol_support_enumeration: String,
    #[yaserde(attribute = true, rename = "AuthnRequestsSigned")]
    authn_requests_signed: bool,
    #[yaserde(attribute = true, rename = "WantAssertionsSigned")]
    want_assertions_signed: bool,
    #[yaserde(rename = "KeyDescriptor", prefix = "md")]
    key_descriptors: Vec<KeyDescriptor>,
    #[yaserde(rename = "SingleLogoutService", prefix = "md")]
    single_logout_service: Option<Endpoint>,
    #[yaserde(rename = "NameIDFormat", prefix = "md")]
    name_id_format: Option<String>,
    #[yaserde(rename = "AssertionConsumerService", prefix = "md")]
    assertion_consumer_service: Option<IndexedEndpoint>,
    #[yaserde(rename = "AttributeConsumingService", prefix = "md")]
    attribute_consuming_service: Option<AttributeConsumingService>,
}

#[derive(YaSerialize)]
struct KeyDescriptor {
    #[yaserde(attribute = true, rename = "use")]
    key_use: String,
    #[yaserde(rename = "KeyInfo", prefix = "ds")]
    key_info: KeyInfo,
}

#[derive(YaSerialize)]
struct KeyInfo {
    #[yaserde(rename = "X509Data", prefix = "ds")]
    x509_data: X509Data,
}

#[derive(YaSerialize)]
struct X509Data {
    #[yaserde(rename = "X509Certificate", prefix = "ds")]
    certificate: String,
}

#[derive(YaSerialize)]
struct Endpoint {
    #[yaserde(attribute = true, rename = "Binding")]
    binding: String,
    #[yaserde(attribute = true, rename = "Location")]
    location: String,
    #[yaserde(attribute = true, rename = "ResponseLocation")]
    response_location: Option<String>,
}

#[derive(YaSerialize)]
struct IndexedEndpoint {
    #[yaserde(attribute = true, rename = "Binding")]
    binding: String,
    #[yaserde(attribute = true, rename = "Location")]
    location: String,
    #[yaserde(attribute = true, rename = "isDefault")]
    is_default: bool,
    #[yaserde(attribute = true)]
    index: u32,
}

#[derive(YaSerialize)]
struct AttributeConsumingService {
    #[yaserde(attribute = true, rename = "isDefault")]
    is_default: bool,
    #[yaserde(attribute = true)]
    index: u32,
    #[yaserde(rename = "ServiceName", prefix = "md")]
    service_name: ServiceName,
    #[yaserde(rename = "RequestedAttribute", prefix = "md")]
    requested_attributes: Vec<RequestedAttributeElement>,
}

#[derive(YaSerialize)]
struct ServiceName {
    #[yaserde(attribute = true, rename = "xml:lang")]
    lang: String,
    #[yaserde(text = true)]
    content: String,
}

#[derive(YaSerialize)]
struct RequestedAttributeElement {
    #[yaserde(attribute = true, rename = "Name")]
    name: String,
    #[yaserde(attribute = true, rename = "NameFormat")]
    name_format: Option<String>,
    #[yaserde(attribute = true, rename = "FriendlyName")]
    friendly_name: Option<String>,
    #[yaserde(attribute = true, rename = "isRequired")]
    is_required: bool,
    #[yaserde(rename = "AttributeValue", prefix = "saml")]
    values: Vec<String>,
}

impl From<&RequestedAttribute> for RequestedAttributeElement {
    fn from(attribute: &RequestedAttribute) -> Self {
        RequestedAttributeElement {
            name: attribute.name.clone(),
            name_format: attribute.name_format.clone(),
            friendly_name: attribute.friendly_name.clone(),
            is_required: attribute.is_required,
            values: attribute.attribute_values.clone(),
        }
    }
}

/// Renders the SP's own metadata from its settings.
pub struct SpMetadataBuilder<'a> {
    settings: &'a Settings,
    id: String,
    valid_until: Option<OffsetDateTime>,
    cache_duration: Option<Duration>,
}

impl<'a> SpMetadataBuilder<'a> {
    pub fn new(settings: &'a Settings) -> Self {
        SpMetadataBuilder {
            settings,
            id: generate_id(),
            valid_until: None,
            cache_duration: None,
        }
    }

    pub fn id(self, id: &str) -> Self {
        Self {
            id: id.into(),
            ..self
        }
    }

    pub fn valid_until(self, valid_until: OffsetDateTime) -> Self {
        Self {
            valid_until: Some(valid_until),
            ..self
        }
    }

    pub fn cache_duration(self, cache_duration: Duration) -> Self {
        Self {
            cache_duration: Some(cache_duration),
            ..self
        }
    }

    /// Serializes the metadata, signing it when `metadata_signed` is set and
    /// the SP has a key and certificate.
    pub fn build(&self) -> Result<String> {
        let settings = self.settings;
        let metadata = EntityDescriptor {
            id: self.id.clone(),
            entity_id: settings.issuer.clone(),
            valid_until: self.valid_until.map(format_time).transpose()?,
            cache_duration: self
                .cache_duration
                .map(|duration| format!("PT{}S", duration.whole_seconds())),
            sp_sso_descriptor: SPSSODescriptor {
                protocol_support_enumeration: crate::PROTOCOL.into(),
                authn_requests_signed: settings.security.authn_requests_signed,
                want_assertions_signed: settings.security.want_assertions_signed,
                key_descriptors: self.key_descriptors()?,
                single_logout_service: settings.single_logout_service_url.as_ref().map(|url| {
                    Endpoint {
                        binding: settings.single_logout_service_binding.to_string(),
                        location: url.clone(),
                        response_location: Some(url.clone()),
                    }
                }),
                name_id_format: settings.name_identifier_format.clone(),
                assertion_consumer_service: settings
                    .assertion_consumer_service_url
                    .as_ref()
                    .map(|url| IndexedEndpoint {
                        binding: settings.assertion_consumer_service_binding.to_string(),
                        location: url.clone(),
                        is_default: true,
                        index: 0,
                    }),
                attribute_consuming_service: self.attribute_consuming_service(),
            },
        };
        let xml = yaserde::ser::to_string(&metadata).map_err(SamlError::Serialization)?;
        debug!(%xml, "created SP metadata");

        if settings.security.metadata_signed {
            if let Some((key, cert)) = settings.sp_signing_credentials()? {
                return sign_document(
                    &xml,
                    &key,
                    &cert,
                    settings.security.signature_method,
                    settings.security.digest_method,
                );
            }
        }
        Ok(xml)
    }

    /// Signing descriptors for the current and the upcoming certificate.
    fn key_descriptors(&self) -> Result<Vec<KeyDescriptor>> {
        let settings = self.settings;
        let mut descriptors = Vec::new();
        for cert in [settings.get_sp_cert()?, settings.get_sp_cert_new()?]
            .into_iter()
            .flatten()
        {
            let body = certificate_body(&cert)?;
            let mut uses = vec!["signing"];
            if settings.security.want_assertions_encrypted {
                uses.push("encryption");
            }
            descriptors.extend(uses.into_iter().map(|key_use| KeyDescriptor {
                key_use: key_use.into(),
                key_info: KeyInfo {
                    x509_data: X509Data {
                        certificate: body.clone(),
                    },
                },
            }));
        }
        Ok(descriptors)
    }

    fn attribute_consuming_service(&self) -> Option<AttributeConsumingService> {
        let service = &self.settings.attribute_consuming_service;
        if !service.configured() {
            return None;
        }
        Some(AttributeConsumingService {
            is_default: true,
            index: service.index,
            service_name: ServiceName {
                lang: "en".into(),
                content: service.name.clone().unwrap_or_default(),
            },
            requested_attributes: service.attributes.iter().map(Into::into).collect(),
        })
    }
}

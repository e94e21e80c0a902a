mod attributes;
mod authn_request;
pub mod codec;
mod error;
mod idp_logout_request;
mod idp_logout_response;
mod idp_metadata;
mod logout_request;
mod logout_response;
mod message;
mod response;
mod schema;
mod settings;
mod sp_metadata;
mod utils;
mod validation;
pub mod xml_encryption;
pub mod xml_security;

pub use attributes::Attributes;
pub use authn_request::{AuthnRequestBuilder, ProtocolBinding};
pub use error::{Result, SamlError, ValidationErrors};
pub use idp_logout_request::IdpLogoutRequest;
pub use idp_logout_response::IdpLogoutResponse;
pub use idp_metadata::{IdpMetadata, IdpMetadataOptions, IdpMetadataParser};
pub use logout_request::LogoutRequestBuilder;
pub use logout_response::LogoutResponseBuilder;
pub use codec::QueryParams;
pub use message::LogoutOptions;
pub use response::{Conditions, Response, ResponseOptions};
pub use settings::{
    AttributeConsumingService, IdpCertMulti, RequestedAttribute, SecurityPolicy, Settings,
};
pub use sp_metadata::SpMetadataBuilder;
pub use xml_security::{DigestAlgorithm, SignatureAlgorithm};

use time::format_description::well_known::iso8601::{self, TimePrecision};

pub const PROTOCOL: &str = "urn:oasis:names:tc:SAML:2.0:protocol";
pub const ASSERTION: &str = "urn:oasis:names:tc:SAML:2.0:assertion";
pub const METADATA: &str = "urn:oasis:names:tc:SAML:2.0:metadata";
pub const DSIG: &str = "http://www.w3.org/2000/09/xmldsig#";
pub const XENC: &str = "http://www.w3.org/2001/04/xmlenc#";
pub const XSI: &str = "http://www.w3.org/2001/XMLSchema-instance";

pub const STATUS_SUCCESS: &str = "urn:oasis:names:tc:SAML:2.0:status:Success";
pub const BEARER: &str = "urn:oasis:names:tc:SAML:2.0:cm:bearer";

pub const NAME_ID_FORMAT_EMAIL_ADDRESS: &str =
    "urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress";
pub const NAME_ID_FORMAT_PERSISTENT: &str =
    "urn:oasis:names:tc:SAML:2.0:nameid-format:persistent";
pub const NAME_ID_FORMAT_TRANSIENT: &str = "urn:oasis:names:tc:SAML:2.0:nameid-format:transient";
pub const NAME_ID_FORMAT_UNSPECIFIED: &str =
    "urn:oasis:names:tc:SAML:1.1:nameid-format:unspecified";
pub const NAME_ID_FORMAT_ENTITY: &str = "urn:oasis:names:tc:SAML:2.0:nameid-format:entity";

// xs:dateTime isn't actually ISO8601, because implementors often don't support higher precisions.
pub const DATE_TIME_FORMAT: iso8601::Iso8601<
    {
        iso8601::Config::DEFAULT
            .set_time_precision(TimePrecision::Second {
                decimal_digits: None,
            })
            .encode()
    },
> = iso8601::Iso8601;

//! Structural schema for the SAML protocol and assertion vocabulary.
//!
//! Each known element lists its required attributes and the ordered sequence
//! of children it may contain. Elements without a rule are not checked, which
//! keeps extension points (`Advice`, `SubjectConfirmationData`, attribute
//! values) open.
//!
//! Only presence and order are checked. Not covered: attribute value types
//! (`IssueInstant` as `xs:dateTime`, `Version` as a string, `ID` as `xs:ID`,
//! URI-typed attributes), simple-type facets, text content of leaf elements,
//! unknown attributes, and the `xs:any` wildcards of `Extensions`.

use std::{collections::HashMap, sync::LazyLock};

use libxml::tree::{Document, Node};

use crate::{utils::namespace_of, ASSERTION, DSIG, PROTOCOL, XENC};

struct Particle {
    namespace: &'static str,
    /// Alternatives; a child matches when its name is any of these.
    names: &'static [&'static str],
    min: usize,
    max: Option<usize>,
}

const fn one(namespace: &'static str, names: &'static [&'static str]) -> Particle {
    Particle {
        namespace,
        names,
        min: 1,
        max: Some(1),
    }
}

const fn optional(namespace: &'static str, names: &'static [&'static str]) -> Particle {
    Particle {
        namespace,
        names,
        min: 0,
        max: Some(1),
    }
}

const fn many(namespace: &'static str, names: &'static [&'static str], min: usize) -> Particle {
    Particle {
        namespace,
        names,
        min,
        max: None,
    }
}

struct ElementRule {
    required_attributes: &'static [&'static str],
    sequence: Vec<Particle>,
}

pub struct Schema {
    /// Keyed by `{namespace}name`.
    rules: HashMap<String, ElementRule>,
}

fn clark_name(namespace: &str, name: &str) -> String {
    format!("{{{namespace}}}{name}")
}

static SAML_SCHEMA: LazyLock<Schema> = LazyLock::new(Schema::saml);

const NAME_IDS: &[&str] = &["BaseID", "NameID", "EncryptedID"];

impl Schema {
    fn saml() -> Self {
        let mut rules = HashMap::new();
        let mut rule = |namespace: &str,
                        name: &str,
                        required_attributes: &'static [&'static str],
                        sequence: Vec<Particle>| {
            rules.insert(
                clark_name(namespace, name),
                ElementRule {
                    required_attributes,
                    sequence,
                },
            );
        };

        let status_response = || {
            vec![
                optional(ASSERTION, &["Issuer"]),
                optional(DSIG, &["Signature"]),
                optional(PROTOCOL, &["Extensions"]),
                one(PROTOCOL, &["Status"]),
            ]
        };
        let mut response = status_response();
        response.push(many(ASSERTION, &["Assertion", "EncryptedAssertion"], 0));
        rule(PROTOCOL, "Response", &["ID", "Version", "IssueInstant"], response);
        rule(
            PROTOCOL,
            "LogoutResponse",
            &["ID", "Version", "IssueInstant"],
            status_response(),
        );
        rule(
            PROTOCOL,
            "LogoutRequest",
            &["ID", "Version", "IssueInstant"],
            vec![
                optional(ASSERTION, &["Issuer"]),
                optional(DSIG, &["Signature"]),
                optional(PROTOCOL, &["Extensions"]),
                one(ASSERTION, NAME_IDS),
                many(PROTOCOL, &["SessionIndex"], 0),
            ],
        );
        rule(
            PROTOCOL,
            "Status",
            &[],
            vec![
                one(PROTOCOL, &["StatusCode"]),
                optional(PROTOCOL, &["StatusMessage"]),
                optional(PROTOCOL, &["StatusDetail"]),
            ],
        );
        rule(
            PROTOCOL,
            "StatusCode",
            &["Value"],
            vec![optional(PROTOCOL, &["StatusCode"])],
        );
        rule(PROTOCOL, "StatusMessage", &[], vec![]);
        rule(PROTOCOL, "SessionIndex", &[], vec![]);

        rule(
            ASSERTION,
            "Assertion",
            &["ID", "Version", "IssueInstant"],
            vec![
                one(ASSERTION, &["Issuer"]),
                optional(DSIG, &["Signature"]),
                optional(ASSERTION, &["Subject"]),
                optional(ASSERTION, &["Conditions"]),
                optional(ASSERTION, &["Advice"]),
                many(
                    ASSERTION,
                    &[
                        "Statement",
                        "AuthnStatement",
                        "AuthzDecisionStatement",
                        "AttributeStatement",
                    ],
                    0,
                ),
            ],
        );
        rule(ASSERTION, "Issuer", &[], vec![]);
        rule(ASSERTION, "NameID", &[], vec![]);
        rule(ASSERTION, "Audience", &[], vec![]);
        rule(
            ASSERTION,
            "Subject",
            &[],
            vec![
                optional(ASSERTION, NAME_IDS),
                many(ASSERTION, &["SubjectConfirmation"], 0),
            ],
        );
        rule(
            ASSERTION,
            "SubjectConfirmation",
            &["Method"],
            vec![
                optional(ASSERTION, NAME_IDS),
                optional(ASSERTION, &["SubjectConfirmationData"]),
            ],
        );
        rule(
            ASSERTION,
            "Conditions",
            &[],
            vec![many(
                ASSERTION,
                &[
                    "Condition",
                    "AudienceRestriction",
                    "OneTimeUse",
                    "ProxyRestriction",
                ],
                0,
            )],
        );
        rule(
            ASSERTION,
            "AudienceRestriction",
            &[],
            vec![many(ASSERTION, &["Audience"], 1)],
        );
        rule(
            ASSERTION,
            "AuthnStatement",
            &["AuthnInstant"],
            vec![
                optional(ASSERTION, &["SubjectLocality"]),
                one(ASSERTION, &["AuthnContext"]),
            ],
        );
        rule(
            ASSERTION,
            "AuthnContext",
            &[],
            vec![
                optional(ASSERTION, &["AuthnContextClassRef"]),
                optional(ASSERTION, &["AuthnContextDecl", "AuthnContextDeclRef"]),
                many(ASSERTION, &["AuthenticatingAuthority"], 0),
            ],
        );
        rule(
            ASSERTION,
            "AttributeStatement",
            &[],
            vec![many(ASSERTION, &["Attribute", "EncryptedAttribute"], 1)],
        );
        rule(
            ASSERTION,
            "Attribute",
            &["Name"],
            vec![many(ASSERTION, &["AttributeValue"], 0)],
        );
        for encrypted in ["EncryptedAssertion", "EncryptedID", "EncryptedAttribute"] {
            rule(
                ASSERTION,
                encrypted,
                &[],
                vec![
                    one(XENC, &["EncryptedData"]),
                    many(XENC, &["EncryptedKey"], 0),
                ],
            );
        }

        Schema { rules }
    }

    fn validate_element(&self, node: &Node) -> Result<(), String> {
        let name = node.get_name();
        let namespace = namespace_of(node).unwrap_or_default();
        let Some(rule) = self.rules.get(&clark_name(&namespace, &name)) else {
            return Ok(());
        };

        for attribute in rule.required_attributes {
            if node.get_attribute(attribute).is_none() {
                return Err(format!("{name} is missing the {attribute} attribute"));
            }
        }

        let children = node.get_child_elements();
        let mut index = 0;
        for particle in &rule.sequence {
            let mut count = 0;
            while index < children.len()
                && particle.max.map_or(true, |max| count < max)
                && particle_matches(particle, &children[index])
            {
                count += 1;
                index += 1;
            }
            if count < particle.min {
                return Err(format!(
                    "{name} requires {} {}",
                    particle.min,
                    particle.names.join(" or ")
                ));
            }
        }
        if let Some(unexpected) = children.get(index) {
            return Err(format!(
                "unexpected {} element in {name}",
                unexpected.get_name()
            ));
        }

        children
            .iter()
            .try_for_each(|child| self.validate_element(child))
    }
}

fn particle_matches(particle: &Particle, node: &Node) -> bool {
    namespace_of(node).as_deref() == Some(particle.namespace)
        && particle.names.contains(&node.get_name().as_str())
}

/// Validates a protocol message; the root must be a known protocol element.
pub fn validate_message(document: &Document) -> Result<(), String> {
    let root = document
        .get_root_element()
        .ok_or_else(|| "document has no root element".to_string())?;
    let schema = &*SAML_SCHEMA;
    if namespace_of(&root).as_deref() != Some(PROTOCOL)
        || !schema.rules.contains_key(&clark_name(PROTOCOL, &root.get_name()))
    {
        return Err(format!("{} is not a SAML protocol message", root.get_name()));
    }
    schema.validate_element(&root)
}

#[cfg(test)]
mod tests {
    use libxml::parser::Parser as XmlParser;

    use super::*;

    fn validate(xml: &str) -> Result<(), String> {
        let document = XmlParser::default().parse_string(xml).unwrap();
        validate_message(&document)
    }

    #[test]
    fn accepts_well_formed_messages() {
        for xml in [
            include_str!("../static/response_signed_assertion.xml"),
            include_str!("../static/response_double_signed.xml"),
            include_str!("../static/response_encrypted_assertion.xml"),
            include_str!("../static/response_encrypted_nameid.xml"),
            include_str!("../static/response_status_requester.xml"),
            include_str!("../static/logout_request.xml"),
            include_str!("../static/logout_request_signed.xml"),
            include_str!("../static/logout_response.xml"),
        ] {
            validate(xml).unwrap();
        }
    }

    #[test]
    fn rejects_misordered_children() {
        let xml = include_str!("../static/logout_request.xml");
        let reordered = xml.replace(
            "<saml:NameID Format=\"urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress\">user@example.org</saml:NameID><samlp:SessionIndex>_session_5f4e3d2c1b</samlp:SessionIndex>",
            "<samlp:SessionIndex>_session_5f4e3d2c1b</samlp:SessionIndex><saml:NameID Format=\"urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress\">user@example.org</saml:NameID>",
        );
        assert_ne!(reordered, xml);
        assert!(validate(&reordered).is_err());
    }

    #[test]
    fn rejects_missing_status_and_attributes() {
        let xml = include_str!("../static/logout_response.xml");
        let start = xml.find("<samlp:Status>").unwrap();
        let end = xml.find("</samlp:Status>").unwrap() + "</samlp:Status>".len();
        let without_status = format!("{}{}", &xml[..start], &xml[end..]);
        assert!(validate(&without_status).is_err());

        let without_version = xml.replace(" Version=\"2.0\"", "");
        assert!(validate(&without_version).is_err());
    }

    #[test]
    fn rejects_non_protocol_roots() {
        assert!(validate(include_str!("../static/idp_metadata.xml")).is_err());
    }
}

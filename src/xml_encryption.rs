//! XML-Encryption decryption for `EncryptedAssertion`, `EncryptedID` and
//! `EncryptedAttribute`.

use libxml::{
    parser::Parser as XmlParser,
    tree::{Document, Node},
    xpath::Context,
};
use openssl::{
    encrypt::Decrypter,
    error::ErrorStack,
    hash::MessageDigest,
    pkey::{PKey, Private},
    rsa::Padding,
    symm::{self, Cipher, Crypter, Mode},
};

use crate::{
    error::Result,
    utils::{decode_xml_base64, first_node, xpath_literal},
    DigestAlgorithm, SamlError, ASSERTION, XSI,
};

const RSA_1_5: &str = "http://www.w3.org/2001/04/xmlenc#rsa-1_5";
const RSA_OAEP_MGF1P: &str = "http://www.w3.org/2001/04/xmlenc#rsa-oaep-mgf1p";
const RSA_OAEP: &str = "http://www.w3.org/2009/xmlenc11#rsa-oaep";

const GCM_IV_LEN: usize = 12;
const GCM_TAG_LEN: usize = 16;

enum ContentCipher {
    Cbc(Cipher),
    Gcm(Cipher),
}

fn content_cipher(algorithm: &str) -> Result<ContentCipher> {
    Ok(match algorithm {
        "http://www.w3.org/2001/04/xmlenc#tripledes-cbc" => {
            ContentCipher::Cbc(Cipher::des_ede3_cbc())
        }
        "http://www.w3.org/2001/04/xmlenc#aes128-cbc" => ContentCipher::Cbc(Cipher::aes_128_cbc()),
        "http://www.w3.org/2001/04/xmlenc#aes192-cbc" => ContentCipher::Cbc(Cipher::aes_192_cbc()),
        "http://www.w3.org/2001/04/xmlenc#aes256-cbc" => ContentCipher::Cbc(Cipher::aes_256_cbc()),
        "http://www.w3.org/2009/xmlenc11#aes128-gcm" => ContentCipher::Gcm(Cipher::aes_128_gcm()),
        "http://www.w3.org/2009/xmlenc11#aes192-gcm" => ContentCipher::Gcm(Cipher::aes_192_gcm()),
        "http://www.w3.org/2009/xmlenc11#aes256-gcm" => ContentCipher::Gcm(Cipher::aes_256_gcm()),
        other => {
            return Err(SamlError::Decryption(format!(
                "unsupported encryption algorithm '{other}'"
            )))
        }
    })
}

/// Decrypts the `xenc:EncryptedData` below `container` and returns the plaintext.
pub fn decrypt_element(
    context: &Context,
    container: &Node,
    private_key: &PKey<Private>,
) -> Result<String> {
    let encrypted_data = first_node(context, "./xenc:EncryptedData", Some(container))
        .ok_or_else(|| SamlError::Decryption("EncryptedData element not found".into()))?;
    let encrypted_key = find_encrypted_key(context, container, &encrypted_data)
        .ok_or_else(|| SamlError::Decryption("EncryptedKey element not found".into()))?;

    let key_method = first_node(context, "./xenc:EncryptionMethod", Some(&encrypted_key))
        .ok_or_else(|| SamlError::Decryption("EncryptedKey has no EncryptionMethod".into()))?;
    let symmetric_key = decrypt_key(
        context,
        &key_method,
        private_key,
        &cipher_value(context, &encrypted_key)?,
    )?;

    let algorithm = first_node(context, "./xenc:EncryptionMethod", Some(&encrypted_data))
        .and_then(|method| method.get_attribute("Algorithm"))
        .ok_or_else(|| SamlError::Decryption("EncryptedData has no EncryptionMethod".into()))?;
    let plaintext = decrypt_content(
        content_cipher(&algorithm)?,
        &symmetric_key,
        &cipher_value(context, &encrypted_data)?,
    )?;

    String::from_utf8(plaintext)
        .map_err(|_| SamlError::Decryption("decrypted data is not valid UTF-8".into()))
}

fn find_encrypted_key(context: &Context, container: &Node, encrypted_data: &Node) -> Option<Node> {
    if let Some(key) = first_node(context, "./ds:KeyInfo/xenc:EncryptedKey", Some(encrypted_data)) {
        return Some(key);
    }
    if let Some(uri) = first_node(context, "./ds:KeyInfo/ds:RetrievalMethod", Some(encrypted_data))
        .and_then(|method| method.get_attribute("URI"))
    {
        let id = xpath_literal(uri.trim_start_matches('#'));
        return first_node(context, &format!("//xenc:EncryptedKey[@Id={id}]"), None);
    }
    first_node(context, "./xenc:EncryptedKey", Some(container))
}

fn cipher_value(context: &Context, node: &Node) -> Result<Vec<u8>> {
    let value = first_node(context, "./xenc:CipherData/xenc:CipherValue", Some(node))
        .ok_or_else(|| SamlError::Decryption("CipherValue element not found".into()))?;
    decode_xml_base64(&value.get_content())
        .map_err(|e| SamlError::Decryption(format!("invalid CipherValue: {e}")))
}

fn decrypt_key(
    context: &Context,
    method: &Node,
    private_key: &PKey<Private>,
    encrypted: &[u8],
) -> Result<Vec<u8>> {
    let algorithm = method.get_attribute("Algorithm").unwrap_or_default();
    let digest = |xpath: &str| -> Result<MessageDigest> {
        match first_node(context, xpath, Some(method)).and_then(|n| n.get_attribute("Algorithm")) {
            Some(uri) => uri
                .parse::<DigestAlgorithm>()
                .map(|d| d.message_digest())
                .map_err(|_| SamlError::Decryption(format!("unsupported digest '{uri}'"))),
            None => Ok(MessageDigest::sha1()),
        }
    };
    let padding = match algorithm.as_str() {
        RSA_1_5 => None,
        RSA_OAEP_MGF1P => Some((digest("./ds:DigestMethod")?, MessageDigest::sha1())),
        RSA_OAEP => Some((digest("./ds:DigestMethod")?, digest("./*[local-name()='MGF']")?)),
        other => {
            return Err(SamlError::Decryption(format!(
                "unsupported key transport algorithm '{other}'"
            )))
        }
    };
    rsa_decrypt(private_key, padding, encrypted)
        .map_err(|e| SamlError::Decryption(format!("unable to decrypt the key: {e}")))
}

fn rsa_decrypt(
    private_key: &PKey<Private>,
    oaep: Option<(MessageDigest, MessageDigest)>,
    encrypted: &[u8],
) -> std::result::Result<Vec<u8>, ErrorStack> {
    let mut decrypter = Decrypter::new(private_key)?;
    match oaep {
        None => decrypter.set_rsa_padding(Padding::PKCS1)?,
        Some((digest, mgf1)) => {
            decrypter.set_rsa_padding(Padding::PKCS1_OAEP)?;
            decrypter.set_rsa_oaep_md(digest)?;
            decrypter.set_rsa_mgf1_md(mgf1)?;
        }
    }
    let mut decrypted = vec![0; decrypter.decrypt_len(encrypted)?];
    let len = decrypter.decrypt(encrypted, &mut decrypted)?;
    decrypted.truncate(len);
    Ok(decrypted)
}

fn decrypt_content(cipher: ContentCipher, key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let fail = |e: ErrorStack| SamlError::Decryption(format!("unable to decrypt the data: {e}"));
    match cipher {
        ContentCipher::Gcm(cipher) => {
            if data.len() < GCM_IV_LEN + GCM_TAG_LEN {
                return Err(SamlError::Decryption("ciphertext is too short".into()));
            }
            let (iv, rest) = data.split_at(GCM_IV_LEN);
            let (ciphertext, tag) = rest.split_at(rest.len() - GCM_TAG_LEN);
            symm::decrypt_aead(cipher, key, Some(iv), &[], ciphertext, tag).map_err(fail)
        }
        ContentCipher::Cbc(cipher) => {
            if key.len() != cipher.key_len() {
                return Err(SamlError::Decryption("symmetric key has the wrong size".into()));
            }
            let block_size = cipher.block_size();
            if data.len() < 2 * block_size || data.len() % block_size != 0 {
                return Err(SamlError::Decryption("ciphertext has an invalid length".into()));
            }
            let (iv, ciphertext) = data.split_at(block_size);
            let mut crypter = Crypter::new(cipher, Mode::Decrypt, key, Some(iv)).map_err(fail)?;
            crypter.pad(false);
            let mut plaintext = vec![0; ciphertext.len() + block_size];
            let mut len = crypter.update(ciphertext, &mut plaintext).map_err(fail)?;
            len += crypter.finalize(&mut plaintext[len..]).map_err(fail)?;
            plaintext.truncate(len);

            // XML-Enc padding only fixes the last byte; the filler bytes are arbitrary.
            let padding = plaintext.last().copied().unwrap_or(0) as usize;
            if padding == 0 || padding > block_size || padding > plaintext.len() {
                return Err(SamlError::Decryption("invalid padding".into()));
            }
            plaintext.truncate(plaintext.len() - padding);
            Ok(plaintext)
        }
    }
}

/// Cuts the decrypted text down to the `local_name` element, dropping any XML
/// declaration before it and noise after its closing tag.
pub fn trim_to_element(plaintext: &str, local_name: &str) -> Result<String> {
    let mut text = plaintext.trim_start();
    if text.starts_with("<?xml") {
        let end = text
            .find("?>")
            .ok_or_else(|| SamlError::Decryption("malformed XML declaration".into()))?;
        text = text[end + 2..].trim_start();
    }
    let unprefixed = format!("</{local_name}>");
    let prefixed = format!(":{local_name}>");
    let end = [
        text.rfind(&unprefixed).map(|i| i + unprefixed.len()),
        text.rfind(&prefixed).map(|i| i + prefixed.len()),
    ]
    .into_iter()
    .flatten()
    .max()
    .ok_or_else(|| SamlError::Decryption(format!("decrypted data has no {local_name} element")))?;
    Ok(text[..end].to_string())
}

/// Adds the `saml` and `xsi` declarations the decrypted element relies on
/// inheriting from the message it was cut from.
pub fn declare_namespaces(element: &str) -> String {
    let tag_end = element
        .find(|c: char| c.is_whitespace() || c == '>' || c == '/')
        .unwrap_or(element.len());
    let start_tag = &element[..element.find('>').unwrap_or(element.len())];
    let mut declarations = String::new();
    if !start_tag.contains("xmlns:saml=") {
        declarations.push_str(&format!(" xmlns:saml=\"{ASSERTION}\""));
    }
    if !start_tag.contains("xmlns:xsi=") {
        declarations.push_str(&format!(" xmlns:xsi=\"{XSI}\""));
    }
    format!("{}{}{}", &element[..tag_end], declarations, &element[tag_end..])
}

/// Parses a decrypted element inside a wrapper that declares the SAML prefixes.
pub fn parse_decrypted(element: &str) -> Result<Document> {
    let wrapped = format!("<node xmlns:saml=\"{ASSERTION}\" xmlns:xsi=\"{XSI}\">{element}</node>");
    XmlParser::default()
        .parse_string(&wrapped)
        .map_err(SamlError::InvalidXml)
}

/// Decrypts an `EncryptedAssertion`, yielding the assertion as standalone XML.
pub fn decrypt_assertion(
    context: &Context,
    encrypted_assertion: &Node,
    private_key: &PKey<Private>,
) -> Result<String> {
    let plaintext = decrypt_element(context, encrypted_assertion, private_key)?;
    Ok(declare_namespaces(&trim_to_element(&plaintext, "Assertion")?))
}

/// Decrypts an `EncryptedID` into a document whose root wraps the `NameID`.
pub fn decrypt_nameid(
    context: &Context,
    encrypted_id: &Node,
    private_key: &PKey<Private>,
) -> Result<Document> {
    let plaintext = decrypt_element(context, encrypted_id, private_key)?;
    parse_decrypted(&trim_to_element(&plaintext, "NameID")?)
}

/// Decrypts an `EncryptedAttribute` into a document whose root wraps the `Attribute`.
pub fn decrypt_attribute(
    context: &Context,
    encrypted_attribute: &Node,
    private_key: &PKey<Private>,
) -> Result<Document> {
    let plaintext = decrypt_element(context, encrypted_attribute, private_key)?;
    parse_decrypted(&trim_to_element(&plaintext, "Attribute")?)
}

/// Elements in the decrypted wrapper document, e.g. the `NameID`.
pub fn wrapped_elements(document: &Document) -> Vec<Node> {
    document
        .get_root_element()
        .map(|root| root.get_child_elements())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::{parse_private_key, xpath_context};

    const SP_KEY: &str = include_str!("../static/sp.key");
    const WRONG_KEY: &str = include_str!("../static/wrong.key");
    const ENCRYPTED_ASSERTION: &str = include_str!("../static/response_encrypted_assertion.xml");
    const ENCRYPTED_NAMEID: &str = include_str!("../static/response_encrypted_nameid.xml");

    #[test]
    fn decrypts_assertions() {
        let document = XmlParser::default().parse_string(ENCRYPTED_ASSERTION).unwrap();
        let context = xpath_context(&document).unwrap();
        let node = first_node(&context, "//saml:EncryptedAssertion", None).unwrap();
        let key = parse_private_key(SP_KEY).unwrap();

        let assertion = decrypt_assertion(&context, &node, &key).unwrap();
        assert!(assertion.starts_with("<saml:Assertion"));
        assert!(assertion.ends_with("</saml:Assertion>"));
        assert!(assertion.contains("user@example.org"));
    }

    #[test]
    fn wrong_key_is_a_decryption_error() {
        let document = XmlParser::default().parse_string(ENCRYPTED_ASSERTION).unwrap();
        let context = xpath_context(&document).unwrap();
        let node = first_node(&context, "//saml:EncryptedAssertion", None).unwrap();
        let key = parse_private_key(WRONG_KEY).unwrap();

        assert!(matches!(
            decrypt_assertion(&context, &node, &key),
            Err(SamlError::Decryption(_))
        ));
    }

    #[test]
    fn decrypts_name_ids_and_attributes() {
        let document = XmlParser::default().parse_string(ENCRYPTED_NAMEID).unwrap();
        let context = xpath_context(&document).unwrap();
        let key = parse_private_key(SP_KEY).unwrap();

        let encrypted_id = first_node(&context, "//saml:EncryptedID", None).unwrap();
        let name_id = decrypt_nameid(&context, &encrypted_id, &key).unwrap();
        let nodes = wrapped_elements(&name_id);
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].get_name(), "NameID");
        assert_eq!(nodes[0].get_content(), "user@example.org");

        let encrypted_attribute = first_node(&context, "//saml:EncryptedAttribute", None).unwrap();
        let attribute = decrypt_attribute(&context, &encrypted_attribute, &key).unwrap();
        let nodes = wrapped_elements(&attribute);
        assert_eq!(nodes[0].get_attribute("Name").as_deref(), Some("department"));
        assert_eq!(nodes[0].get_content(), "engineering");
    }

    #[test]
    fn trims_noise_around_elements() {
        let trimmed = trim_to_element(
            "<?xml version=\"1.0\"?>\n<saml:NameID>a</saml:NameID>\u{0}\u{3}",
            "NameID",
        )
        .unwrap();
        assert_eq!(trimmed, "<saml:NameID>a</saml:NameID>");
        assert!(trim_to_element("<saml:Foo/>", "NameID").is_err());
    }

    #[test]
    fn declares_missing_namespaces() {
        assert_eq!(
            declare_namespaces("<saml:NameID>a</saml:NameID>"),
            format!("<saml:NameID xmlns:saml=\"{ASSERTION}\" xmlns:xsi=\"{XSI}\">a</saml:NameID>")
        );
        let declared = format!("<saml:NameID xmlns:saml=\"{ASSERTION}\" xmlns:xsi=\"{XSI}\">a</saml:NameID>");
        assert_eq!(declare_namespaces(&declared), declared);
    }
}

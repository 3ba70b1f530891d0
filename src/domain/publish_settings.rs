use std::fmt;

use anyhow::{anyhow, Context, Error};
use base64::{engine::general_purpose, Engine as _};
use p12::{ContentInfo, SafeBag};
use serde::Deserialize;
use yasna::ASN1Error;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subscription {
    pub id: String,
    pub name: String,
}

/// Decoded publish-settings bundle: endpoint, client certificate and subscriptions.
#[derive(Clone, Debug)]
pub struct PublishSettings {
    pub publish_method: String,
    pub management_url: String,
    pub certificate: ManagementCertificate,
    pub subscriptions: Vec<Subscription>,
}

/// Passwordless PKCS#12 bundle holding the management client certificate and its key.
#[derive(Clone)]
pub struct ManagementCertificate {
    der: Vec<u8>,
    private_keys: Vec<Vec<u8>>,
    certificates: Vec<Vec<u8>>,
}

impl fmt::Debug for ManagementCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagementCertificate")
            .field("der_len", &self.der.len())
            .field("private_keys", &self.private_keys.len())
            .field("certificates", &self.certificates.len())
            .finish()
    }
}

/// Encodings of the empty password: no bytes at all, as Windows exports
/// publish-settings bundles, then the terminated BMP string of RFC 7292.
const EMPTY_PASSWORDS: [&[u8]; 2] = [&[], &[0, 0]];

impl ManagementCertificate {
    pub fn from_base64(encoded: &str) -> Result<Self, Error> {
        let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
        let der = general_purpose::STANDARD
            .decode(compact)
            .context("Management certificate is not valid base64")?;
        let auth_safe = read_auth_safe(&der)
            .map_err(|e| anyhow!("Management certificate is not a PKCS#12 bundle: {:?}", e))?;

        let (private_keys, certificates) = EMPTY_PASSWORDS
            .iter()
            .find_map(|password| {
                let bags = decrypt_bags(&auth_safe, password)?;
                let private_keys: Vec<Vec<u8>> =
                    bags.iter().filter_map(|bag| bag.bag.get_key(password)).collect();
                let certificates: Vec<Vec<u8>> =
                    bags.iter().filter_map(|bag| bag.bag.get_x509_cert()).collect();
                (!private_keys.is_empty() && !certificates.is_empty())
                    .then_some((private_keys, certificates))
            })
            .ok_or(anyhow!(
                "Management certificate must hold a private key and a certificate readable with an empty password"
            ))?;
        Ok(Self {
            der,
            private_keys,
            certificates,
        })
    }

    #[cfg(test)]
    pub(crate) fn placeholder() -> Self {
        Self {
            der: Vec::new(),
            private_keys: Vec::new(),
            certificates: Vec::new(),
        }
    }

    pub fn as_der(&self) -> &[u8] {
        &self.der
    }

    /// DER X.509 certificates found in the bundle.
    pub fn certificates(&self) -> &[Vec<u8>] {
        &self.certificates
    }

    /// Private keys (PKCS#8) and certificates as PEM, the form TLS client identities are built from.
    pub fn to_pem(&self) -> String {
        let keys = self.private_keys.iter().map(|key| pem_block("PRIVATE KEY", key));
        let certificates = self
            .certificates
            .iter()
            .map(|certificate| pem_block("CERTIFICATE", certificate));
        keys.chain(certificates).collect()
    }
}

/// Reads the authenticated safe of a PFX. The trailing MAC data is skipped:
/// its iteration count is optional and bags are checked by decryption instead.
fn read_auth_safe(der: &[u8]) -> Result<ContentInfo, ASN1Error> {
    yasna::parse_der(der, |r| {
        r.read_sequence(|r| {
            r.next().read_u8()?;
            let auth_safe = ContentInfo::parse(r.next())?;
            r.read_optional(|r| r.read_der())?;
            Ok(auth_safe)
        })
    })
}

fn decrypt_bags(auth_safe: &ContentInfo, password: &[u8]) -> Option<Vec<SafeBag>> {
    let data = auth_safe.data(password)?;
    let contents = yasna::parse_der(&data, |r| r.collect_sequence_of(ContentInfo::parse)).ok()?;
    let mut bags = Vec::new();
    for content in &contents {
        let data = content.data(password)?;
        bags.extend(yasna::parse_der(&data, |r| r.collect_sequence_of(SafeBag::parse)).ok()?);
    }
    Some(bags)
}

fn pem_block(label: &str, der: &[u8]) -> String {
    let encoded = general_purpose::STANDARD.encode(der);
    let mut block = format!("-----BEGIN {}-----\n", label);
    for line in encoded.as_bytes().chunks(64) {
        block.push_str(&String::from_utf8_lossy(line));
        block.push('\n');
    }
    block.push_str(&format!("-----END {}-----\n", label));
    block
}

#[derive(Deserialize)]
struct PublishDataXml {
    #[serde(rename = "PublishProfile", default)]
    profiles: Vec<PublishProfileXml>,
}

#[derive(Deserialize)]
struct PublishProfileXml {
    #[serde(rename = "@PublishMethod", default)]
    publish_method: String,
    #[serde(rename = "@Url")]
    url: Option<String>,
    #[serde(rename = "@ManagementCertificate")]
    management_certificate: Option<String>,
    #[serde(rename = "Subscription", default)]
    subscriptions: Vec<SubscriptionXml>,
}

#[derive(Deserialize)]
struct SubscriptionXml {
    #[serde(rename = "@Id", default)]
    id: String,
    #[serde(rename = "@Name", default)]
    name: String,
    #[serde(rename = "@ServiceManagementUrl")]
    service_management_url: Option<String>,
    #[serde(rename = "@ManagementCertificate")]
    management_certificate: Option<String>,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

/// Decodes a publish-settings document.
///
/// Schema 1.0 carries the endpoint and certificate on the `PublishProfile`
/// element; schema 2.0 moves them onto each `Subscription`. The profile
/// values win when both are present.
pub fn parse(publish_settings_xml: &str) -> Result<PublishSettings, Error> {
    let document: PublishDataXml = quick_xml::de::from_str(publish_settings_xml)
        .context("Publish settings document is not valid XML")?;
    let profile = document
        .profiles
        .into_iter()
        .next()
        .ok_or(anyhow!("Publish settings contain no PublishProfile element"))?;

    let first_subscription = profile.subscriptions.first();
    let management_url = non_blank(profile.url)
        .or_else(|| first_subscription.and_then(|s| non_blank(s.service_management_url.clone())))
        .ok_or(anyhow!("Publish settings contain no management URL"))?;
    let encoded_certificate = non_blank(profile.management_certificate)
        .or_else(|| first_subscription.and_then(|s| non_blank(s.management_certificate.clone())))
        .ok_or(anyhow!("Publish settings contain no management certificate"))?;
    let certificate = ManagementCertificate::from_base64(&encoded_certificate)?;

    let subscriptions = profile
        .subscriptions
        .into_iter()
        .map(|subscription| Subscription {
            id: subscription.id,
            name: subscription.name,
        })
        .collect();

    Ok(PublishSettings {
        publish_method: profile.publish_method,
        management_url: management_url.trim_end_matches('/').to_string(),
        certificate,
        subscriptions,
    })
}

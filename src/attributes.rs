//! Peer attributes derived from the peer's certificate chain.
//!
//! The issuing CA of the peer is the issuer of the first certificate in the chain that is not a
//! proxy, rendered in the one-line `/C=../O=../CN=..` form. Virtual-organization membership is
//! read by an [`AttributeExtension`], which reports `Ok(None)` when the peer carries no such
//! extension.

use crate::provider::ProviderError;
use std::fmt;
use std::sync::Arc;
use x509_parser::certificate::X509Certificate;
use x509_parser::error::X509Error;
use x509_parser::nom::Err;
use x509_parser::x509::X509Name;

/// Maximum number of certificates accepted in a peer chain.
const MAX_CERT_CHAIN_LENGTH: usize = 16;

/// RFC 3820 proxyCertInfo.
const OID_PROXY_CERT_INFO: &str = "1.3.6.1.5.5.7.1.14";
/// Pre-RFC draft proxyCertInfo.
const OID_PROXY_CERT_INFO_DRAFT: &str = "1.3.6.1.4.1.3536.1.222";

const ATTRIBUTE_ABBREVIATIONS: [(&str, &str); 10] = [
    ("2.5.4.3", "CN"),
    ("2.5.4.6", "C"),
    ("2.5.4.7", "L"),
    ("2.5.4.8", "ST"),
    ("2.5.4.10", "O"),
    ("2.5.4.11", "OU"),
    ("2.5.4.5", "serialNumber"),
    ("0.9.2342.19200300.100.1.1", "UID"),
    ("0.9.2342.19200300.100.1.25", "DC"),
    ("1.2.840.113549.1.9.1", "emailAddress"),
];

/// Errors retrieving peer attributes.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum AttributeError {
    /// The mechanism did not expose the peer credential or its certificates.
    #[error("could not read the peer credential: {0}")]
    Credential(#[source] ProviderError),

    /// The context carries no peer credential.
    #[error("the peer credential is not available")]
    MissingPeerCredential,

    /// The peer presented no certificate.
    #[error("the peer certificate chain is empty")]
    EmptyChain,

    /// The peer chain is longer than accepted.
    #[error("the peer certificate chain has more than {max} certificates")]
    TooManyCertificates {
        /// Accepted maximum.
        max: usize,
    },

    /// A certificate could not be parsed.
    #[error("error parsing the peer certificate chain: {0}")]
    Certificate(#[from] X509Error),

    /// Every certificate in the chain is a proxy.
    #[error("no end-entity certificate in the peer chain")]
    NoEndEntity,

    /// The attribute extension is present but invalid.
    #[error("error parsing the attribute extension: {0}")]
    Extension(String),
}

/// Virtual-organization membership asserted by the peer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VoAttributes {
    /// Virtual organization name.
    pub vo: String,
    /// Fully qualified attribute names (roles), in the order they were asserted.
    pub fqans: Vec<String>,
}

/// Attributes of an authenticated peer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerAttributes {
    user_ca: Option<String>,
    vo: Option<VoAttributes>,
}

impl PeerAttributes {
    /// Creates attributes from their parts.
    pub fn new(user_ca: Option<String>, vo: Option<VoAttributes>) -> Self {
        Self { user_ca, vo }
    }

    /// Issuer of the peer's end-entity certificate.
    pub fn user_ca(&self) -> Option<&str> {
        self.user_ca.as_deref()
    }

    /// Virtual organization name.
    pub fn vo(&self) -> Option<&str> {
        self.vo.as_ref().map(|vo| vo.vo.as_str())
    }

    /// Fully qualified attribute names.
    pub fn fqans(&self) -> &[String] {
        self.vo.as_ref().map_or(&[][..], |vo| vo.fqans.as_slice())
    }
}

/// Reads an optional authorization extension from a peer chain.
pub trait AttributeExtension: Send + Sync {
    /// Returns `Ok(None)` when the chain carries no extension. `chain` holds the DER of each
    /// certificate, end entity first.
    fn extract(&self, chain: &[&[u8]]) -> Result<Option<VoAttributes>, AttributeError>;
}

/// No authorization extension support.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoExtension;

impl AttributeExtension for NoExtension {
    fn extract(&self, _chain: &[&[u8]]) -> Result<Option<VoAttributes>, AttributeError> {
        Ok(None)
    }
}

/// Computes peer attributes from the peer's DER certificate chain.
pub trait AttributeRetriever: Send + Sync {
    /// `chain` is the peer's DER certificates, concatenated, end entity first.
    fn retrieve(&self, chain: &[u8]) -> Result<PeerAttributes, AttributeError>;
}

/// Reads the issuing CA from the chain and delegates VO attributes to an extension reader.
#[derive(Clone)]
pub struct ChainAttributeRetriever {
    extension: Arc<dyn AttributeExtension>,
}

impl ChainAttributeRetriever {
    /// A retriever without authorization extension support.
    pub fn new() -> Self {
        Self {
            extension: Arc::new(NoExtension),
        }
    }

    /// Reads VO attributes with `extension`.
    #[must_use]
    pub fn with_extension(mut self, extension: Arc<dyn AttributeExtension>) -> Self {
        self.extension = extension;
        self
    }
}

impl Default for ChainAttributeRetriever {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ChainAttributeRetriever {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainAttributeRetriever")
            .finish_non_exhaustive()
    }
}

impl AttributeRetriever for ChainAttributeRetriever {
    fn retrieve(&self, chain: &[u8]) -> Result<PeerAttributes, AttributeError> {
        let certs = split_chain(chain)?;

        let (_, end_entity) = certs
            .iter()
            .find(|(_, cert)| !is_proxy(cert))
            .ok_or(AttributeError::NoEndEntity)?;
        let user_ca = one_line(end_entity.issuer())?;

        let ders: Vec<&[u8]> = certs.iter().map(|(der, _)| *der).collect();
        let vo = self.extension.extract(&ders)?;

        Ok(PeerAttributes::new(Some(user_ca), vo))
    }
}

/// Splits concatenated DER certificates, keeping each certificate's bytes next to its parse.
fn split_chain(chain: &[u8]) -> Result<Vec<(&[u8], X509Certificate<'_>)>, AttributeError> {
    if chain.is_empty() {
        return Err(AttributeError::EmptyChain);
    }

    let mut rest = chain;
    let mut certs = Vec::new();
    while !rest.is_empty() {
        if certs.len() >= MAX_CERT_CHAIN_LENGTH {
            return Err(AttributeError::TooManyCertificates {
                max: MAX_CERT_CHAIN_LENGTH,
            });
        }

        let (new_rest, cert) = x509_parser::parse_x509_certificate(rest).map_err(|e| match e {
            Err::Incomplete(_) => AttributeError::Certificate(X509Error::InvalidCertificate),
            Err::Error(err) | Err::Failure(err) => AttributeError::Certificate(err),
        })?;
        let cert_len = rest.len() - new_rest.len();
        certs.push((&rest[..cert_len], cert));
        rest = new_rest;
    }
    Ok(certs)
}

fn is_proxy(cert: &X509Certificate<'_>) -> bool {
    let has_proxy_extension = cert.extensions().iter().any(|ext| {
        let oid = ext.oid.to_id_string();
        oid == OID_PROXY_CERT_INFO || oid == OID_PROXY_CERT_INFO_DRAFT
    });
    has_proxy_extension
        || cert
            .subject()
            .iter_common_name()
            .last()
            .and_then(|cn| cn.as_str().ok())
            .is_some_and(is_legacy_proxy_cn)
}

/// Legacy (pre-RFC 3820) proxies are recognized by their last common name.
fn is_legacy_proxy_cn(cn: &str) -> bool {
    cn == "proxy" || cn == "limited proxy"
}

/// Renders a name as `/C=CH/O=Example/CN=Someone`, joining multi-valued RDNs with `+`.
fn one_line(name: &X509Name<'_>) -> Result<String, X509Error> {
    let mut out = String::new();
    for rdn in name.iter_rdn() {
        out.push('/');
        for (i, attr) in rdn.iter().enumerate() {
            if i > 0 {
                out.push('+');
            }
            let oid = attr.attr_type().to_id_string();
            let key = ATTRIBUTE_ABBREVIATIONS
                .iter()
                .find(|(id, _)| *id == oid)
                .map_or(oid.as_str(), |(_, abbrev)| *abbrev);
            out.push_str(key);
            out.push('=');
            out.push_str(attr.as_str()?);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CA: &[u8] = include_bytes!("../tests/testdata/chain/ca.der");
    const USER: &[u8] = include_bytes!("../tests/testdata/chain/user.der");
    const PROXY: &[u8] = include_bytes!("../tests/testdata/chain/proxy.der");
    const PROXY_CHAIN: &[u8] = include_bytes!("../tests/testdata/chain/proxy-chain.der");
    const CORRUPTED: &[u8] = include_bytes!("../tests/testdata/chain/corrupted");

    const EXAMPLE_CA: &str = "/C=CH/O=Example Grid/CN=Example Grid CA";

    struct FixedVo(Option<VoAttributes>);

    impl AttributeExtension for FixedVo {
        fn extract(&self, chain: &[&[u8]]) -> Result<Option<VoAttributes>, AttributeError> {
            assert!(!chain.is_empty());
            Ok(self.0.clone())
        }
    }

    struct BrokenVo;

    impl AttributeExtension for BrokenVo {
        fn extract(&self, _chain: &[&[u8]]) -> Result<Option<VoAttributes>, AttributeError> {
            Err(AttributeError::Extension("bad signature".into()))
        }
    }

    #[test]
    fn test_split_chain() {
        let certs = split_chain(PROXY_CHAIN).unwrap();
        assert_eq!(certs.len(), 3);
        assert_eq!(certs[0].0, PROXY);
        assert_eq!(certs[1].0, USER);
        assert_eq!(certs[2].0, CA);
    }

    #[test]
    fn test_proxy_detection() {
        let certs = split_chain(PROXY_CHAIN).unwrap();
        assert!(is_proxy(&certs[0].1));
        assert!(!is_proxy(&certs[1].1));
        assert!(!is_proxy(&certs[2].1));

        assert!(is_legacy_proxy_cn("proxy"));
        assert!(is_legacy_proxy_cn("limited proxy"));
        assert!(!is_legacy_proxy_cn("Jane Doe"));
    }

    #[test]
    fn test_one_line_rendering() {
        let certs = split_chain(PROXY_CHAIN).unwrap();
        assert_eq!(
            one_line(certs[0].1.subject()).unwrap(),
            "/C=CH/O=Example Grid/OU=Users/CN=Jane Doe/CN=123456789"
        );
        assert_eq!(one_line(certs[2].1.subject()).unwrap(), EXAMPLE_CA);
    }

    #[test]
    fn test_user_ca_skips_proxies() {
        let attributes = ChainAttributeRetriever::new().retrieve(PROXY_CHAIN).unwrap();
        assert_eq!(attributes.user_ca(), Some(EXAMPLE_CA));
        assert_eq!(attributes.vo(), None);
        assert!(attributes.fqans().is_empty());

        let attributes = ChainAttributeRetriever::new().retrieve(USER).unwrap();
        assert_eq!(attributes.user_ca(), Some(EXAMPLE_CA));
    }

    #[test]
    fn test_proxy_only_chain() {
        let err = ChainAttributeRetriever::new().retrieve(PROXY).unwrap_err();
        assert!(matches!(err, AttributeError::NoEndEntity));
    }

    #[test]
    fn test_invalid_chains() {
        let retriever = ChainAttributeRetriever::new();
        assert!(matches!(
            retriever.retrieve(CORRUPTED).unwrap_err(),
            AttributeError::Certificate(_)
        ));
        assert!(matches!(
            retriever.retrieve(&[]).unwrap_err(),
            AttributeError::EmptyChain
        ));

        let long: Vec<u8> = std::iter::repeat(CA)
            .take(MAX_CERT_CHAIN_LENGTH + 1)
            .flatten()
            .copied()
            .collect();
        assert!(matches!(
            retriever.retrieve(&long).unwrap_err(),
            AttributeError::TooManyCertificates { max: 16 }
        ));
    }

    #[test]
    fn test_vo_attributes_from_extension() {
        let vo = VoAttributes {
            vo: "dteam".into(),
            fqans: vec!["/dteam/Role=NULL/Capability=NULL".into(), "/dteam/ops".into()],
        };
        let retriever =
            ChainAttributeRetriever::new().with_extension(Arc::new(FixedVo(Some(vo))));
        let attributes = retriever.retrieve(PROXY_CHAIN).unwrap();
        assert_eq!(attributes.vo(), Some("dteam"));
        assert_eq!(attributes.fqans().len(), 2);
        assert_eq!(attributes.fqans()[1], "/dteam/ops");

        let retriever = ChainAttributeRetriever::new().with_extension(Arc::new(FixedVo(None)));
        assert_eq!(retriever.retrieve(PROXY_CHAIN).unwrap().vo(), None);
    }

    #[test]
    fn test_invalid_extension_fails() {
        let retriever = ChainAttributeRetriever::new().with_extension(Arc::new(BrokenVo));
        assert!(matches!(
            retriever.retrieve(PROXY_CHAIN).unwrap_err(),
            AttributeError::Extension(_)
        ));
    }
}

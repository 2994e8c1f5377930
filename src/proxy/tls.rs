use openssl::asn1::{Asn1Integer, Asn1Time};
use openssl::bn::{BigNum, MsbOption};
use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::extension::{
    BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAlternativeName, SubjectKeyIdentifier,
};
use openssl::x509::{X509Builder, X509NameBuilder, X509};
use std::collections::HashMap;
use std::net::IpAddr;
use tokio::sync::Mutex;
use tokio_native_tls::native_tls;
use tokio_native_tls::TlsAcceptor;
use tracing::debug;

use crate::proxy::InterceptorError;

const CA_NAME: &str = "relay interceptor CA";
const VALIDITY_DAYS: u32 = 365;

fn tls_error(e: impl std::fmt::Display) -> InterceptorError {
    InterceptorError::Tls(e.to_string())
}

fn serial_number() -> Result<Asn1Integer, ErrorStack> {
    let mut serial = BigNum::new()?;
    serial.rand(128, MsbOption::MAYBE_ZERO, false)?;
    serial.to_asn1_integer()
}

fn validity(builder: &mut X509Builder) -> Result<(), ErrorStack> {
    // Back-dated a day so clients with a slightly late clock accept it
    let now = chrono::Utc::now().timestamp();
    let not_before = Asn1Time::from_unix(now - 86_400)?;
    let not_after = Asn1Time::days_from_now(VALIDITY_DAYS)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;
    Ok(())
}

/// Throwaway certificate authority used to decrypt HTTPS routed through the proxy.
///
/// One leaf certificate is minted per host on first use and cached for the
/// lifetime of the interceptor. All leaves share a single key.
pub struct CertificateAuthority {
    cert: X509,
    key: PKey<Private>,
    leaf_key: PKey<Private>,
    acceptors: Mutex<HashMap<String, TlsAcceptor>>,
}

impl CertificateAuthority {
    pub fn generate() -> Result<Self, InterceptorError> {
        let key = PKey::from_rsa(Rsa::generate(2048).map_err(tls_error)?).map_err(tls_error)?;
        let leaf_key = PKey::from_rsa(Rsa::generate(2048).map_err(tls_error)?).map_err(tls_error)?;
        let cert = Self::build_ca(&key).map_err(tls_error)?;

        Ok(Self {
            cert,
            key,
            leaf_key,
            acceptors: Mutex::new(HashMap::new()),
        })
    }

    fn build_ca(key: &PKey<Private>) -> Result<X509, ErrorStack> {
        let mut name = X509NameBuilder::new()?;
        name.append_entry_by_text("CN", CA_NAME)?;
        name.append_entry_by_text("O", "relay")?;
        let name = name.build();

        let mut builder = X509Builder::new()?;
        builder.set_version(2)?;
        let serial = serial_number()?;
        builder.set_serial_number(&serial)?;
        builder.set_subject_name(&name)?;
        builder.set_issuer_name(&name)?;
        builder.set_pubkey(key)?;
        validity(&mut builder)?;
        builder.append_extension(BasicConstraints::new().critical().ca().build()?)?;
        builder.append_extension(KeyUsage::new().critical().key_cert_sign().crl_sign().build()?)?;
        let key_id = SubjectKeyIdentifier::new().build(&builder.x509v3_context(None, None))?;
        builder.append_extension(key_id)?;
        builder.sign(key, MessageDigest::sha256())?;

        Ok(builder.build())
    }

    fn build_leaf(&self, host: &str) -> Result<X509, ErrorStack> {
        let mut name = X509NameBuilder::new()?;
        name.append_entry_by_text("CN", host)?;
        let name = name.build();

        let mut builder = X509Builder::new()?;
        builder.set_version(2)?;
        let serial = serial_number()?;
        builder.set_serial_number(&serial)?;
        builder.set_subject_name(&name)?;
        builder.set_issuer_name(self.cert.subject_name())?;
        builder.set_pubkey(&self.leaf_key)?;
        validity(&mut builder)?;
        builder.append_extension(BasicConstraints::new().build()?)?;
        builder.append_extension(
            KeyUsage::new()
                .critical()
                .digital_signature()
                .key_encipherment()
                .build()?,
        )?;
        builder.append_extension(ExtendedKeyUsage::new().server_auth().build()?)?;

        let mut san = SubjectAlternativeName::new();
        if host.parse::<IpAddr>().is_ok() {
            san.ip(host);
        } else {
            san.dns(host);
        }
        let san = san.build(&builder.x509v3_context(Some(&self.cert), None))?;
        builder.append_extension(san)?;
        builder.sign(&self.key, MessageDigest::sha256())?;

        Ok(builder.build())
    }

    /// PEM of the CA certificate, for clients that should trust the proxy
    pub fn certificate_pem(&self) -> Result<Vec<u8>, InterceptorError> {
        self.cert.to_pem().map_err(tls_error)
    }

    /// TLS acceptor presenting a certificate for `host`
    pub async fn acceptor(&self, host: &str) -> Result<TlsAcceptor, InterceptorError> {
        let host = host.trim_start_matches('[').trim_end_matches(']').to_ascii_lowercase();

        let mut acceptors = self.acceptors.lock().await;
        if let Some(acceptor) = acceptors.get(&host) {
            return Ok(acceptor.clone());
        }

        let leaf = self.build_leaf(&host).map_err(tls_error)?;
        let mut chain = leaf.to_pem().map_err(tls_error)?;
        chain.extend(self.cert.to_pem().map_err(tls_error)?);
        let key = self.leaf_key.private_key_to_pem_pkcs8().map_err(tls_error)?;

        let identity = native_tls::Identity::from_pkcs8(&chain, &key).map_err(tls_error)?;
        let acceptor = TlsAcceptor::from(native_tls::TlsAcceptor::new(identity).map_err(tls_error)?);
        debug!("Minted interceptor certificate for {}", host);

        acceptors.insert(host, acceptor.clone());
        Ok(acceptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_leaf_is_signed_by_authority() {
        let authority = CertificateAuthority::generate().unwrap();

        let leaf = authority.build_leaf("example.com").unwrap();
        let ca_key = authority.cert.public_key().unwrap();
        assert!(leaf.verify(&ca_key).unwrap());

        let names: Vec<String> = leaf
            .subject_alt_names()
            .unwrap()
            .iter()
            .filter_map(|name| name.dnsname().map(str::to_string))
            .collect();
        assert_eq!(names, vec!["example.com".to_string()]);
    }

    #[tokio::test]
    async fn test_acceptors_are_cached_per_host() {
        let authority = CertificateAuthority::generate().unwrap();

        authority.acceptor("Example.com").await.unwrap();
        authority.acceptor("example.com").await.unwrap();
        authority.acceptor("127.0.0.1").await.unwrap();

        assert_eq!(authority.acceptors.lock().await.len(), 2);
        assert!(String::from_utf8(authority.certificate_pem().unwrap())
            .unwrap()
            .starts_with("-----BEGIN CERTIFICATE-----"));
    }
}

//! TLS certificates
//!
//! Loads the configured certificate/key pairs and picks one per connection
//! by the SNI hostname the client sent.

use crate::config::CertConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

pub fn load_certs(path: &str) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open certificate file {}: {}", path, e))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("Failed to parse certificates from {}: {}", path, e))?;

    if certs.is_empty() {
        anyhow::bail!("No certificates found in {}", path);
    }

    Ok(certs)
}

pub fn load_key(path: &str) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open key file {}: {}", path, e))?;
    let mut reader = BufReader::new(file);

    loop {
        match rustls_pemfile::read_one(&mut reader)
            .map_err(|e| anyhow::anyhow!("Failed to parse key from {}: {}", path, e))?
        {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            None => break,
            _ => continue,
        }
    }

    anyhow::bail!("No private key found in {}", path)
}

/// DNS names a certificate is valid for: SAN entries, or the subject CN when
/// the certificate has no SAN extension.
pub fn certificate_names(cert: &CertificateDer<'_>) -> Vec<String> {
    use x509_parser::prelude::*;

    let (_, parsed) = match X509Certificate::from_der(cert.as_ref()) {
        Ok(result) => result,
        Err(e) => {
            warn!(error = %e, "Failed to parse X.509 certificate");
            return Vec::new();
        }
    };

    let mut names = Vec::new();
    if let Ok(Some(san)) = parsed.subject_alternative_name() {
        for name in &san.value.general_names {
            if let GeneralName::DNSName(dns) = name {
                names.push(dns.to_ascii_lowercase());
            }
        }
    }

    if names.is_empty() {
        names.extend(
            parsed
                .subject()
                .iter_common_name()
                .filter_map(|cn| cn.as_str().ok())
                .map(|cn| cn.to_ascii_lowercase()),
        );
    }

    names
}

/// A certificate chain with its signing key and the names it covers
#[derive(Clone)]
pub struct LoadedCert {
    pub names: Vec<String>,
    pub key: Arc<CertifiedKey>,
}

impl LoadedCert {
    pub fn load(config: &CertConfig) -> anyhow::Result<Self> {
        let certs = load_certs(&config.cert)?;
        let key = load_key(&config.key)?;
        Self::from_der(certs, key)
            .map_err(|e| anyhow::anyhow!("Invalid certificate {}: {}", config.cert, e))
    }

    pub fn from_der(
        certs: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> anyhow::Result<Self> {
        let names = certs.first().map(certificate_names).unwrap_or_default();
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
            .map_err(|e| anyhow::anyhow!("Unsupported private key: {}", e))?;

        Ok(Self {
            names,
            key: Arc::new(CertifiedKey::new(certs, signing_key)),
        })
    }
}

/// Picks a certificate by SNI: exact name, then a `*.` wildcard one label
/// up, then the first configured certificate.
pub struct SniCertResolver {
    by_name: HashMap<String, Arc<CertifiedKey>>,
    fallback: Option<Arc<CertifiedKey>>,
}

impl std::fmt::Debug for SniCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.by_name.keys().collect();
        names.sort();
        f.debug_struct("SniCertResolver")
            .field("names", &names)
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

impl SniCertResolver {
    pub fn new(certs: Vec<LoadedCert>) -> Self {
        let fallback = certs.first().map(|c| c.key.clone());
        let mut by_name = HashMap::new();

        for cert in certs {
            for name in cert.names {
                // Earlier certificates win for duplicate names
                by_name.entry(name).or_insert_with(|| cert.key.clone());
            }
        }

        Self { by_name, fallback }
    }

    /// Certificate for a server name, if one covers it
    pub fn lookup(&self, server_name: &str) -> Option<Arc<CertifiedKey>> {
        let name = server_name.trim_end_matches('.').to_ascii_lowercase();

        if let Some(key) = self.by_name.get(&name) {
            return Some(key.clone());
        }

        let (_, parent) = name.split_once('.')?;
        self.by_name.get(&format!("*.{}", parent)).cloned()
    }

    /// Certificate to present for an optional SNI value
    pub fn select(&self, server_name: Option<&str>) -> Option<Arc<CertifiedKey>> {
        match server_name {
            Some(name) => self.lookup(name).or_else(|| {
                debug!(sni = name, "No certificate matches SNI, using default");
                self.fallback.clone()
            }),
            None => self.fallback.clone(),
        }
    }
}

impl ResolvesServerCert for SniCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.select(client_hello.server_name())
    }
}

/// Build the rustls server configuration (ring provider, TLS 1.2 and 1.3)
pub fn server_config(resolver: SniCertResolver) -> anyhow::Result<Arc<rustls::ServerConfig>> {
    let config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_no_client_auth()
    .with_cert_resolver(Arc::new(resolver));

    Ok(Arc::new(config))
}

/// Load every configured certificate and build an acceptor that selects
/// among them by SNI
pub fn acceptor_from_config(certs: &[CertConfig]) -> anyhow::Result<TlsAcceptor> {
    if certs.is_empty() {
        anyhow::bail!("No certificates configured");
    }

    let loaded = certs
        .iter()
        .map(LoadedCert::load)
        .collect::<anyhow::Result<Vec<_>>>()?;

    for (config, cert) in certs.iter().zip(&loaded) {
        if cert.names.is_empty() {
            warn!(cert = %config.cert, "Certificate has no DNS names, usable only as default");
        } else {
            debug!(cert = %config.cert, names = ?cert.names, "Loaded certificate");
        }
    }

    Ok(TlsAcceptor::from(server_config(SniCertResolver::new(loaded))?))
}

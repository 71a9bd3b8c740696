//! TLS support using rustls
//!
//! Certificates come from the `[tls]` config section, or, with
//! `auto_detect`, from the first pair found in the usual places web servers
//! keep them.

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;

use tokio_rustls::rustls;
use tokio_rustls::TlsAcceptor;

use super::error::{ServerError, ServerResult};
use crate::config::TlsConfig;

/// A certificate chain and its private key, both PEM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificatePair {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

impl CertificatePair {
    pub fn new(cert_file: impl Into<PathBuf>, key_file: impl Into<PathBuf>) -> Self {
        Self {
            cert_file: cert_file.into(),
            key_file: key_file.into(),
        }
    }

    fn exists(&self) -> bool {
        self.cert_file.is_file() && self.key_file.is_file()
    }
}

/// Where [`discover_certificates`] looks
#[derive(Debug, Clone)]
pub struct CertificateSearch {
    /// Checked in order
    pub candidates: Vec<CertificatePair>,
    /// Apache configs scanned for `SSLCertificateFile`/`SSLCertificateKeyFile`
    pub apache_configs: Vec<PathBuf>,
    /// cPanel's per-domain directory of `combined`/`private` pairs
    pub cpanel_dir: Option<PathBuf>,
}

impl CertificateSearch {
    /// Well-known locations, with `server_name` filled into per-domain paths
    pub fn standard(server_name: &str) -> Self {
        let candidates = vec![
            CertificatePair::new(
                "/etc/ssl/certs/apache-selfsigned.crt",
                "/etc/ssl/private/apache-selfsigned.key",
            ),
            CertificatePair::new("/etc/apache2/ssl/apache.crt", "/etc/apache2/ssl/apache.key"),
            CertificatePair::new(
                format!("/var/cpanel/ssl/apache_tls/{}/combined", server_name),
                format!("/var/cpanel/ssl/apache_tls/{}/private", server_name),
            ),
            CertificatePair::new(
                format!("/etc/letsencrypt/live/{}/fullchain.pem", server_name),
                format!("/etc/letsencrypt/live/{}/privkey.pem", server_name),
            ),
            CertificatePair::new(
                "/etc/ssl/certs/ssl-cert-snakeoil.pem",
                "/etc/ssl/private/ssl-cert-snakeoil.key",
            ),
            CertificatePair::new(
                "C:/xampp/apache/conf/ssl.crt/server.crt",
                "C:/xampp/apache/conf/ssl.key/server.key",
            ),
        ];

        Self {
            candidates,
            apache_configs: vec![
                PathBuf::from("/etc/apache2/apache2.conf"),
                PathBuf::from("/etc/httpd/conf/httpd.conf"),
                PathBuf::from("C:/xampp/apache/conf/httpd.conf"),
            ],
            cpanel_dir: Some(PathBuf::from("/var/cpanel/ssl/installed")),
        }
    }

    /// First pair whose files both exist
    pub fn find(&self) -> Option<CertificatePair> {
        if let Some(pair) = self.candidates.iter().find(|pair| pair.exists()) {
            return Some(pair.clone());
        }

        for config in &self.apache_configs {
            let Ok(content) = std::fs::read_to_string(config) else {
                continue;
            };
            match apache_certificates(&content) {
                Ok(Some(pair)) if pair.exists() => return Some(pair),
                Ok(_) => {}
                Err(e) => tracing::warn!("Failed to scan {:?}: {}", config, e),
            }
        }

        let dir = self.cpanel_dir.as_ref()?;
        let mut domains: Vec<PathBuf> = std::fs::read_dir(dir)
            .ok()?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_dir())
            .collect();
        domains.sort();
        domains
            .into_iter()
            .map(|domain| CertificatePair::new(domain.join("combined"), domain.join("private")))
            .find(CertificatePair::exists)
    }
}

/// Extract the certificate and key paths from an Apache config
fn apache_certificates(content: &str) -> ServerResult<Option<CertificatePair>> {
    let cert_re = regex::Regex::new(r#"(?im)^\s*SSLCertificateFile\s+"?([^"\r\n]+?)"?\s*$"#)
        .map_err(|e| ServerError::Tls(format!("Regex error: {}", e)))?;
    let key_re = regex::Regex::new(r#"(?im)^\s*SSLCertificateKeyFile\s+"?([^"\r\n]+?)"?\s*$"#)
        .map_err(|e| ServerError::Tls(format!("Regex error: {}", e)))?;

    let cert = cert_re.captures(content).map(|c| c[1].to_string());
    let key = key_re.captures(content).map(|c| c[1].to_string());
    Ok(match (cert, key) {
        (Some(cert), Some(key)) => Some(CertificatePair::new(cert, key)),
        _ => None,
    })
}

/// Search the standard locations for `server_name`
pub fn discover_certificates(server_name: &str) -> Option<CertificatePair> {
    let found = CertificateSearch::standard(server_name).find();
    match &found {
        Some(pair) => tracing::info!("TLS certificate detected: {:?}", pair.cert_file),
        None => tracing::debug!(server_name, "No TLS certificate found"),
    }
    found
}

fn system_hostname() -> String {
    std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Decide which certificates, if any, the listener should use
///
/// Explicit files win when TLS is enabled. Otherwise `auto_detect` may find
/// a pair, which turns TLS on; enabled TLS with nothing found is an error.
pub fn resolve_certificates(tls: &TlsConfig) -> ServerResult<Option<CertificatePair>> {
    if tls.enabled {
        if let (Some(cert), Some(key)) = (&tls.cert_file, &tls.key_file) {
            return Ok(Some(CertificatePair::new(cert.clone(), key.clone())));
        }
    }

    if tls.auto_detect {
        let server_name = tls.server_name.clone().unwrap_or_else(system_hostname);
        if let Some(pair) = discover_certificates(&server_name) {
            return Ok(Some(pair));
        }
    }

    if tls.enabled {
        return Err(ServerError::Tls(
            "TLS is enabled but no certificate was configured or found".to_string(),
        ));
    }
    Ok(None)
}

/// Load a rustls [`rustls::ServerConfig`] from PEM certificate and key files
pub fn load_server_config(pair: &CertificatePair) -> ServerResult<Arc<rustls::ServerConfig>> {
    use rustls_pemfile::{certs, private_key};

    let cert_file = File::open(&pair.cert_file).map_err(|e| ServerError::Certificate {
        path: pair.cert_file.clone(),
        error: e.to_string(),
    })?;
    let cert_chain: Vec<rustls::pki_types::CertificateDer<'static>> =
        certs(&mut BufReader::new(cert_file))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ServerError::Tls(format!("Failed to parse TLS certificates: {}", e)))?;

    if cert_chain.is_empty() {
        return Err(ServerError::Tls(
            "TLS cert file contains no certificates".to_string(),
        ));
    }

    let key_file = File::open(&pair.key_file).map_err(|e| ServerError::Certificate {
        path: pair.key_file.clone(),
        error: e.to_string(),
    })?;
    let key = private_key(&mut BufReader::new(key_file))
        .map_err(|e| ServerError::Tls(format!("Failed to parse TLS private key: {}", e)))?
        .ok_or_else(|| ServerError::Tls("TLS key file contains no private key".to_string()))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .map_err(|e| ServerError::Tls(format!("Failed to build TLS server config: {}", e)))?;

    Ok(Arc::new(config))
}

/// Acceptor for the configured certificates, or `None` for plain TCP
pub fn acceptor(tls: &TlsConfig) -> ServerResult<Option<TlsAcceptor>> {
    match resolve_certificates(tls)? {
        Some(pair) => {
            let config = load_server_config(&pair)?;
            tracing::info!("TLS enabled with {:?}", pair.cert_file);
            Ok(Some(TlsAcceptor::from(config)))
        }
        None => Ok(None),
    }
}

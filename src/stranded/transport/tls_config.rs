use std::io::BufReader;
use std::sync::Arc;

use rustls::{Certificate, PrivateKey, ServerConfig};

use crate::stranded::common::{Error, Result};
use crate::stranded::config::{FileOrBytes, TlsMaterial};

/// Accumulates TLS materials - as a filesystem path or as bytes already in
/// memory - and produces a configured `rustls::ServerConfig` on demand.
/// Deferred construction lets `Reactor::listen_tls` be called before the
/// certificate/key are actually read off disk.
#[derive(Default, Clone)]
pub struct TlsAcceptorConfig {
    cert_chain: Option<FileOrBytes>,
    private_key: Option<FileOrBytes>,
    password: Option<String>,
}

impl TlsAcceptorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cert_chain(mut self, cert_chain: FileOrBytes) -> Self {
        self.cert_chain = Some(cert_chain);
        self
    }

    pub fn with_private_key(mut self, private_key: FileOrBytes) -> Self {
        self.private_key = Some(private_key);
        self
    }

    /// Stored for encrypted PEM keys produced by legacy tooling. rustls-pemfile
    /// has no decryption routine for encrypted PKCS#1/PKCS#8 keys, so this
    /// doesn't enable loading one - it only changes the error `build()`
    /// returns for one from "no private key found" to a message that says
    /// outright that the key is encrypted and must be decrypted out of band
    /// first. See DESIGN.md.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn from_material(material: &TlsMaterial) -> Self {
        TlsAcceptorConfig {
            cert_chain: Some(material.cert_chain.clone()),
            private_key: Some(material.private_key.clone()),
            password: material.password.clone(),
        }
    }

    /// Builds the `rustls::ServerConfig`: no client auth, a single
    /// certificate chain and private key, rustls's safe-default cipher
    /// suites and protocol versions (which already exclude SSLv2/SSLv3
    /// equivalents - there's no dial to turn those back on).
    pub fn build(&self) -> Result<Arc<ServerConfig>> {
        let cert_chain = self
            .cert_chain
            .as_ref()
            .ok_or_else(|| Error::new("TlsAcceptorConfig: missing certificate chain"))?;
        let private_key = self
            .private_key
            .as_ref()
            .ok_or_else(|| Error::new("TlsAcceptorConfig: missing private key"))?;

        let certs = load_certs(cert_chain)?;
        let key = load_private_key(private_key, self.password.as_deref())?;

        let config = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(Error::from)?;

        Ok(Arc::new(config))
    }
}

fn material_bytes(material: &FileOrBytes) -> Result<Vec<u8>> {
    match material {
        FileOrBytes::FilePath(path) => std::fs::read(path).map_err(Error::from),
        FileOrBytes::Bytes(bytes) => Ok(bytes.clone()),
    }
}

fn load_certs(material: &FileOrBytes) -> Result<Vec<Certificate>> {
    let bytes = material_bytes(material)?;
    let mut reader = BufReader::new(bytes.as_slice());
    let certs = rustls_pemfile::certs(&mut reader)
        .map_err(|e| Error::new(format!("invalid certificate chain: {e}")))?;
    if certs.is_empty() {
        return Err(Error::new("certificate chain contained no certificates"));
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

/// Detects the PEM markers OpenSSL (and, via it, `ssl_options`-style
/// password-callback APIs) leave on an encrypted private key: the legacy
/// PKCS#1 `Proc-Type: 4,ENCRYPTED` header, and the PKCS#8
/// `BEGIN ENCRYPTED PRIVATE KEY` block label.
fn is_encrypted_pem(bytes: &[u8]) -> bool {
    let text = String::from_utf8_lossy(bytes);
    text.contains("Proc-Type: 4,ENCRYPTED") || text.contains("ENCRYPTED PRIVATE KEY")
}

fn load_private_key(material: &FileOrBytes, password: Option<&str>) -> Result<PrivateKey> {
    let bytes = material_bytes(material)?;

    if is_encrypted_pem(&bytes) {
        return Err(Error::new(if password.is_some() {
            "private key is password-protected; rustls-pemfile cannot decrypt PEM keys, \
             so `with_password` cannot be honored - decrypt the key out of band (e.g. \
             `openssl rsa -in key.pem -out key.pem`) and load the result instead"
        } else {
            "private key is password-protected but no password was configured"
        }));
    }

    // Try PKCS#8 first, then RSA (PKCS#1), matching how openssl-generated
    // keys commonly show up in the wild.
    let mut reader = BufReader::new(bytes.as_slice());
    let mut pkcs8 = rustls_pemfile::pkcs8_private_keys(&mut reader)
        .map_err(|e| Error::new(format!("invalid private key: {e}")))?;
    if let Some(key) = pkcs8.pop() {
        return Ok(PrivateKey(key));
    }

    let mut reader = BufReader::new(bytes.as_slice());
    let mut rsa = rustls_pemfile::rsa_private_keys(&mut reader)
        .map_err(|e| Error::new(format!("invalid private key: {e}")))?;
    if let Some(key) = rsa.pop() {
        return Ok(PrivateKey(key));
    }

    Err(Error::new("no private key found in PEM data"))
}

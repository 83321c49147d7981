//! Loading of the client credential (keystore) and trust anchor (truststore).
//!
//! Raw store bytes live in zeroizing buffers and are wiped once the key and
//! certificates have been extracted. The private key held by a [`Credential`]
//! is wiped when the credential is dropped.

use std::io::BufReader;
use std::path::Path;

use cms::content_info::ContentInfo;
use cms::encrypted_data::EncryptedData;
use der::asn1::{ContextSpecific, ObjectIdentifier, OctetString};
use der::{Decode, Encode};
use p12_keystore::{KeyStore, KeyStoreEntry};
use pkcs12::cert_type::CertBag;
use pkcs12::pfx::Pfx;
use pkcs12::safe_bag::SafeContents;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::RootCertStore;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, warn};
use zeroize::{Zeroize, Zeroizing};

use crate::config::{StoreType, TlsConfig};
use crate::error::{TlsError, TlsResult};

/// The private key and certificate chain identifying this client.
pub struct Credential {
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("chain_len", &self.chain.len())
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl Drop for Credential {
    fn drop(&mut self) {
        self.wipe();
    }
}

impl Credential {
    /// Load the credential described by the TLS configuration.
    ///
    /// # Errors
    ///
    /// Returns `TlsError::BadPassword` when a PKCS#12 keystore cannot be
    /// opened with the supplied password, and a load error when the file is
    /// missing or holds no usable key.
    pub fn load(config: &TlsConfig) -> TlsResult<Self> {
        match config.keystore_type {
            StoreType::Pkcs12 => Self::from_pkcs12(
                &config.keystore_path,
                config.keystore_password().as_ref(),
                config.key_password().as_ref(),
            ),
            StoreType::Pem => Self::from_pem(&config.keystore_path),
        }
    }

    /// Load a credential from a password-protected PKCS#12 keystore.
    ///
    /// When `key_password` is set and the keystore password does not open the
    /// archive, the key password is tried as well.
    ///
    /// # Errors
    ///
    /// Returns an error if the archive cannot be read, opened, or holds no key.
    pub fn from_pkcs12(
        path: &Path,
        password: Option<&SecretString>,
        key_password: Option<&SecretString>,
    ) -> TlsResult<Self> {
        let data = read_store(path)?;
        let store = open_pkcs12(&data, password).or_else(|err| match key_password {
            Some(alt) => open_pkcs12(&data, Some(alt)).map_err(|_| err),
            None => Err(err),
        });
        let store = store.map_err(|message| TlsError::BadPassword {
            path: path.display().to_string(),
            message,
        })?;

        let (alias, certs, key) = store
            .entries()
            .find_map(|(alias, entry)| match entry {
                KeyStoreEntry::PrivateKeyChain(chain) => Some((
                    alias.clone(),
                    chain
                        .chain()
                        .iter()
                        .map(|cert| CertificateDer::from(cert.as_der().to_vec()))
                        .collect::<Vec<_>>(),
                    Zeroizing::new(chain.key().to_vec()),
                )),
                #[allow(unreachable_patterns)]
                _ => None,
            })
            .ok_or_else(|| TlsError::NoPrivateKeys(path.display().to_string()))?;
        // p12-keystore gives no mutable access to its decrypted key, so the
        // store is released as soon as the key has been copied out.
        drop(store);

        if certs.is_empty() {
            return Err(TlsError::NoCertificates(path.display().to_string()));
        }

        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.to_vec()));
        debug!(path = %path.display(), alias = %alias, chain_len = certs.len(), "loaded PKCS#12 credential");

        Ok(Self { chain: certs, key })
    }

    /// Load a credential from a PEM file holding the certificate chain and an
    /// unencrypted private key.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or lacks a certificate or key.
    pub fn from_pem(path: &Path) -> TlsResult<Self> {
        let chain = load_certificates(path)?;
        let key = load_private_key(path)?;
        Ok(Self { chain, key })
    }

    /// Load a credential from separate PEM certificate and key files.
    ///
    /// # Errors
    ///
    /// Returns an error if either file is missing or empty.
    pub fn from_pem_files(cert_path: &Path, key_path: &Path) -> TlsResult<Self> {
        Ok(Self {
            chain: load_certificates(cert_path)?,
            key: load_private_key(key_path)?,
        })
    }

    /// Number of certificates in the chain.
    #[must_use]
    pub fn chain_len(&self) -> usize {
        self.chain.len()
    }

    fn wipe(&mut self) {
        self.key.zeroize();
    }

    /// Hand the chain and key over to the TLS configuration. The credential
    /// keeps an empty placeholder, which is what its `Drop` wipes.
    pub(crate) fn into_parts(mut self) -> (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>) {
        let chain = std::mem::take(&mut self.chain);
        let key = std::mem::replace(
            &mut self.key,
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(Vec::new())),
        );
        (chain, key)
    }
}

/// The certificate authorities used to verify broker certificates.
#[derive(Debug, Clone)]
pub struct TrustAnchor {
    roots: RootCertStore,
}

impl TrustAnchor {
    /// Load the trust anchor described by the TLS configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the truststore cannot be read or holds no usable
    /// certificate.
    pub fn load(config: &TlsConfig) -> TlsResult<Self> {
        match config.truststore_type {
            StoreType::Pkcs12 => Self::from_pkcs12(
                &config.truststore_path,
                config.truststore_password().as_ref(),
            ),
            StoreType::Pem => Self::from_pem(&config.truststore_path),
        }
    }

    /// Load trusted certificates from a PKCS#12 truststore.
    ///
    /// Certificates marked trusted for any purpose (as written by `keytool`
    /// or `openssl pkcs12 -jdktrust`) are used when present. Otherwise every
    /// certificate bag in the archive is a trust anchor, which covers stores
    /// exported with plain `openssl pkcs12 -export -nokeys`.
    ///
    /// # Errors
    ///
    /// Returns an error if the archive cannot be opened or holds no certificate.
    pub fn from_pkcs12(path: &Path, password: Option<&SecretString>) -> TlsResult<Self> {
        let data = read_store(path)?;
        let store = open_pkcs12(&data, password).map_err(|message| TlsError::CertificateLoad {
            path: path.display().to_string(),
            message,
        })?;

        let mut certs = Vec::new();
        for (_alias, entry) in store.entries() {
            match entry {
                KeyStoreEntry::Certificate(cert) => {
                    certs.push(CertificateDer::from(cert.as_der().to_vec()));
                }
                KeyStoreEntry::PrivateKeyChain(chain) => {
                    certs.extend(
                        chain
                            .chain()
                            .iter()
                            .map(|cert| CertificateDer::from(cert.as_der().to_vec())),
                    );
                }
                #[allow(unreachable_patterns)]
                _ => {}
            }
        }

        if certs.is_empty() {
            let password = password.map_or("", |p| p.expose_secret());
            certs = certificate_bags(&data, password).map_err(|message| {
                TlsError::CertificateLoad {
                    path: path.display().to_string(),
                    message,
                }
            })?;
            debug!(path = %path.display(), count = certs.len(), "using untagged certificate bags as trust anchors");
        }

        Self::from_certificates(path, certs)
    }

    /// Load trusted certificates from a PEM bundle.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or holds no usable certificate.
    pub fn from_pem(path: &Path) -> TlsResult<Self> {
        let certs = load_certificates(path)?;
        Self::from_certificates(path, certs)
    }

    fn from_certificates(path: &Path, certs: Vec<CertificateDer<'static>>) -> TlsResult<Self> {
        let mut roots = RootCertStore::empty();
        let (added, ignored) = roots.add_parsable_certificates(certs);
        debug!(path = %path.display(), added, ignored, "loaded trust anchors");

        if added == 0 {
            return Err(TlsError::NoCertificates(path.display().to_string()));
        }
        Ok(Self { roots })
    }

    /// Number of trusted certificates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.roots.len()
    }

    /// Whether the anchor holds no certificate.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub(crate) fn into_root_store(self) -> RootCertStore {
        self.roots
    }
}

fn read_store(path: &Path) -> TlsResult<Zeroizing<Vec<u8>>> {
    std::fs::read(path)
        .map(Zeroizing::new)
        .map_err(|e| TlsError::CertificateLoad {
            path: path.display().to_string(),
            message: e.to_string(),
        })
}

fn open_pkcs12(data: &[u8], password: Option<&SecretString>) -> Result<KeyStore, String> {
    let password = password.map_or("", |p| p.expose_secret());
    KeyStore::from_pkcs12(data, password).map_err(|e| e.to_string())
}

const CONTENT_TYPE_DATA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.7.1");
const CONTENT_TYPE_ENCRYPTED_DATA: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.7.6");

/// Every X.509 certificate bag in a PKCS#12 archive, whatever its
/// attributes. The archive must already have been opened with
/// [`open_pkcs12`], which checks its MAC against the password.
fn certificate_bags(data: &[u8], password: &str) -> Result<Vec<CertificateDer<'static>>, String> {
    let pfx = Pfx::from_der(data).map_err(|e| e.to_string())?;
    let auth_safe = octet_content(&pfx.auth_safe)?;
    let safes = Vec::<ContentInfo>::from_der(&auth_safe).map_err(|e| e.to_string())?;

    let mut certs = Vec::new();
    for safe in &safes {
        let contents = if safe.content_type == CONTENT_TYPE_DATA {
            octet_content(safe)?
        } else if safe.content_type == CONTENT_TYPE_ENCRYPTED_DATA {
            decrypt_content(safe, password)?
        } else {
            continue;
        };
        if contents.is_empty() {
            continue;
        }

        for bag in SafeContents::from_der(&contents).map_err(|e| e.to_string())? {
            if bag.bag_id != pkcs12::PKCS_12_CERT_BAG_OID {
                continue;
            }
            let cert: ContextSpecific<CertBag> =
                ContextSpecific::from_der(&bag.bag_value).map_err(|e| e.to_string())?;
            if cert.value.cert_id == pkcs12::PKCS_12_X509_CERT_OID {
                certs.push(CertificateDer::from(cert.value.cert_value.as_bytes().to_vec()));
            }
        }
    }
    Ok(certs)
}

fn octet_content(info: &ContentInfo) -> Result<Vec<u8>, String> {
    let der = info.content.to_der().map_err(|e| e.to_string())?;
    OctetString::from_der(&der)
        .map(OctetString::into_bytes)
        .map_err(|e| e.to_string())
}

fn decrypt_content(info: &ContentInfo, password: &str) -> Result<Vec<u8>, String> {
    let der = info.content.to_der().map_err(|e| e.to_string())?;
    let encrypted = EncryptedData::from_der(&der).map_err(|e| e.to_string())?;
    let Some(ciphertext) = encrypted.enc_content_info.encrypted_content.as_ref() else {
        return Ok(Vec::new());
    };

    let algorithm = encrypted
        .enc_content_info
        .content_enc_alg
        .to_der()
        .map_err(|e| e.to_string())?;
    let scheme = pkcs5::EncryptionScheme::from_der(&algorithm).map_err(|e| e.to_string())?;
    scheme
        .decrypt(password, ciphertext.as_bytes())
        .map_err(|e| format!("cannot decrypt certificate bags: {e}"))
}

/// Load certificates from a PEM file.
pub(crate) fn load_certificates(path: &Path) -> TlsResult<Vec<CertificateDer<'static>>> {
    let file = std::fs::File::open(path).map_err(|e| TlsError::CertificateLoad {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    let mut reader = BufReader::new(file);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .filter_map(|result| match result {
            Ok(cert) => Some(cert),
            Err(e) => {
                warn!(error = %e, "skipping invalid certificate");
                None
            }
        })
        .collect();

    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.display().to_string()));
    }

    debug!(count = certs.len(), path = %path.display(), "loaded certificates");
    Ok(certs)
}

/// Load the first private key from a PEM file.
pub(crate) fn load_private_key(path: &Path) -> TlsResult<PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path).map_err(|e| TlsError::PrivateKeyLoad {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TlsError::PrivateKeyLoad {
            path: path.display().to_string(),
            message: e.to_string(),
        })?
        .ok_or_else(|| TlsError::NoPrivateKeys(path.display().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;
    use tempfile::NamedTempFile;

    fn fixture(name: &str) -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("tests/fixtures")
            .join(name)
    }

    fn secret(s: &str) -> SecretString {
        SecretString::from(s.to_string())
    }

    #[test]
    fn test_pkcs12_credential() {
        let credential = Credential::from_pkcs12(
            &fixture("client.keystore.p12"),
            Some(&secret("client-ks-password")),
            None,
        )
        .unwrap();
        assert!(credential.chain_len() >= 1);
    }

    #[test]
    fn test_pkcs12_wrong_password() {
        let result = Credential::from_pkcs12(
            &fixture("client.keystore.p12"),
            Some(&secret("not-the-password")),
            None,
        );
        assert!(matches!(result, Err(TlsError::BadPassword { .. })));
    }

    #[test]
    fn test_pkcs12_key_password_fallback() {
        let credential = Credential::from_pkcs12(
            &fixture("client.keystore.p12"),
            Some(&secret("stale-password")),
            Some(&secret("client-ks-password")),
        );
        assert!(credential.is_ok());
    }

    #[test]
    fn test_pem_bundle_credential() {
        let credential = Credential::from_pem(&fixture("client.bundle.pem")).unwrap();
        assert_eq!(credential.chain_len(), 1);
    }

    #[test]
    fn test_pem_files_credential() {
        let credential =
            Credential::from_pem_files(&fixture("client.pem"), &fixture("client.key")).unwrap();
        assert_eq!(credential.chain_len(), 1);
    }

    #[test]
    fn test_credential_debug_redacts_key() {
        let credential = Credential::from_pem(&fixture("client.bundle.pem")).unwrap();
        assert!(format!("{credential:?}").contains("REDACTED"));
    }

    #[test]
    fn test_pkcs12_truststore_without_trust_attribute() {
        let anchor = TrustAnchor::from_pkcs12(
            &fixture("client.truststore.p12"),
            Some(&secret("client-ts-password")),
        )
        .unwrap();
        assert_eq!(anchor.len(), 1);
    }

    #[test]
    fn test_pkcs12_truststore_with_jdk_trust_attribute() {
        let anchor = TrustAnchor::from_pkcs12(
            &fixture("client.jdk-truststore.p12"),
            Some(&secret("client-ts-password")),
        )
        .unwrap();
        assert_eq!(anchor.len(), 1);
    }

    #[test]
    fn test_pkcs12_truststore_stores_agree() {
        let plain = certificate_bags(
            &std::fs::read(fixture("client.truststore.p12")).unwrap(),
            "client-ts-password",
        )
        .unwrap();
        let tagged = certificate_bags(
            &std::fs::read(fixture("client.jdk-truststore.p12")).unwrap(),
            "client-ts-password",
        )
        .unwrap();
        assert_eq!(plain, tagged);
        assert_eq!(plain, load_certificates(&fixture("ca.pem")).unwrap());
    }

    #[test]
    fn test_pkcs12_truststore_wrong_password() {
        let result = TrustAnchor::from_pkcs12(
            &fixture("client.truststore.p12"),
            Some(&secret("not-the-password")),
        );
        assert!(matches!(result, Err(TlsError::CertificateLoad { .. })));
    }

    #[test]
    fn test_credential_key_wiped_on_drop() {
        let mut credential = Credential::from_pkcs12(
            &fixture("client.keystore.p12"),
            Some(&secret("client-ks-password")),
            None,
        )
        .unwrap();
        assert!(!credential.key.secret_der().is_empty());

        credential.wipe();
        assert!(credential.key.secret_der().is_empty());
    }

    #[test]
    fn test_into_parts_keeps_key_and_leaves_placeholder() {
        let credential = Credential::from_pem(&fixture("client.bundle.pem")).unwrap();
        let (chain, key) = credential.into_parts();
        assert_eq!(chain.len(), 1);
        assert!(!key.secret_der().is_empty());
    }

    #[test]
    fn test_pem_truststore() {
        let anchor = TrustAnchor::from_pem(&fixture("ca.pem")).unwrap();
        assert!(!anchor.is_empty());
    }

    #[test]
    fn test_missing_truststore() {
        let result = TrustAnchor::from_pem(Path::new("/nonexistent/ca.pem"));
        assert!(matches!(result, Err(TlsError::CertificateLoad { .. })));
    }

    #[test]
    fn test_missing_keystore() {
        let result = Credential::from_pkcs12(Path::new("/nonexistent/client.p12"), None, None);
        assert!(matches!(result, Err(TlsError::CertificateLoad { .. })));
    }

    #[test]
    fn test_empty_cert_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"not a certificate").unwrap();
        let result = load_certificates(file.path());
        assert!(matches!(result, Err(TlsError::NoCertificates(_))));
    }

    #[test]
    fn test_pem_without_key() {
        let result = Credential::from_pem(&fixture("ca.pem"));
        assert!(matches!(result, Err(TlsError::NoPrivateKeys(_))));
    }
}

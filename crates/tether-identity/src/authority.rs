//! Certificate authority for the relay identity.
//!
//! On first use a 2048-bit RSA keypair and a self-signed certificate are
//! generated and written to the identity directory; later calls load and
//! reuse them. The SPKI fingerprint (SHA-256 over the DER-encoded
//! `SubjectPublicKeyInfo`, rendered as lowercase hex) is the value clients
//! pin under TOFU and the value embedded in discovery TXT records.

use crate::error::IdentityError;
use crate::{CERTIFICATE_VALIDITY_DAYS, KEY_BITS};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_RSA_SHA256};
use rsa::RsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

const CERT_FILE: &str = "relay.crt";
const KEY_FILE: &str = "relay.key";

/// Compute the SPKI fingerprint of a DER-encoded `SubjectPublicKeyInfo`
///
/// Returns the SHA-256 digest as a lowercase hex string. This is the compact
/// identity pin exchanged with clients.
pub fn spki_fingerprint(spki_der: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(spki_der);
    hex::encode(hasher.finalize())
}

/// A loaded relay identity
///
/// Holds the PEM-encoded certificate and private key plus the derived SPKI
/// fingerprint. The private key never leaves this process; only the
/// certificate and fingerprint are shared with clients.
#[derive(Clone)]
pub struct RelayIdentity {
    certificate_pem: String,
    private_key_pem: String,
    fingerprint: String,
    subject: String,
}

impl RelayIdentity {
    /// PEM-encoded certificate presented to clients
    pub fn certificate_pem(&self) -> &str {
        &self.certificate_pem
    }

    /// PEM-encoded private key
    pub fn private_key_pem(&self) -> &str {
        &self.private_key_pem
    }

    /// SPKI fingerprint (lowercase hex SHA-256)
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Certificate subject (the device display name)
    pub fn subject(&self) -> &str {
        &self.subject
    }
}

impl std::fmt::Debug for RelayIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayIdentity")
            .field("subject", &self.subject)
            .field("fingerprint", &&self.fingerprint[..16])
            .finish_non_exhaustive()
    }
}

/// Generates, stores, and loads the relay's self-signed identity
pub struct CertificateAuthority {
    dir: PathBuf,
    subject: String,
}

impl CertificateAuthority {
    /// Create an authority rooted at `dir`
    ///
    /// `subject` becomes the certificate's common name and should be the
    /// device display name shown to users during pairing.
    pub fn new(dir: impl Into<PathBuf>, subject: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            subject: subject.into(),
        }
    }

    /// Path of the stored certificate
    pub fn certificate_path(&self) -> PathBuf {
        self.dir.join(CERT_FILE)
    }

    /// Path of the stored private key
    pub fn key_path(&self) -> PathBuf {
        self.dir.join(KEY_FILE)
    }

    /// Load the stored identity, generating one on first use
    ///
    /// # Errors
    ///
    /// Returns an error if generation fails, if the store holds a partial
    /// identity, or on filesystem failure. No partial identity is ever left
    /// on disk: files are committed with a temp-write-then-rename, and only
    /// after both halves were written successfully.
    pub fn load_or_generate(&self) -> Result<RelayIdentity, IdentityError> {
        let cert_exists = self.certificate_path().exists();
        let key_exists = self.key_path().exists();

        match (cert_exists, key_exists) {
            (true, true) => self.load(),
            (false, false) => {
                tracing::info!(dir = %self.dir.display(), "no relay identity found, generating");
                self.generate()
            }
            (true, false) => Err(IdentityError::Incomplete("private key")),
            (false, true) => Err(IdentityError::Incomplete("certificate")),
        }
    }

    /// Delete the stored identity and create a fresh one
    ///
    /// This is a trust reset: every fingerprint previously pinned by a client
    /// becomes invalid, and clients will alert on their next connection.
    ///
    /// # Errors
    ///
    /// Returns an error if deletion or regeneration fails.
    pub fn regenerate(&self) -> Result<RelayIdentity, IdentityError> {
        for path in [self.certificate_path(), self.key_path()] {
            if path.exists() {
                fs::remove_file(&path)?;
            }
        }
        tracing::warn!(subject = %self.subject, "relay identity reset, pinned fingerprints invalidated");
        self.generate()
    }

    fn load(&self) -> Result<RelayIdentity, IdentityError> {
        let certificate_pem = fs::read_to_string(self.certificate_path())?;
        let private_key_pem = fs::read_to_string(self.key_path())?;

        let key = RsaPrivateKey::from_pkcs8_pem(&private_key_pem)
            .map_err(|e| IdentityError::KeyEncoding(e.to_string()))?;
        let spki = key
            .to_public_key()
            .to_public_key_der()
            .map_err(|e| IdentityError::KeyEncoding(e.to_string()))?;
        let fingerprint = spki_fingerprint(spki.as_bytes());

        tracing::debug!(fingerprint = %&fingerprint[..16], "loaded relay identity");

        Ok(RelayIdentity {
            certificate_pem,
            private_key_pem,
            fingerprint,
            subject: self.subject.clone(),
        })
    }

    fn generate(&self) -> Result<RelayIdentity, IdentityError> {
        let mut rng = rand::rngs::OsRng;
        let key = RsaPrivateKey::new(&mut rng, KEY_BITS)
            .map_err(|e| IdentityError::KeyGeneration(e.to_string()))?;

        let private_key_pem = key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| IdentityError::KeyEncoding(e.to_string()))?
            .to_string();
        let spki = key
            .to_public_key()
            .to_public_key_der()
            .map_err(|e| IdentityError::KeyEncoding(e.to_string()))?;
        let fingerprint = spki_fingerprint(spki.as_bytes());

        // rcgen signs with the imported key; it cannot generate RSA keys itself
        let key_pair = KeyPair::from_pem_and_sign_algo(&private_key_pem, &PKCS_RSA_SHA256)?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, self.subject.clone());
        params.distinguished_name = dn;
        params.not_before = time::OffsetDateTime::now_utc();
        params.not_after = params.not_before + time::Duration::days(CERTIFICATE_VALIDITY_DAYS);

        let certificate = params.self_signed(&key_pair)?;
        let certificate_pem = certificate.pem();

        self.commit(&certificate_pem, &private_key_pem)?;

        tracing::info!(
            subject = %self.subject,
            fingerprint = %&fingerprint[..16],
            "generated relay identity"
        );

        Ok(RelayIdentity {
            certificate_pem,
            private_key_pem,
            fingerprint,
            subject: self.subject.clone(),
        })
    }

    /// Write both identity halves, then rename into place
    ///
    /// Rename is the commit point; a failure before the second rename leaves
    /// at most a stale temp file behind, never a half-identity under the
    /// final names.
    fn commit(&self, certificate_pem: &str, private_key_pem: &str) -> Result<(), IdentityError> {
        fs::create_dir_all(&self.dir)?;

        let key_tmp = self.dir.join(format!("{KEY_FILE}.tmp"));
        let cert_tmp = self.dir.join(format!("{CERT_FILE}.tmp"));

        let result = (|| {
            fs::write(&key_tmp, private_key_pem)?;
            fs::write(&cert_tmp, certificate_pem)?;
            fs::rename(&key_tmp, self.key_path())?;
            fs::rename(&cert_tmp, self.certificate_path())?;
            Ok(())
        })();

        if result.is_err() {
            let _ = fs::remove_file(&key_tmp);
            let _ = fs::remove_file(&cert_tmp);
            let _ = fs::remove_file(self.key_path());
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_fingerprint_is_hex_sha256() {
        let fp = spki_fingerprint(b"not a real key");
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_fingerprint_deterministic() {
        assert_eq!(spki_fingerprint(b"abc"), spki_fingerprint(b"abc"));
        assert_ne!(spki_fingerprint(b"abc"), spki_fingerprint(b"abd"));
    }

    #[test]
    fn test_generate_and_reload() {
        let dir = tempdir().unwrap();
        let authority = CertificateAuthority::new(dir.path(), "Test Desktop");

        let first = authority.load_or_generate().unwrap();
        assert!(authority.certificate_path().exists());
        assert!(authority.key_path().exists());
        assert!(first.certificate_pem().contains("BEGIN CERTIFICATE"));
        assert!(first.private_key_pem().contains("PRIVATE KEY"));
        assert_eq!(first.fingerprint().len(), 64);
        assert_eq!(first.subject(), "Test Desktop");

        // Second call must reuse, not regenerate
        let second = authority.load_or_generate().unwrap();
        assert_eq!(first.fingerprint(), second.fingerprint());
        assert_eq!(first.certificate_pem(), second.certificate_pem());
    }

    #[test]
    fn test_regenerate_changes_fingerprint() {
        let dir = tempdir().unwrap();
        let authority = CertificateAuthority::new(dir.path(), "Test Desktop");

        let first = authority.load_or_generate().unwrap();
        let reset = authority.regenerate().unwrap();

        assert_ne!(first.fingerprint(), reset.fingerprint());

        // The reset identity is what loads from now on
        let reloaded = authority.load_or_generate().unwrap();
        assert_eq!(reset.fingerprint(), reloaded.fingerprint());
    }

    #[test]
    fn test_partial_identity_is_rejected() {
        let dir = tempdir().unwrap();
        let authority = CertificateAuthority::new(dir.path(), "Test Desktop");
        authority.load_or_generate().unwrap();

        fs::remove_file(authority.key_path()).unwrap();
        let result = authority.load_or_generate();
        assert!(matches!(result, Err(IdentityError::Incomplete(_))));
    }

    #[test]
    fn test_no_tmp_files_left_behind() {
        let dir = tempdir().unwrap();
        let authority = CertificateAuthority::new(dir.path(), "Test Desktop");
        authority.load_or_generate().unwrap();

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_debug_does_not_leak_key() {
        let dir = tempdir().unwrap();
        let authority = CertificateAuthority::new(dir.path(), "Test Desktop");
        let identity = authority.load_or_generate().unwrap();

        let debug = format!("{identity:?}");
        assert!(!debug.contains("PRIVATE KEY"));
        assert!(debug.contains("fingerprint"));
    }
}

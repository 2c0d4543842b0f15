//! Ledger Signing Service
//!
//! Owns the ledger's RSA keypair and produces RSA-PSS (SHA-256,
//! MGF1-SHA-256, salt length = digest length) signatures over entry hashes.
//! The signed message is the ASCII hex `hash` string of an entry.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::pss::{BlindedSigningKey, Signature, VerifyingKey};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

use crate::error::LedgerError;

pub const SIGNATURE_ALGORITHM: &str = "RSA-PSS-SHA256";
pub const MIN_KEY_BITS: usize = 2048;
pub const PRIVATE_KEY_FILE: &str = "ledger_private_key.pem";
pub const PUBLIC_KEY_FILE: &str = "ledger_public_key.pem";

/// Public half of the ledger key, for out-of-band verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyInfo {
    pub algorithm: String,
    pub public_key_pem: String,
    pub key_id: String,
    pub key_bits: usize,
    pub timestamp: DateTime<Utc>,
}

pub struct SigningService {
    signing_key: BlindedSigningKey<Sha256>,
    verifying_key: VerifyingKey<Sha256>,
    public_key_pem: String,
    key_id: String,
    key_bits: usize,
}

impl SigningService {
    /// Load the keypair from `key_dir`, generating and persisting one on
    /// first use.
    pub fn load_or_generate(key_dir: &Path, bits: usize) -> Result<Self, LedgerError> {
        let private_path = key_dir.join(PRIVATE_KEY_FILE);
        let public_path = key_dir.join(PUBLIC_KEY_FILE);

        if private_path.exists() {
            let pem = fs::read_to_string(&private_path).map_err(|e| {
                LedgerError::ConfigError(format!("Failed to read private key {:?}: {}", private_path, e))
            })?;
            let private_key = RsaPrivateKey::from_pkcs8_pem(&pem).map_err(|e| {
                LedgerError::ConfigError(format!("Invalid private key {:?}: {}", private_path, e))
            })?;
            let service = Self::from_private_key(private_key)?;
            if !public_path.exists() {
                write_key_file(&public_path, service.public_key_pem.as_bytes(), 0o644)?;
            }
            info!("Loaded ledger signing key {}", service.key_id);
            return Ok(service);
        }

        check_key_bits(bits)?;
        info!("Generating {}-bit ledger signing key in {:?}", bits, key_dir);
        let private_key = generate_private_key(bits)?;
        let private_pem = private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| LedgerError::ProcessingError(format!("Failed to encode private key: {}", e)))?;

        let service = Self::from_private_key(private_key)?;

        fs::create_dir_all(key_dir).map_err(|e| {
            LedgerError::ConfigError(format!("Failed to create key directory {:?}: {}", key_dir, e))
        })?;
        write_key_file(&private_path, private_pem.as_bytes(), 0o600)?;
        write_key_file(&public_path, service.public_key_pem.as_bytes(), 0o644)?;

        info!("Generated ledger signing key {}", service.key_id);
        Ok(service)
    }

    /// Wrap an existing private key without touching the filesystem.
    pub fn from_private_key(private_key: RsaPrivateKey) -> Result<Self, LedgerError> {
        let key_bits = private_key.size() * 8;
        check_key_bits(key_bits)?;

        let public_key = private_key.to_public_key();
        let public_key_pem = public_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| LedgerError::ProcessingError(format!("Failed to encode public key: {}", e)))?;
        let key_id = key_id_for(&public_key)?;

        Ok(Self {
            verifying_key: VerifyingKey::new(public_key),
            signing_key: BlindedSigningKey::new(private_key),
            public_key_pem,
            key_id,
            key_bits,
        })
    }

    /// Sign an entry hash, returning the base64 signature.
    pub fn sign(&self, hash: &str) -> Result<String, LedgerError> {
        let mut rng = rand::thread_rng();
        let signature = self
            .signing_key
            .try_sign_with_rng(&mut rng, hash.as_bytes())
            .map_err(|e| LedgerError::ProcessingError(format!("Signing failed: {}", e)))?;
        Ok(BASE64.encode(signature.to_bytes()))
    }

    /// Check a base64 signature over `hash`. Malformed input is `false`.
    pub fn verify(&self, hash: &str, signature: &str) -> bool {
        verify_with_key(&self.verifying_key, hash, signature)
    }

    pub fn public_key(&self) -> PublicKeyInfo {
        PublicKeyInfo {
            algorithm: SIGNATURE_ALGORITHM.to_string(),
            public_key_pem: self.public_key_pem.clone(),
            key_id: self.key_id.clone(),
            key_bits: self.key_bits,
            timestamp: Utc::now(),
        }
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }
}

impl std::fmt::Debug for SigningService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningService")
            .field("key_id", &self.key_id)
            .field("key_bits", &self.key_bits)
            .finish_non_exhaustive()
    }
}

/// Verify a signature using only a PEM-encoded public key.
pub fn verify_with_public_key_pem(public_key_pem: &str, hash: &str, signature: &str) -> bool {
    match RsaPublicKey::from_public_key_pem(public_key_pem) {
        Ok(public_key) => verify_with_key(&VerifyingKey::new(public_key), hash, signature),
        Err(e) => {
            warn!("Unusable public key supplied for verification: {}", e);
            false
        }
    }
}

pub fn generate_private_key(bits: usize) -> Result<RsaPrivateKey, LedgerError> {
    check_key_bits(bits)?;
    let mut rng = rand::thread_rng();
    RsaPrivateKey::new(&mut rng, bits)
        .map_err(|e| LedgerError::ProcessingError(format!("Key generation failed: {}", e)))
}

fn verify_with_key(key: &VerifyingKey<Sha256>, hash: &str, signature: &str) -> bool {
    let Ok(bytes) = BASE64.decode(signature.trim()) else {
        return false;
    };
    let Ok(signature) = Signature::try_from(bytes.as_slice()) else {
        return false;
    };
    key.verify(hash.as_bytes(), &signature).is_ok()
}

fn key_id_for(public_key: &RsaPublicKey) -> Result<String, LedgerError> {
    let der = public_key
        .to_public_key_der()
        .map_err(|e| LedgerError::ProcessingError(format!("Failed to encode public key: {}", e)))?;
    let digest = Sha256::digest(der.as_bytes());
    Ok(hex::encode(&digest[..8]))
}

fn check_key_bits(bits: usize) -> Result<(), LedgerError> {
    if bits < MIN_KEY_BITS {
        return Err(LedgerError::ConfigError(format!(
            "RSA key size {} is below the minimum of {} bits",
            bits, MIN_KEY_BITS
        )));
    }
    Ok(())
}

fn write_key_file(path: &Path, contents: &[u8], mode: u32) -> Result<(), LedgerError> {
    fs::write(path, contents)
        .map_err(|e| LedgerError::ProcessingError(format!("Failed to write key {:?}: {}", path, e)))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|e| {
            LedgerError::ProcessingError(format!("Failed to set permissions on {:?}: {}", path, e))
        })?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    Ok(())
}

/// One key per test binary; RSA generation is slow in debug builds.
#[cfg(test)]
pub(crate) fn test_key() -> RsaPrivateKey {
    static KEY: std::sync::OnceLock<RsaPrivateKey> = std::sync::OnceLock::new();
    KEY.get_or_init(|| generate_private_key(MIN_KEY_BITS).unwrap()).clone()
}

#[cfg(test)]
pub(crate) fn test_signer() -> std::sync::Arc<SigningService> {
    std::sync::Arc::new(SigningService::from_private_key(test_key()).unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_sign_and_verify() {
        let service = SigningService::from_private_key(test_key()).unwrap();
        let hash = "ab".repeat(32);

        let signature = service.sign(&hash).unwrap();
        assert!(service.verify(&hash, &signature));
        assert!(!service.verify(&"cd".repeat(32), &signature));
    }

    #[test]
    fn test_signatures_are_randomized() {
        let service = SigningService::from_private_key(test_key()).unwrap();
        let hash = "ef".repeat(32);

        let first = service.sign(&hash).unwrap();
        let second = service.sign(&hash).unwrap();
        assert_ne!(first, second);
        assert!(service.verify(&hash, &first));
        assert!(service.verify(&hash, &second));
    }

    #[test]
    fn test_malformed_signatures_are_false() {
        let service = SigningService::from_private_key(test_key()).unwrap();
        let hash = "00".repeat(32);

        assert!(!service.verify(&hash, ""));
        assert!(!service.verify(&hash, "not base64 !!"));
        assert!(!service.verify(&hash, &BASE64.encode(b"short")));

        let mut signature = BASE64.decode(service.sign(&hash).unwrap()).unwrap();
        signature[0] ^= 0xff;
        assert!(!service.verify(&hash, &BASE64.encode(signature)));
    }

    #[test]
    fn test_public_key_info_allows_independent_verification() {
        let service = SigningService::from_private_key(test_key()).unwrap();
        let info = service.public_key();

        assert_eq!(info.algorithm, SIGNATURE_ALGORITHM);
        assert_eq!(info.key_bits, 2048);
        assert_eq!(info.key_id.len(), 16);
        assert!(info.public_key_pem.contains("BEGIN PUBLIC KEY"));
        assert!(!info.public_key_pem.contains("PRIVATE"));

        let hash = "12".repeat(32);
        let signature = service.sign(&hash).unwrap();
        assert!(verify_with_public_key_pem(&info.public_key_pem, &hash, &signature));
        assert!(!verify_with_public_key_pem("garbage", &hash, &signature));
    }

    #[test]
    fn test_rejects_small_keys() {
        assert!(matches!(
            generate_private_key(1024),
            Err(LedgerError::ConfigError(_))
        ));
    }

    #[test]
    fn test_key_persistence() {
        let dir = tempdir().unwrap();
        let key_dir = dir.path().join("keys");

        // Seed the directory so the test does not pay for a second key generation
        let pem = test_key().to_pkcs8_pem(LineEnding::LF).unwrap();
        fs::create_dir_all(&key_dir).unwrap();
        write_key_file(&key_dir.join(PRIVATE_KEY_FILE), pem.as_bytes(), 0o600).unwrap();

        let first = SigningService::load_or_generate(&key_dir, MIN_KEY_BITS).unwrap();
        let second = SigningService::load_or_generate(&key_dir, MIN_KEY_BITS).unwrap();
        assert_eq!(first.key_id(), second.key_id());
        assert!(key_dir.join(PUBLIC_KEY_FILE).exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let private_mode = fs::metadata(key_dir.join(PRIVATE_KEY_FILE)).unwrap().permissions().mode();
            let public_mode = fs::metadata(key_dir.join(PUBLIC_KEY_FILE)).unwrap().permissions().mode();
            assert_eq!(private_mode & 0o777, 0o600);
            assert_eq!(public_mode & 0o777, 0o644);
        }
    }
}

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose, Engine as _};
use sha2::Sha256;

use super::CredentialError;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// Ciphertext and nonce, both base64
#[derive(Debug, Clone, PartialEq)]
pub struct SealedSecret {
    pub ciphertext: String,
    pub nonce: String,
}

/// PBKDF2-HMAC-SHA256 into a 32-byte AES key
pub(crate) fn derive_key(password: &[u8], salt: &[u8], iterations: u32) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, iterations.max(1), &mut key);
    key
}

/// AES-256-GCM with a key derived from the master secret. The master
/// secret itself is not retained.
pub struct CredentialCipher {
    cipher: Aes256Gcm,
}

impl CredentialCipher {
    pub fn from_master_secret(master_secret: &str, salt: &str, iterations: u32) -> Result<Self, CredentialError> {
        if master_secret.is_empty() {
            return Err(CredentialError::MissingMasterSecret);
        }
        let key_bytes = derive_key(master_secret.as_bytes(), salt.as_bytes(), iterations);
        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    pub fn seal(&self, plaintext: &str) -> Result<SealedSecret, CredentialError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng); // 96-bits; unique per message
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|err| CredentialError::Crypto(format!("encrypt: {:?}", err)))?;

        Ok(SealedSecret {
            ciphertext: general_purpose::STANDARD.encode(ciphertext),
            nonce: general_purpose::STANDARD.encode(nonce),
        })
    }

    pub fn open(&self, ciphertext_b64: &str, nonce_b64: &str) -> Result<String, CredentialError> {
        let ciphertext = general_purpose::STANDARD
            .decode(ciphertext_b64)
            .map_err(|err| CredentialError::Crypto(format!("b64 ciphertext: {}", err)))?;
        let nonce = general_purpose::STANDARD
            .decode(nonce_b64)
            .map_err(|err| CredentialError::Crypto(format!("b64 nonce: {}", err)))?;
        if nonce.len() != NONCE_LEN {
            return Err(CredentialError::Crypto(format!(
                "nonce must be {} bytes, got {}",
                NONCE_LEN,
                nonce.len()
            )));
        }

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
            .map_err(|err| CredentialError::Crypto(format!("decrypt: {:?}", err)))?;

        String::from_utf8(plaintext).map_err(|err| CredentialError::Crypto(format!("utf8: {}", err)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pbkdf2_matches_known_vectors() {
        assert_eq!(
            hex::encode(derive_key(b"password", b"salt", 1)),
            "120fb6cffcf8b32c43e7225256c4f837a86548c92ccc35480805987cb70be17b"
        );
        assert_eq!(
            hex::encode(derive_key(b"password", b"salt", 4096)),
            "c5e478d59288c841aa530db6845c4c8d962893a001ce4e11a4963873aa98134a"
        );
    }

    #[test]
    fn sealed_secret_opens_with_same_master() {
        let cipher = CredentialCipher::from_master_secret("master", "salt", 10).unwrap();
        let sealed = cipher.seal("r8_secret").unwrap();
        assert_ne!(sealed.ciphertext, "r8_secret");
        assert_eq!(cipher.open(&sealed.ciphertext, &sealed.nonce).unwrap(), "r8_secret");
    }

    #[test]
    fn nonces_are_unique_per_seal() {
        let cipher = CredentialCipher::from_master_secret("master", "salt", 10).unwrap();
        let a = cipher.seal("same").unwrap();
        let b = cipher.seal("same").unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn wrong_master_or_tampering_fails() {
        let cipher = CredentialCipher::from_master_secret("master", "salt", 10).unwrap();
        let other = CredentialCipher::from_master_secret("other", "salt", 10).unwrap();
        let sealed = cipher.seal("r8_secret").unwrap();
        assert!(other.open(&sealed.ciphertext, &sealed.nonce).is_err());

        let mut bytes = general_purpose::STANDARD.decode(&sealed.ciphertext).unwrap();
        bytes[0] ^= 0x01;
        let tampered = general_purpose::STANDARD.encode(bytes);
        assert!(cipher.open(&tampered, &sealed.nonce).is_err());
        assert!(cipher.open(&sealed.ciphertext, "c2hvcnQ=").is_err());
    }

    #[test]
    fn empty_master_is_rejected() {
        assert!(matches!(
            CredentialCipher::from_master_secret("", "salt", 10),
            Err(CredentialError::MissingMasterSecret)
        ));
    }
}

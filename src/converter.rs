//! Byte transforms between the plain form of a chunk and its storage form.
//!
//! Converters are stacked: `to_storage` applies layers left to right,
//! `from_storage` right to left. The concatenated extension strings name
//! the on-disk file suffix of a chunk stored through the stack.

use aes::cipher::{KeyIvInit, StreamCipher};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::Aes256Gcm;
use chacha20poly1305::XChaCha20Poly1305;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::Error;

type Aes256CtrCipher = ctr::Ctr128BE<aes::Aes256>;

const AES_CTR_IV_LEN: usize = 16;
const AES_GCM_NONCE_LEN: usize = 12;
const XCHACHA_NONCE_LEN: usize = 24;

/// Key for the encryption layers, derived from a passphrase.
///
/// The tag (first 4 bytes of SHA-256 of the key, hex) goes into the file
/// extension so stores with different keys do not mix.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey {
    key: [u8; 32],
    tag: String,
}

impl EncryptionKey {
    pub fn from_passphrase(passphrase: &str) -> Self {
        let key: [u8; 32] = Sha256::digest(passphrase.as_bytes()).into();
        let tag = Sha256::digest(key)[..4]
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect();
        Self { key, tag }
    }
    pub fn tag(&self) -> &str {
        &self.tag
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EncryptionKey({})", self.tag)
    }
}

/// A single storage transform layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Converter {
    Zstd { level: i32 },
    Aes256Ctr { key: EncryptionKey },
    Aes256Gcm { key: EncryptionKey },
    XChaCha20Poly1305 { key: EncryptionKey },
}

impl Converter {
    pub fn zstd() -> Self {
        Converter::Zstd {
            level: zstd::DEFAULT_COMPRESSION_LEVEL,
        }
    }

    pub fn to_storage(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
        match self {
            Converter::Zstd { level } => Ok(zstd::stream::encode_all(data, *level)?),
            Converter::Aes256Ctr { key } => {
                let mut out = vec![0u8; AES_CTR_IV_LEN + data.len()];
                rand::thread_rng().fill_bytes(&mut out[..AES_CTR_IV_LEN]);
                let iv: [u8; AES_CTR_IV_LEN] = out[..AES_CTR_IV_LEN].try_into().unwrap();
                out[AES_CTR_IV_LEN..].copy_from_slice(data);
                let mut cipher = Aes256CtrCipher::new(&key.key.into(), &iv.into());
                cipher.apply_keystream(&mut out[AES_CTR_IV_LEN..]);
                Ok(out)
            }
            Converter::Aes256Gcm { key } => {
                let cipher = Aes256Gcm::new(&key.key.into());
                let mut nonce = [0u8; AES_GCM_NONCE_LEN];
                rand::thread_rng().fill_bytes(&mut nonce);
                let ct = cipher
                    .encrypt(&nonce.into(), data)
                    .map_err(|_| Error::invalid_format("chunk encryption failed"))?;
                let mut out = Vec::with_capacity(AES_GCM_NONCE_LEN + ct.len());
                out.extend_from_slice(&nonce);
                out.extend_from_slice(&ct);
                Ok(out)
            }
            Converter::XChaCha20Poly1305 { key } => {
                let cipher = XChaCha20Poly1305::new(&key.key.into());
                let mut nonce = [0u8; XCHACHA_NONCE_LEN];
                rand::thread_rng().fill_bytes(&mut nonce);
                let ct = cipher
                    .encrypt(&nonce.into(), data)
                    .map_err(|_| Error::invalid_format("chunk encryption failed"))?;
                let mut out = Vec::with_capacity(XCHACHA_NONCE_LEN + ct.len());
                out.extend_from_slice(&nonce);
                out.extend_from_slice(&ct);
                Ok(out)
            }
        }
    }

    pub fn from_storage(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
        match self {
            Converter::Zstd { .. } => Ok(zstd::stream::decode_all(data)?),
            Converter::Aes256Ctr { key } => {
                if data.len() < AES_CTR_IV_LEN {
                    return Err(Error::invalid_format("truncated aes-256-ctr chunk"));
                }
                let iv: [u8; AES_CTR_IV_LEN] = data[..AES_CTR_IV_LEN].try_into().unwrap();
                let mut out = data[AES_CTR_IV_LEN..].to_vec();
                let mut cipher = Aes256CtrCipher::new(&key.key.into(), &iv.into());
                cipher.apply_keystream(&mut out);
                Ok(out)
            }
            Converter::Aes256Gcm { key } => {
                if data.len() < AES_GCM_NONCE_LEN {
                    return Err(Error::invalid_format("truncated aes-256-gcm chunk"));
                }
                let nonce: [u8; AES_GCM_NONCE_LEN] = data[..AES_GCM_NONCE_LEN].try_into().unwrap();
                let cipher = Aes256Gcm::new(&key.key.into());
                cipher
                    .decrypt(&nonce.into(), &data[AES_GCM_NONCE_LEN..])
                    .map_err(|_| Error::invalid_format("chunk decryption failed"))
            }
            Converter::XChaCha20Poly1305 { key } => {
                if data.len() < XCHACHA_NONCE_LEN {
                    return Err(Error::invalid_format("truncated xchacha20-poly1305 chunk"));
                }
                let nonce: [u8; XCHACHA_NONCE_LEN] = data[..XCHACHA_NONCE_LEN].try_into().unwrap();
                let cipher = XChaCha20Poly1305::new(&key.key.into());
                cipher
                    .decrypt(&nonce.into(), &data[XCHACHA_NONCE_LEN..])
                    .map_err(|_| Error::invalid_format("chunk decryption failed"))
            }
        }
    }

    /// File name suffix contributed by this layer.
    pub fn extension(&self) -> String {
        match self {
            Converter::Zstd { .. } => ".cacnk".to_string(),
            Converter::Aes256Ctr { key } => format!(".aes-256-ctr-{}", key.tag),
            Converter::Aes256Gcm { key } => format!(".aes-256-gcm-{}", key.tag),
            Converter::XChaCha20Poly1305 { key } => format!(".xchacha20-poly1305-{}", key.tag),
        }
    }
}

/// Ordered stack of converter layers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Converters(Vec<Converter>);

impl Converters {
    pub fn new(layers: Vec<Converter>) -> Self {
        Self(layers)
    }
    /// Plain zstd storage, the default for local and remote stores.
    pub fn compressed() -> Self {
        Self(vec![Converter::zstd()])
    }
    /// Chunks stored as their plain bytes.
    pub fn none() -> Self {
        Self(Vec::new())
    }
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
    pub fn layers(&self) -> &[Converter] {
        &self.0
    }

    pub fn to_storage(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
        let mut out = data.to_vec();
        for layer in &self.0 {
            out = layer.to_storage(&out)?;
        }
        Ok(out)
    }

    pub fn from_storage(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
        let mut out = data.to_vec();
        for layer in self.0.iter().rev() {
            out = layer.from_storage(&out)?;
        }
        Ok(out)
    }

    pub fn extension(&self) -> String {
        self.0.iter().map(|layer| layer.extension()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        let mut data = b"some not very compressible text".to_vec();
        data.extend_from_slice(&[0u8; 512]);
        data
    }

    #[test]
    fn every_layer_inverts() {
        let key = EncryptionKey::from_passphrase("secret");
        let layers = [
            Converter::zstd(),
            Converter::Aes256Ctr { key: key.clone() },
            Converter::Aes256Gcm { key: key.clone() },
            Converter::XChaCha20Poly1305 { key },
        ];
        let data = sample();
        for layer in layers {
            let storage = layer.to_storage(&data).unwrap();
            assert_eq!(layer.from_storage(&storage).unwrap(), data, "{:?}", layer);
        }
    }

    #[test]
    fn stacked_layers_invert() {
        let key = EncryptionKey::from_passphrase("secret");
        let stack = Converters::new(vec![Converter::zstd(), Converter::Aes256Gcm { key }]);
        let data = sample();
        let storage = stack.to_storage(&data).unwrap();
        assert_ne!(storage, data);
        assert_eq!(stack.from_storage(&storage).unwrap(), data);
    }

    #[test]
    fn extensions_concatenate() {
        let key = EncryptionKey::from_passphrase("secret");
        assert_eq!(key.tag().len(), 8);
        let stack = Converters::new(vec![
            Converter::zstd(),
            Converter::Aes256Ctr { key: key.clone() },
        ]);
        assert_eq!(stack.extension(), format!(".cacnk.aes-256-ctr-{}", key.tag()));
        assert_eq!(Converters::none().extension(), "");
    }

    #[test]
    fn wrong_key_fails_authenticated_decryption() {
        let good = EncryptionKey::from_passphrase("secret");
        let bad = EncryptionKey::from_passphrase("other");
        let data = sample();
        let storage = Converter::Aes256Gcm { key: good }.to_storage(&data).unwrap();
        assert!(Converter::Aes256Gcm { key: bad }.from_storage(&storage).is_err());
    }
}

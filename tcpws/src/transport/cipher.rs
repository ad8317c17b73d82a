//! Encrypt-then-MAC envelope: AES-256-CBC with PKCS7 padding, authenticated by
//! HMAC-SHA256 over `IV ‖ ciphertext`.
//!
//! Sealed layout: `[iv length = 16][IV][ciphertext][tag (32)]`.

use std::fmt;

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use bytes::{BufMut, Bytes, BytesMut};
use hmac::{Hmac, Mac};
use rand::{CryptoRng, RngCore};
use sha2::Sha256;

use super::packet::{DecodeError, EncodeError};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 16;
pub const TAG_LEN: usize = 32;
const BLOCK_LEN: usize = 16;

/// Smallest sealed envelope: length byte, IV, one cipher block, tag.
pub const MIN_SEALED_LEN: usize = 1 + IV_LEN + BLOCK_LEN + TAG_LEN;

/// 256-bit symmetric key shared by both ends of one session.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey([u8; KEY_LEN]);

impl SessionKey {
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut key = [0u8; KEY_LEN];
        rng.fill_bytes(&mut key);
        Self(key)
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl TryFrom<&[u8]> for SessionKey {
    type Error = usize;

    /// Fails with the offending length.
    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        <[u8; KEY_LEN]>::try_from(value)
            .map(Self)
            .map_err(|_| value.len())
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

pub fn seal<R: RngCore + CryptoRng>(
    key: &SessionKey,
    plaintext: &[u8],
    rng: &mut R,
) -> Result<Bytes, EncodeError> {
    let mut iv = [0u8; IV_LEN];
    rng.fill_bytes(&mut iv);

    let ciphertext = Aes256CbcEnc::new_from_slices(key.as_bytes(), &iv)
        .map_err(|_| EncodeError::Cipher)?
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut mac = HmacSha256::new_from_slice(key.as_bytes()).map_err(|_| EncodeError::Cipher)?;
    mac.update(&iv);
    mac.update(&ciphertext);
    let tag = mac.finalize().into_bytes();

    let mut out = BytesMut::with_capacity(1 + IV_LEN + ciphertext.len() + TAG_LEN);
    out.put_u8(IV_LEN as u8);
    out.put_slice(&iv);
    out.put_slice(&ciphertext);
    out.put_slice(&tag);
    Ok(out.freeze())
}

/// Verifies the tag and only then decrypts.
pub fn open(key: &SessionKey, sealed: &[u8]) -> Result<Vec<u8>, DecodeError> {
    if sealed.len() < MIN_SEALED_LEN {
        return Err(DecodeError::TooShort {
            len: sealed.len(),
            min: MIN_SEALED_LEN,
        });
    }
    let iv_len = sealed[0];
    if usize::from(iv_len) != IV_LEN {
        return Err(DecodeError::InvalidIvLength(iv_len));
    }

    let (body, tag) = sealed[1..].split_at(sealed.len() - 1 - TAG_LEN);
    let (iv, ciphertext) = body.split_at(IV_LEN);
    if ciphertext.is_empty() || ciphertext.len() % BLOCK_LEN != 0 {
        return Err(DecodeError::InvalidCiphertext);
    }

    let mut mac = HmacSha256::new_from_slice(key.as_bytes())
        .map_err(|_| DecodeError::AuthenticationFailure)?;
    mac.update(iv);
    mac.update(ciphertext);
    mac.verify_slice(tag)
        .map_err(|_| DecodeError::AuthenticationFailure)?;

    Aes256CbcDec::new_from_slices(key.as_bytes(), iv)
        .map_err(|_| DecodeError::InvalidIvLength(iv_len))?
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| DecodeError::BadPadding)
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;

    fn key() -> SessionKey {
        SessionKey::from_bytes([0x42; KEY_LEN])
    }

    #[test]
    fn test_seal_open() {
        let mut rng = StdRng::seed_from_u64(1);
        let sealed = seal(&key(), b"hello tunnel", &mut rng).unwrap();
        assert_eq!(sealed[0] as usize, IV_LEN);
        // 12 bytes pad up to one block
        assert_eq!(sealed.len(), 1 + IV_LEN + 16 + TAG_LEN);
        assert_eq!(open(&key(), &sealed).unwrap(), b"hello tunnel");
    }

    #[test]
    fn test_fresh_iv_per_message() {
        let mut rng = StdRng::seed_from_u64(2);
        let a = seal(&key(), b"same", &mut rng).unwrap();
        let b = seal(&key(), b"same", &mut rng).unwrap();
        assert_ne!(a[1..1 + IV_LEN], b[1..1 + IV_LEN]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_fails_authentication() {
        let mut rng = StdRng::seed_from_u64(3);
        let sealed = seal(&key(), b"secret", &mut rng).unwrap();
        let other = SessionKey::from_bytes([0x24; KEY_LEN]);
        assert_eq!(open(&other, &sealed), Err(DecodeError::AuthenticationFailure));
    }

    #[test]
    fn test_tampered_ciphertext_is_not_decrypted() {
        let mut rng = StdRng::seed_from_u64(4);
        let sealed = seal(&key(), &[9u8; 40], &mut rng).unwrap();
        let mut tampered = sealed.to_vec();
        tampered[1 + IV_LEN] ^= 0x01;
        assert_eq!(open(&key(), &tampered), Err(DecodeError::AuthenticationFailure));
    }

    #[test]
    fn test_structural_errors() {
        let mut rng = StdRng::seed_from_u64(5);
        let sealed = seal(&key(), b"abc", &mut rng).unwrap();

        let mut bad_iv = sealed.to_vec();
        bad_iv[0] = 12;
        assert_eq!(open(&key(), &bad_iv), Err(DecodeError::InvalidIvLength(12)));

        let mut misaligned = sealed.to_vec();
        misaligned.insert(1 + IV_LEN, 0);
        assert_eq!(open(&key(), &misaligned), Err(DecodeError::InvalidCiphertext));

        assert!(matches!(
            open(&key(), &sealed[..MIN_SEALED_LEN - 1]),
            Err(DecodeError::TooShort { .. })
        ));
    }

    #[test]
    fn test_key_length_is_checked() {
        assert_eq!(SessionKey::try_from(&[0u8; 16][..]), Err(16));
        assert!(SessionKey::try_from(&[0u8; 32][..]).is_ok());
    }
}

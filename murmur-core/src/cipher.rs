//! Private message bodies: AES-128-CBC with PKCS#7 padding under the pairwise key.
//!
//! Known weakness: the IV is fixed (all zeroes), so equal plaintexts under the same key
//! produce equal ciphertexts, and there is no authentication tag.

use aes::Aes128;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};

use crate::dh::SharedKey;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

pub const FIXED_IV: [u8; 16] = [0u8; 16];

pub fn encrypt(key: &SharedKey, plaintext: &[u8]) -> Vec<u8> {
    Aes128CbcEnc::new(&(*key.as_bytes()).into(), &FIXED_IV.into())
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

pub fn decrypt(key: &SharedKey, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
    if ciphertext.is_empty() || ciphertext.len() % 16 != 0 {
        return Err(CipherError::BlockLength(ciphertext.len()));
    }
    Aes128CbcDec::new(&(*key.as_bytes()).into(), &FIXED_IV.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CipherError::Padding)
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CipherError {
    #[error("ciphertext length {0} is not a positive multiple of the block size")]
    BlockLength(usize),
    #[error("invalid padding (wrong key or corrupted ciphertext)")]
    Padding,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = SharedKey::render(42);
        let plain = b"hello murmur";
        let cipher = encrypt(&key, plain);
        assert_eq!(cipher.len(), 16);
        assert_eq!(decrypt(&key, &cipher).unwrap(), plain);
    }

    #[test]
    fn empty_plaintext_pads_to_one_block() {
        let key = SharedKey::render(3);
        let cipher = encrypt(&key, b"");
        assert_eq!(cipher.len(), 16);
        assert!(decrypt(&key, &cipher).unwrap().is_empty());
    }

    #[test]
    fn fixed_iv_makes_encryption_deterministic() {
        // Documented limitation, asserted here so a change of IV policy is deliberate.
        let key = SharedKey::render(11);
        assert_eq!(encrypt(&key, b"same"), encrypt(&key, b"same"));
    }

    #[test]
    fn bad_length_rejected() {
        let key = SharedKey::render(11);
        assert_eq!(decrypt(&key, &[1, 2, 3]), Err(CipherError::BlockLength(3)));
        assert_eq!(decrypt(&key, &[]), Err(CipherError::BlockLength(0)));
    }

    #[test]
    fn wrong_key_does_not_return_plaintext() {
        let cipher = encrypt(&SharedKey::render(12), b"top secret text!!");
        let other = decrypt(&SharedKey::render(13), &cipher);
        assert_ne!(other.ok().as_deref(), Some(&b"top secret text!!"[..]));
    }
}

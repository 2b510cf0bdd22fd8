//! Transparent encryption envelope for the on-disk file.
//!
//! Current format: `<16-byte random IV> ':' <AES-256-CBC ciphertext>`,
//! with the 32-byte key derived from the passphrase and the IV via
//! PBKDF2-HMAC-SHA512 (10 000 rounds). A legacy no-IV format (key and IV
//! derived from the passphrase alone, OpenSSL `EVP_BytesToKey` style with
//! MD5) is still readable but never written.
//!
//! Decryption is best-effort: a wrong key or mangled envelope hands the
//! original bytes back unchanged, and the document layer then takes the
//! corrupt-config path. Availability wins over a hard crypto error here
//! because a key mismatch is usually user error.

use aes::Aes256;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use md5::{Digest, Md5};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha512;
use zeroize::Zeroize;

use crate::constants::{ENVELOPE_IV_LEN, ENVELOPE_KDF_ROUNDS, ENVELOPE_SEPARATOR};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Encrypt `plaintext` into the current envelope format.
#[must_use]
pub fn encrypt(plaintext: &[u8], passphrase: &str) -> Vec<u8> {
    let mut iv = [0u8; ENVELOPE_IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);
    let mut key = derive_key(passphrase, &iv);

    // new_from_slices only fails on length mismatch; both are fixed-size.
    let ciphertext = Aes256CbcEnc::new_from_slices(&key, &iv)
        .map(|cipher| cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
        .unwrap_or_default();
    key.zeroize();

    let mut out = Vec::with_capacity(ENVELOPE_IV_LEN + 1 + ciphertext.len());
    out.extend_from_slice(&iv);
    out.push(ENVELOPE_SEPARATOR);
    out.extend_from_slice(&ciphertext);
    out
}

/// Decrypt either envelope format; on any failure, return the input
/// unchanged.
#[must_use]
pub fn decrypt(bytes: &[u8], passphrase: &str) -> Vec<u8> {
    try_decrypt(bytes, passphrase).unwrap_or_else(|| bytes.to_vec())
}

/// True when `bytes` carry the current explicit-IV envelope.
#[must_use]
pub fn has_envelope(bytes: &[u8]) -> bool {
    bytes.len() > ENVELOPE_IV_LEN && bytes[ENVELOPE_IV_LEN] == ENVELOPE_SEPARATOR
}

fn try_decrypt(bytes: &[u8], passphrase: &str) -> Option<Vec<u8>> {
    if has_envelope(bytes) {
        let iv = &bytes[..ENVELOPE_IV_LEN];
        let ciphertext = &bytes[ENVELOPE_IV_LEN + 1..];
        let mut key = derive_key(passphrase, iv);
        let plaintext = Aes256CbcDec::new_from_slices(&key, iv)
            .ok()?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .ok();
        key.zeroize();
        plaintext
    } else {
        legacy_decrypt(bytes, passphrase)
    }
}

fn derive_key(passphrase: &str, iv: &[u8]) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha512>(passphrase.as_bytes(), iv, ENVELOPE_KDF_ROUNDS, &mut key);
    key
}

/// Legacy single-pass decipher: key and IV both come from iterated MD5
/// over the passphrase (no salt), matching what the pre-envelope format
/// was written with.
fn legacy_decrypt(bytes: &[u8], passphrase: &str) -> Option<Vec<u8>> {
    let mut material = Vec::with_capacity(48);
    let mut previous: Vec<u8> = Vec::new();
    while material.len() < 48 {
        let mut hasher = Md5::new();
        hasher.update(&previous);
        hasher.update(passphrase.as_bytes());
        previous = hasher.finalize().to_vec();
        material.extend_from_slice(&previous);
    }
    let (key, iv) = material.split_at(32);
    let plaintext = Aes256CbcDec::new_from_slices(key, &iv[..ENVELOPE_IV_LEN])
        .ok()?
        .decrypt_padded_vec_mut::<Pkcs7>(bytes)
        .ok();
    material.zeroize();
    plaintext
}

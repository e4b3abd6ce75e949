//! Setup-URL key derivation and armored payload decryption.

use std::io::Read;
use std::str::FromStr;

use age::armor::ArmoredReader;
use age::x25519;
use age::Decryptor;
use url::Url;

use crate::error::{CryptoError, CryptoResult};

/// Prefix of a full age secret key string.
pub const SECRET_KEY_PREFIX: &str = "AGE-SECRET-KEY-";

/// Extracts and normalizes the full age secret key from a setup URL.
///
/// The fragment carries the bech32 key body; the stored form is the
/// uppercased fragment with the standard prefix. Returns `None` when the
/// URL is unparseable or has no usable fragment.
pub fn secret_key_from_setup_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url.trim()).ok()?;
    let fragment = parsed.fragment()?.trim();
    if fragment.is_empty() {
        return None;
    }
    Some(format!("{SECRET_KEY_PREFIX}{}", fragment.to_uppercase()))
}

/// Builds an X25519 identity from a stored full age secret key string.
///
/// Returns `None` for blank input, a missing prefix, or undecodable key
/// material; the caller treats an absent identity on an encrypted feed as
/// a terminal condition.
pub fn identity_from_secret_key(secret_key: Option<&str>) -> Option<x25519::Identity> {
    let sk = secret_key?.trim();
    if sk.is_empty() || !sk.starts_with(SECRET_KEY_PREFIX) {
        return None;
    }
    x25519::Identity::from_str(sk).ok()
}

/// Decrypts an ASCII-armored age payload to UTF-8 plaintext.
pub fn decrypt_armored(armored: &str, identity: &x25519::Identity) -> CryptoResult<String> {
    let decryptor = Decryptor::new(ArmoredReader::new(armored.as_bytes()))
        .map_err(|e| CryptoError::Decrypt(e.to_string()))?;

    let mut reader = decryptor
        .decrypt(std::iter::once(identity as &dyn age::Identity))
        .map_err(|e| CryptoError::Decrypt(e.to_string()))?;

    let mut plaintext = Vec::new();
    reader
        .read_to_end(&mut plaintext)
        .map_err(|e| CryptoError::Decrypt(e.to_string()))?;

    String::from_utf8(plaintext).map_err(|_| CryptoError::InvalidUtf8)
}

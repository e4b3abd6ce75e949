//! age key handling and payload decryption for wg-feed.
//!
//! Encrypted feeds carry their document as an ASCII-armored age payload.
//! The decryption key never travels with the feed: it is derived once from
//! the fragment of the subscription's setup URL and persisted as a full
//! age secret key string. The setup URL itself is never persisted.

mod error;
mod keys;

pub use error::{CryptoError, CryptoResult};
pub use keys::{
    decrypt_armored, identity_from_secret_key, secret_key_from_setup_url, SECRET_KEY_PREFIX,
};

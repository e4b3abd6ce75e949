use std::io::Write;

use age::armor::{ArmoredWriter, Format};
use age::secrecy::ExposeSecret;
use age::x25519;
use age::Encryptor;
use pretty_assertions::assert_eq;
use wgfeed_crypto::{
    decrypt_armored, identity_from_secret_key, secret_key_from_setup_url, SECRET_KEY_PREFIX,
};

fn encrypt_armored_for(plaintext: &str, recipient: &x25519::Recipient) -> String {
    let encryptor = Encryptor::with_recipients(std::iter::once(recipient as &dyn age::Recipient))
        .expect("at least one recipient");
    let mut out = Vec::new();
    let armor = ArmoredWriter::wrap_output(&mut out, Format::AsciiArmor).unwrap();
    let mut writer = encryptor.wrap_output(armor).unwrap();
    writer.write_all(plaintext.as_bytes()).unwrap();
    writer.finish().unwrap().finish().unwrap();
    String::from_utf8(out).unwrap()
}

// ── Setup-URL key derivation ────────────────────────────────────

#[test]
fn secret_key_derived_from_fragment() {
    let key = secret_key_from_setup_url("https://feed.example/v1#1qyqszqgpqyqszqgpqyqszqgp");
    assert_eq!(
        key.as_deref(),
        Some("AGE-SECRET-KEY-1QYQSZQGPQYQSZQGPQYQSZQGP")
    );
}

#[test]
fn secret_key_fragment_is_uppercased() {
    let key = secret_key_from_setup_url("https://feed.example/v1#1AbCdEf").unwrap();
    assert_eq!(key, format!("{SECRET_KEY_PREFIX}1ABCDEF"));
}

#[test]
fn no_fragment_yields_no_key() {
    assert_eq!(secret_key_from_setup_url("https://feed.example/v1"), None);
}

#[test]
fn blank_fragment_yields_no_key() {
    assert_eq!(secret_key_from_setup_url("https://feed.example/v1#"), None);
    assert_eq!(secret_key_from_setup_url("https://feed.example/v1#  "), None);
}

#[test]
fn unparseable_url_yields_no_key() {
    assert_eq!(secret_key_from_setup_url("::not a url::"), None);
}

// ── Identity parsing ────────────────────────────────────────────

#[test]
fn identity_from_missing_or_blank_key_is_none() {
    assert!(identity_from_secret_key(None).is_none());
    assert!(identity_from_secret_key(Some("")).is_none());
    assert!(identity_from_secret_key(Some("   ")).is_none());
}

#[test]
fn identity_requires_prefix() {
    assert!(identity_from_secret_key(Some("1QYQSZQGPQYQSZQGP")).is_none());
}

#[test]
fn identity_rejects_undecodable_key_material() {
    assert!(identity_from_secret_key(Some("AGE-SECRET-KEY-NOTVALID")).is_none());
}

#[test]
fn identity_parses_generated_key() {
    let identity = x25519::Identity::generate();
    let secret = identity.to_string().expose_secret().to_string();
    assert!(secret.starts_with(SECRET_KEY_PREFIX));
    assert!(identity_from_secret_key(Some(&secret)).is_some());
}

#[test]
fn setup_url_round_trips_generated_key() {
    let identity = x25519::Identity::generate();
    let secret = identity.to_string().expose_secret().to_string();
    let fragment = secret
        .strip_prefix(SECRET_KEY_PREFIX)
        .unwrap()
        .to_lowercase();

    let url = format!("https://feed.example/v1#{fragment}");
    let derived = secret_key_from_setup_url(&url).unwrap();
    assert_eq!(derived, secret);
    assert!(identity_from_secret_key(Some(&derived)).is_some());
}

// ── Decryption ──────────────────────────────────────────────────

#[test]
fn decrypt_armored_round_trip() {
    let identity = x25519::Identity::generate();
    let armored = encrypt_armored_for("{\"hello\":\"world\"}", &identity.to_public());

    let plaintext = decrypt_armored(&armored, &identity).unwrap();
    assert_eq!(plaintext, "{\"hello\":\"world\"}");
}

#[test]
fn decrypt_with_wrong_identity_fails() {
    let right = x25519::Identity::generate();
    let wrong = x25519::Identity::generate();
    let armored = encrypt_armored_for("secret", &right.to_public());

    assert!(decrypt_armored(&armored, &wrong).is_err());
}

#[test]
fn decrypt_malformed_armor_fails() {
    let identity = x25519::Identity::generate();
    assert!(decrypt_armored("not an age payload", &identity).is_err());
}

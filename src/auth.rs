//! Authentication: HTTP Basic credential storage/verification and mTLS
//! client-certificate identity extraction.
//!
//! Password comparisons run in constant time, including on the
//! account-miss path, so an attacker probing usernames cannot distinguish
//! "wrong password" from "no such user" by timing.

use std::collections::HashMap;

use rand::RngCore;
use ring::constant_time;
use sha2::{Digest, Sha256};
use tracing::warn;

/// A loaded user database: username -> SHA-256 digest of the password.
#[derive(Default, Clone)]
pub struct UserStore {
    users: HashMap<String, [u8; 32]>,
}

/// A digest used to compare against on the account-miss path, so that
/// verifying a nonexistent user costs the same time as a real one.
fn dummy_digest() -> [u8; 32] {
    Sha256::digest(b"masquetun-constant-time-dummy").into()
}

impl UserStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a user. `secret` is either a 64-character hex SHA-256 digest
    /// (as written by [`write_config`]-style persisted configs) or a plain
    /// password, hashed on load either way.
    pub fn add_user(&mut self, username: impl Into<String>, secret: &str) {
        let digest = parse_secret(secret);
        self.users.insert(username.into(), digest);
    }

    /// Verify `username`/`password` in constant time regardless of
    /// whether `username` exists.
    pub fn verify(&self, username: &str, password: &str) -> bool {
        let expected = self.users.get(username).copied().unwrap_or_else(dummy_digest);
        let supplied: [u8; 32] = Sha256::digest(password.as_bytes()).into();
        let ok = constant_time::verify_slices_equal(&supplied, &expected).is_ok();
        // A miss must fail even if the dummy digest happens to match
        // (astronomically unlikely, but the check must not rely on luck).
        ok && self.users.contains_key(username)
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn usernames(&self) -> impl Iterator<Item = &str> {
        self.users.keys().map(String::as_str)
    }
}

fn parse_secret(secret: &str) -> [u8; 32] {
    if secret.len() == 64 {
        if let Ok(bytes) = hex::decode(secret) {
            if let Ok(digest) = <[u8; 32]>::try_from(bytes.as_slice()) {
                return digest;
            }
        }
    }
    Sha256::digest(secret.as_bytes()).into()
}

/// Generate a random demo password (hex-encoded, printed to the operator
/// once at first run) for the bootstrap "demo" account.
pub fn generate_demo_password() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Extract the first `emailAddress` attribute out of an mTLS client
/// certificate's subject, used as the connecting peer's identity when no
/// HTTP Basic credentials are presented.
pub fn email_from_subject(subject_der: &[u8]) -> Option<String> {
    // emailAddress OID 1.2.840.113549.1.9.1, encoded as a DER OID followed
    // by a UTF8String/IA5String value; we scan for the OID bytes and take
    // the following length-prefixed string rather than pulling in a full
    // X.509 name parser for one attribute.
    const EMAIL_OID: [u8; 9] = [0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x09, 0x01];
    let pos = subject_der
        .windows(EMAIL_OID.len())
        .position(|w| w == EMAIL_OID)?;
    let tag_pos = pos + EMAIL_OID.len();
    let tag = *subject_der.get(tag_pos)?;
    if tag != 0x0c && tag != 0x16 {
        warn!(tag, "unexpected ASN.1 tag following emailAddress OID");
        return None;
    }
    let len = *subject_der.get(tag_pos + 1)? as usize;
    let value = subject_der.get(tag_pos + 2..tag_pos + 2 + len)?;
    std::str::from_utf8(value).ok().map(str::to_owned)
}

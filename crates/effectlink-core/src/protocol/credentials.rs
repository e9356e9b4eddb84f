//! Password digest used by the LOGIN handshake.
//!
//! Passwords never travel in clear text: both sides configure (or derive) the
//! lowercase hex SHA-512 of the UTF-8 password, and the requester presents
//! that digest in the `message` field of its LOGIN request.

use sha2::{Digest, Sha512};

/// Returns `hex(SHA-512(utf8(password)))` in lowercase.
pub fn hash_password(password: &str) -> String {
    let digest = Sha512::digest(password.as_bytes());
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

/// Compares a configured digest with the one a peer presented.
///
/// Hex case is not significant; surrounding whitespace is ignored so digests
/// pasted into config files still match.
pub fn verify_password_hash(expected: &str, presented: &str) -> bool {
    expected.trim().eq_ignore_ascii_case(presented.trim())
}

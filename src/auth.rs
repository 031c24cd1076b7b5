//! Credential verification
//!
//! Stored hashes select their scheme by prefix: `$2...` bcrypt, `$argon2...`
//! argon2, `$6$...` SHA-512-crypt. Unknown prefixes never verify.

use argon2::password_hash::PasswordHash;
use argon2::{Argon2, PasswordVerifier};

pub fn verify_password(password: &str, hash: &str) -> bool {
    if hash.starts_with("$argon2") {
        return PasswordHash::new(hash)
            .map(|parsed| {
                Argon2::default()
                    .verify_password(password.as_bytes(), &parsed)
                    .is_ok()
            })
            .unwrap_or(false);
    }
    if hash.starts_with("$2") {
        return bcrypt::verify(password, hash).unwrap_or(false);
    }
    if hash.starts_with("$6$") {
        return sha_crypt::sha512_check(password, hash).is_ok();
    }
    false
}

pub fn hash_password(password: &str) -> Result<String, bcrypt::BcryptError> {
    bcrypt::hash(password, bcrypt::DEFAULT_COST)
}

/// Credentials carried by a SASL PLAIN exchange: `[authzid] \0 authcid \0 passwd`.
///
/// A bare password without NUL separators is accepted as well; some clients
/// send the simple form through the SASL envelope.
pub fn parse_sasl_plain(credentials: &[u8]) -> Option<(Option<String>, String)> {
    let text = std::str::from_utf8(credentials).ok()?;
    let mut parts = text.split('\0');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(_authzid), Some(authcid), Some(password), None) => {
            Some((Some(authcid.to_string()), password.to_string()))
        }
        (Some(password), None, None, None) => Some((None, password.to_string())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bcrypt_round_trip() {
        let hash = hash_password("password").expect("hash failed");
        assert!(hash.starts_with("$2"));
        assert!(verify_password("password", &hash));
        assert!(!verify_password("Password", &hash));
    }

    #[test]
    fn unknown_scheme_never_verifies() {
        assert!(!verify_password("password", "{SSHA}whatever"));
        assert!(!verify_password("password", ""));
    }

    #[test]
    fn sasl_plain_forms() {
        assert_eq!(
            parse_sasl_plain(b"\0user0\0password"),
            Some((Some("user0".to_string()), "password".to_string()))
        );
        assert_eq!(
            parse_sasl_plain(b"password"),
            Some((None, "password".to_string()))
        );
        assert_eq!(parse_sasl_plain(b"a\0b\0c\0d"), None);
    }
}

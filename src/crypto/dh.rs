//! Diffie-Hellman key agreement over hex-encoded big integers

use super::hash::ZbdHash;
use crate::{Error, Result};
use num_bigint::BigUint;
use num_traits::Zero;

/// Generator used when none is configured
pub const DEFAULT_GENERATOR: &str = "2";

/// Modulus used when none is configured
pub const DEFAULT_MODULUS: &str = concat!(
    "f488fd584e49dbcd20b49de49107366b336c380d451d0f7c88b31c7c5b2d8ef6",
    "f3c923c043f0a55b188d8ebb558cb85d38d334fd7c175743a31d186cde33212c",
    "b52aff3ce1b1294018118d7c84a70a72d686c40319c807297aca950cd9969fab",
    "d00a509b0246d3083d66a45d419f9c7cbd894b221926baaba25ec355e92f78c7",
);

/// Longest hex number accepted for a generator, modulus or key
pub const MAX_NUM_LENGTH: usize = 1024;

/// Lowercase and strip whitespace
pub fn canonical_hex(value: &str) -> String {
    value
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Canonical generator, substituting the default for an empty string
pub fn canonical_generator(generator: &str) -> String {
    match canonical_hex(generator) {
        g if g.is_empty() => DEFAULT_GENERATOR.to_string(),
        g => g,
    }
}

/// Canonical modulus, substituting the default for an empty string
pub fn canonical_modulus(modulus: &str) -> String {
    match canonical_hex(modulus) {
        m if m.is_empty() => DEFAULT_MODULUS.to_string(),
        m => m,
    }
}

/// Check that `value` is a hex number of acceptable length
///
/// Returns the canonical form. An empty string is allowed and means
/// "use the default".
pub fn validate_hex(what: &str, value: &str) -> Result<String> {
    let canonical = canonical_hex(value);

    if canonical.len() > MAX_NUM_LENGTH {
        return Err(Error::Parse(format!(
            "{} is longer than {} hex digits",
            what, MAX_NUM_LENGTH
        )));
    }
    if !canonical.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::Parse(format!("{} is not a hex number: '{}'", what, value)));
    }

    Ok(canonical)
}

fn parse_number(what: &str, value: &str) -> Result<BigUint> {
    let canonical = validate_hex(what, value)?;
    BigUint::parse_bytes(canonical.as_bytes(), 16)
        .ok_or_else(|| Error::Protocol(format!("{} is not a number: '{}'", what, value)))
}

/// `base ^ exponent mod modulus`, as lowercase hex without leading zeros
///
/// An empty modulus selects [`DEFAULT_MODULUS`].
pub fn diffie_hellman(base: &str, modulus: &str, exponent: &str) -> Result<String> {
    let base = parse_number("base", base)?;
    let modulus = parse_number("modulus", &canonical_modulus(modulus))?;
    let exponent = parse_number("exponent", exponent)?;

    if modulus.is_zero() {
        return Err(Error::Protocol("DH modulus is zero".to_string()));
    }

    Ok(base.modpow(&exponent, &modulus).to_str_radix(16))
}

/// Public key for `private_key`: `generator ^ private_key mod modulus`
pub fn public_key(generator: &str, modulus: &str, private_key: &str) -> Result<String> {
    diffie_hellman(&canonical_generator(generator), modulus, private_key)
}

/// Identity hash of a public key
///
/// The ZBD hash of the canonical generator, modulus and key, in that
/// order, hex encoded.
pub fn identity_hash(generator: &str, modulus: &str, key: &str) -> String {
    let generator = canonical_generator(generator);
    let modulus = canonical_modulus(modulus);
    let key = canonical_hex(key);

    hex::encode(ZbdHash::digest(&[
        generator.as_bytes(),
        modulus.as_bytes(),
        key.as_bytes(),
    ]))
}

/// Identity printed for a private key at key generation time
pub fn public_identity(generator: &str, modulus: &str, private_key: &str) -> Result<String> {
    let public = public_key(generator, modulus, private_key)?;
    Ok(identity_hash(generator, modulus, &public))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRIVATE: &str = "0123456789abcdef0123456789abcdef01234567";

    #[test]
    fn test_public_key_known_answer() {
        let public = public_key("", "", PRIVATE).unwrap();
        assert!(public.starts_with("162b85a8415827f5f3d47a68d31c6899"));
        assert!(public.ends_with("c7425373c41d64150c"));
        assert_eq!(public.len(), 256);
    }

    #[test]
    fn test_identity_known_answer() {
        assert_eq!(
            public_identity("", "", PRIVATE).unwrap(),
            "8036c208b6428a4f78c3d2234a8c0ea82131cd57"
        );
    }

    #[test]
    fn test_identity_canonicalization() {
        let public = public_key("", "", PRIVATE).unwrap();
        let shouty = format!("  {}\n", public.to_uppercase());

        assert_eq!(
            identity_hash("", "", &public),
            identity_hash("2", &DEFAULT_MODULUS.to_uppercase(), &shouty)
        );
    }

    #[test]
    fn test_shared_secret_agrees() {
        let a = "1f2e3d4c5b6a";
        let b = "99887766554433221100";

        let pub_a = public_key("", "", a).unwrap();
        let pub_b = public_key("", "", b).unwrap();

        assert_eq!(
            diffie_hellman(&pub_b, "", a).unwrap(),
            diffie_hellman(&pub_a, "", b).unwrap()
        );
    }

    #[test]
    fn test_small_group() {
        // 5^3 mod 23 = 10
        assert_eq!(diffie_hellman("5", "17", "3").unwrap(), "a");
    }

    #[test]
    fn test_validate_hex() {
        assert_eq!(validate_hex("generator", " A b ").unwrap(), "ab");
        assert_eq!(validate_hex("generator", "").unwrap(), "");
        assert!(validate_hex("generator", "xyz").is_err());
        assert!(validate_hex("modulus", &"f".repeat(MAX_NUM_LENGTH + 1)).is_err());
    }
}

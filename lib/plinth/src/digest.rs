use rand::random;
use sha2::{Digest, Sha512};

/// Combines a plaintext password and a salt into the hex digest that crosses
/// the network instead of the password itself.
///
/// Both peers must compute this identically: the client hashes the password
/// it was given with the salt the server sent, and the server compares the
/// received digest against the same computation over its stored credential.
pub fn digest(password: &str, salt: &str) -> String {
    let mut hasher = Sha512::new();
    hasher.update(password.as_bytes());
    hasher.update(salt.as_bytes());
    hex::encode(hasher.finalize())
}

/// Generates a login salt by digesting two independent pseudo-random values.
/// The result is 128 hex characters.
pub fn salt() -> String {
    digest(&random::<f64>().to_string(), &random::<f64>().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    // SHA-512 of the empty input.
    const EMPTY: &str = "cf83e1357eefb8bdf1542850d66d8007d620e4050b5715dc83f4a921d36ce9ce\
                         47d0d13c5d85f2b0ff8318d2877eec2f63b931bd47417a81a538327af927da3e";

    // SHA-512 of "abc".
    const ABC: &str = "ddaf35a193617abacc417349ae20413112e6fa4e89a97ea20a9eeee64b55d39a\
                       2192992a274fc1a836ba3c23a3feebbd454d4423643ce80e2a9ac94fa54ca49f";

    #[test]
    fn test_digest_known_vectors() {
        assert_eq!(digest("", ""), EMPTY);
        assert_eq!(digest("abc", ""), ABC);
    }

    #[test]
    fn test_digest_concatenates_password_and_salt() {
        assert_eq!(digest("a", "bc"), digest("ab", "c"));
        assert_eq!(digest("a", "bc"), ABC);
    }

    #[test]
    fn test_digest_is_hex_of_fixed_width() {
        let result = digest("pw", "ABC");
        assert_eq!(result.len(), 128);
        assert!(result.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(result, result.to_lowercase());
    }

    #[test]
    fn test_salt_is_unique_per_call() {
        let first = salt();
        let second = salt();
        assert_eq!(first.len(), 128);
        assert_ne!(first, second);
    }
}

// Cryptographic utilities

use anyhow::Result;
use base64::Engine;
use ring::rand::{SecureRandom, SystemRandom};
use sha2::{Digest, Sha256};

/// Alphabet for generated admin passwords (no quotes/backslashes so values survive any shell or
/// PHP string the application might embed them in).
const PASSWORD_ALPHABET: &[u8] =
    b"ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz23456789!#%+-=_";

/// Alphabet for long-lived secrets such as the credit-card encryption hash.
const SECRET_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// SHA-256 hex digest (lowercase).
pub fn sha256_hex(input: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// SHA-256 base64 digest (STANDARD).
pub fn sha256_base64(input: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input);
    let digest = hasher.finalize();
    base64::engine::general_purpose::STANDARD.encode(digest)
}

/// Compute a safe fingerprint for a secret (hash only; never store the raw secret).
pub fn secret_fingerprint(input: &str) -> String {
    sha256_base64(input.as_bytes())
}

fn random_from_alphabet(len: usize, alphabet: &[u8]) -> Result<String> {
    let rng = SystemRandom::new();
    // Rejection sampling keeps the distribution uniform over the alphabet.
    let limit = 256 - (256 % alphabet.len());
    let mut out = String::with_capacity(len);
    let mut buf = [0u8; 64];
    while out.len() < len {
        rng.fill(&mut buf)
            .map_err(|_| anyhow::anyhow!("Failed to generate random bytes"))?;
        for b in buf.iter().map(|b| *b as usize) {
            if b >= limit {
                continue;
            }
            out.push(alphabet[b % alphabet.len()] as char);
            if out.len() == len {
                break;
            }
        }
    }
    Ok(out)
}

/// Generate an admin password of `len` characters.
pub fn generate_password(len: usize) -> Result<String> {
    random_from_alphabet(len, PASSWORD_ALPHABET)
}

/// Generate an alphanumeric secret of `len` characters.
pub fn generate_secret(len: usize) -> Result<String> {
    random_from_alphabet(len, SECRET_ALPHABET)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn generated_password_has_requested_length_and_alphabet() {
        let pw = generate_password(16).unwrap();
        assert_eq!(pw.len(), 16);
        assert!(pw.bytes().all(|b| PASSWORD_ALPHABET.contains(&b)));
    }

    #[test]
    fn generated_secret_is_alphanumeric() {
        let secret = generate_secret(64).unwrap();
        assert_eq!(secret.len(), 64);
        assert!(secret.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(secret, generate_secret(64).unwrap());
    }

    #[test]
    fn fingerprint_does_not_contain_secret() {
        let fp = secret_fingerprint("ABC123-LICENSE");
        assert!(!fp.contains("ABC123"));
        assert_eq!(fp, secret_fingerprint("ABC123-LICENSE"));
    }
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! API-key encryption at rest.
//!
//! The cipher key is SHA-256 of the deployment secret; tokens are
//! URL-safe base64 of `nonce ‖ ciphertext` under XChaCha20-Poly1305.
//! Decryption is tolerant: anything that fails to decode or authenticate
//! is returned verbatim, so rows written before encryption was enabled
//! keep working.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    XChaCha20Poly1305, XNonce,
};
use sha2::{Digest, Sha256};

const NONCE_LEN: usize = 24;

/// Symmetric cipher for API keys, derived from the deployment secret.
#[derive(Clone)]
pub struct KeyCipher {
    cipher: Option<XChaCha20Poly1305>,
}

impl KeyCipher {
    /// An empty secret disables encryption: keys are stored verbatim and
    /// still masked in listings.
    pub fn new(secret: &str) -> Self {
        if secret.is_empty() {
            return Self { cipher: None };
        }
        let key = Sha256::digest(secret.as_bytes());
        let cipher = XChaCha20Poly1305::new_from_slice(&key).expect("sha256 output is 32 bytes");
        Self { cipher: Some(cipher) }
    }

    pub fn encrypt(&self, plaintext: &str) -> String {
        if plaintext.is_empty() {
            return String::new();
        }
        let Some(cipher) = &self.cipher else {
            return plaintext.to_string();
        };
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .expect("XChaCha20-Poly1305 encryption is infallible for in-memory data");
        let mut token = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        token.extend_from_slice(&nonce);
        token.extend_from_slice(&ciphertext);
        URL_SAFE_NO_PAD.encode(token)
    }

    pub fn decrypt(&self, token: &str) -> String {
        if token.is_empty() {
            return String::new();
        }
        let Some(cipher) = &self.cipher else {
            return token.to_string();
        };
        let Ok(raw) = URL_SAFE_NO_PAD.decode(token) else {
            return token.to_string();
        };
        if raw.len() <= NONCE_LEN {
            return token.to_string();
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        match cipher.decrypt(XNonce::from_slice(nonce), ciphertext) {
            Ok(plain) => String::from_utf8(plain).unwrap_or_else(|_| token.to_string()),
            Err(_) => token.to_string(),
        }
    }

    /// Render the preview form exposed to clients: `****` + last 4 chars.
    pub fn mask(value: &str) -> Option<String> {
        if value.is_empty() {
            return None;
        }
        let chars: Vec<char> = value.chars().collect();
        let start = chars.len().saturating_sub(4);
        let visible: String = chars[start..].iter().collect();
        Some(format!("****{visible}"))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_then_decrypt_round_trips() {
        let c = KeyCipher::new("deployment-secret");
        let token = c.encrypt("sk-very-secret-key-1234");
        assert_ne!(token, "sk-very-secret-key-1234");
        assert_eq!(c.decrypt(&token), "sk-very-secret-key-1234");
    }

    #[test]
    fn tokens_are_nonce_randomised() {
        let c = KeyCipher::new("secret");
        let a = c.encrypt("same-key");
        let b = c.encrypt("same-key");
        assert_ne!(a, b);
        assert_eq!(c.decrypt(&a), c.decrypt(&b));
    }

    #[test]
    fn empty_secret_is_identity() {
        let c = KeyCipher::new("");
        assert_eq!(c.encrypt("plain"), "plain");
        assert_eq!(c.decrypt("plain"), "plain");
    }

    #[test]
    fn legacy_plaintext_survives_decrypt() {
        let c = KeyCipher::new("secret");
        // A value written before encryption was enabled.
        assert_eq!(c.decrypt("sk-legacy-plain"), "sk-legacy-plain");
    }

    #[test]
    fn wrong_secret_returns_token_unchanged() {
        let a = KeyCipher::new("secret-a");
        let b = KeyCipher::new("secret-b");
        let token = a.encrypt("sk-key");
        assert_eq!(b.decrypt(&token), token);
    }

    #[test]
    fn mask_shows_last_four() {
        assert_eq!(KeyCipher::mask("sk-abcdef1234").as_deref(), Some("****1234"));
    }

    #[test]
    fn mask_short_value_shows_whole_value() {
        assert_eq!(KeyCipher::mask("abc").as_deref(), Some("****abc"));
    }

    #[test]
    fn mask_empty_is_none() {
        assert_eq!(KeyCipher::mask(""), None);
    }

    #[test]
    fn empty_plaintext_encrypts_to_empty() {
        let c = KeyCipher::new("secret");
        assert_eq!(c.encrypt(""), "");
        assert_eq!(c.decrypt(""), "");
    }
}

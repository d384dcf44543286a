//! PKCE (RFC 7636) verifier/challenge pairs.

use oauth2::{PkceCodeChallenge, PkceCodeVerifier};

/// The only challenge method orbit sends.
pub const CHALLENGE_METHOD: &str = "S256";

/// A code verifier and the challenge derived from it.
///
/// The verifier stays in memory for the duration of one login attempt and is
/// never persisted or logged.
pub struct PkcePair {
    pub verifier: String,
    pub challenge: String,
    pub method: &'static str,
}

impl PkcePair {
    /// Generates a fresh random verifier and its SHA-256 challenge.
    pub fn generate() -> Self {
        let (challenge, verifier) = PkceCodeChallenge::new_random_sha256();
        Self {
            verifier: verifier.secret().clone(),
            challenge: challenge.as_str().to_string(),
            method: CHALLENGE_METHOD,
        }
    }

    /// Challenge in the form the OAuth2 client embeds in the authorization URL.
    pub(crate) fn code_challenge(&self) -> PkceCodeChallenge {
        PkceCodeChallenge::from_code_verifier_sha256(&PkceCodeVerifier::new(self.verifier.clone()))
    }
}

impl std::fmt::Debug for PkcePair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PkcePair")
            .field("verifier", &"[redacted]")
            .field("challenge", &self.challenge)
            .field("method", &self.method)
            .finish()
    }
}

use super::traits::CodeChallengeMethod;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use sha2::{Digest, Sha256};

/// Fresh verifier (32 random bytes, 43 chars base64url) and its S256 challenge.
pub fn generate_pair() -> (String, String) {
    let verifier = URL_SAFE_NO_PAD.encode(rand::random::<[u8; 32]>());
    let challenge = s256_challenge(&verifier);
    (verifier, challenge)
}

pub fn s256_challenge(verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Plain string compare is fine here: codes are single use and short lived.
pub fn verify(verifier: &str, challenge: &str, method: CodeChallengeMethod) -> bool {
    match method {
        CodeChallengeMethod::S256 => s256_challenge(verifier) == challenge,
        CodeChallengeMethod::Plain => verifier == challenge,
    }
}

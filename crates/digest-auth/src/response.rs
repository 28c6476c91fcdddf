//! RFC 2617 "auth" response computation and header rendering.

use rand::RngCore;

use crate::challenge::DigestChallenge;
use crate::md5::md5_hex;

/// Fixed nonce count. Every client connection performs a fresh handshake, so
/// a session is never replayed across requests.
pub const NONCE_COUNT: &str = "00000001";

/// A computed Digest response, ready to be rendered as an `Authorization`
/// header value.
#[derive(Debug, Clone)]
pub struct DigestResponse {
    pub username: String,
    pub realm: String,
    pub nonce: String,
    pub uri: String,
    pub response: String,
    pub qop: String,
    pub algorithm: String,
    pub nc: String,
    pub cnonce: String,
    pub opaque: Option<String>,
}

impl DigestResponse {
    /// Compute a response for `method`/`uri` with a freshly generated client
    /// nonce (16 random bytes, hex encoded).
    pub fn compute(
        username: &str,
        password: &str,
        method: &str,
        uri: &str,
        challenge: &DigestChallenge,
    ) -> Self {
        Self::compute_with_cnonce(username, password, method, uri, challenge, client_nonce())
    }

    /// Compute with a caller-supplied cnonce. Deterministic; the handshake
    /// math is `response = MD5(HA1:nonce:nc:cnonce:qop:HA2)` with
    /// `HA1 = MD5(username:realm:password)` and `HA2 = MD5(method:uri)`.
    pub fn compute_with_cnonce(
        username: &str,
        password: &str,
        method: &str,
        uri: &str,
        challenge: &DigestChallenge,
        cnonce: String,
    ) -> Self {
        let ha1 = md5_hex(format!("{username}:{}:{password}", challenge.realm).as_bytes());
        let ha2 = md5_hex(format!("{method}:{uri}").as_bytes());
        let response = md5_hex(
            format!(
                "{ha1}:{}:{NONCE_COUNT}:{cnonce}:{}:{ha2}",
                challenge.nonce, challenge.qop
            )
            .as_bytes(),
        );

        Self {
            username: username.to_string(),
            realm: challenge.realm.clone(),
            nonce: challenge.nonce.clone(),
            uri: uri.to_string(),
            response,
            qop: challenge.qop.clone(),
            algorithm: challenge.algorithm.clone(),
            nc: NONCE_COUNT.to_string(),
            cnonce,
            opaque: challenge.opaque.clone(),
        }
    }

    /// Render the `Authorization` header value.
    pub fn authorization(&self) -> String {
        let mut header = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", \
             algorithm={}, response=\"{}\", qop={}, nc={}, cnonce=\"{}\"",
            self.username,
            self.realm,
            self.nonce,
            self.uri,
            self.algorithm,
            self.response,
            self.qop,
            self.nc,
            self.cnonce,
        );
        if let Some(opaque) = &self.opaque {
            header.push_str(&format!(", opaque=\"{opaque}\""));
        }
        header
    }
}

fn client_nonce() -> String {
    let mut raw = [0u8; 16];
    rand::rng().fill_bytes(&mut raw);
    hex::encode(raw)
}

//! Typed `WWW-Authenticate` Digest challenge parsing.

use thiserror::Error;

/// Challenge parsing failures. All of them are terminal for the request that
/// triggered the handshake.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChallengeError {
    #[error("authentication scheme is not Digest")]
    NotDigest,

    #[error("challenge is missing required field `realm`")]
    MissingRealm,

    #[error("challenge is missing required field `nonce`")]
    MissingNonce,
}

/// A Digest challenge extracted from a `WWW-Authenticate` header.
///
/// `realm` and `nonce` are required; `qop` defaults to `"auth"` and
/// `algorithm` to `"md5"` when the camera omits them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    pub qop: String,
    pub algorithm: String,
}

impl DigestChallenge {
    /// Parse a `WWW-Authenticate` header value.
    pub fn parse(header: &str) -> Result<Self, ChallengeError> {
        let trimmed = header.trim();
        // The scheme token must be exactly "Digest": six matching characters
        // followed by whitespace or end of header.
        let params = trimmed
            .get(..6)
            .filter(|scheme| scheme.eq_ignore_ascii_case("digest"))
            .map(|_| &trimmed[6..])
            .filter(|rest| rest.is_empty() || rest.starts_with([' ', '\t']))
            .ok_or(ChallengeError::NotDigest)?;

        let fields = split_parameters(params);
        let field = |name: &str| {
            fields
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.clone())
        };

        Ok(Self {
            realm: field("realm").ok_or(ChallengeError::MissingRealm)?,
            nonce: field("nonce").ok_or(ChallengeError::MissingNonce)?,
            opaque: field("opaque"),
            qop: field("qop").unwrap_or_else(|| "auth".to_string()),
            algorithm: field("algorithm").unwrap_or_else(|| "md5".to_string()),
        })
    }
}

/// Split a comma-separated `key=value` attribute list, honoring quoted values.
fn split_parameters(input: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut rest = input;

    loop {
        rest = rest.trim_start_matches([',', ' ', '\t']);
        if rest.is_empty() {
            break;
        }
        let Some(eq) = rest.find('=') else {
            break;
        };
        let key = rest[..eq].trim().to_ascii_lowercase();
        rest = &rest[eq + 1..];

        let value = if let Some(quoted) = rest.strip_prefix('"') {
            match quoted.find('"') {
                Some(end) => {
                    let value = quoted[..end].to_string();
                    rest = &quoted[end + 1..];
                    value
                }
                None => {
                    // Unterminated quote: take the remainder.
                    let value = quoted.to_string();
                    rest = "";
                    value
                }
            }
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            let value = rest[..end].trim().to_string();
            rest = &rest[end..];
            value
        };

        if !key.is_empty() {
            params.push((key, value));
        }
    }

    params
}

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::{engine::general_purpose, Engine as _};
use serde::Deserialize;

/// Claims the resolver cares about. Signatures are not verified; the token is
/// only inspected for hints the server will validate anyway.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TokenHints {
    pub account_id: Option<String>,
    pub expires_at: Option<SystemTime>,
}

#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(default)]
    exp: Option<u64>,
    #[serde(rename = "https://api.openai.com/auth", default)]
    openai_auth: Option<OpenAiAuthClaims>,
}

#[derive(Debug, Deserialize)]
struct OpenAiAuthClaims {
    #[serde(default)]
    chatgpt_account_id: Option<String>,
}

/// Decodes the payload segment of a three-part JWT. Opaque tokens yield no hints.
pub fn inspect(token: &str) -> TokenHints {
    let Some(claims) = decode_claims(token.trim()) else {
        return TokenHints::default();
    };

    TokenHints {
        account_id: claims
            .openai_auth
            .and_then(|auth| auth.chatgpt_account_id)
            .map(|id| id.trim().to_owned())
            .filter(|id| !id.is_empty()),
        expires_at: claims.exp.map(unix_seconds),
    }
}

pub(crate) fn unix_seconds(seconds: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(seconds)
}

fn decode_claims(token: &str) -> Option<Claims> {
    let mut parts = token.split('.');
    let _header = parts.next()?;
    let payload = parts.next()?;
    let _signature = parts.next()?;
    if parts.next().is_some() {
        return None;
    }

    let decoded = general_purpose::URL_SAFE_NO_PAD
        .decode(payload)
        .or_else(|_| general_purpose::URL_SAFE.decode(payload))
        .ok()?;
    serde_json::from_slice(&decoded).ok()
}

#[cfg(test)]
pub(crate) fn encode_test_token(claims: &serde_json::Value) -> String {
    let header = general_purpose::URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#);
    let payload = general_purpose::URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{header}.{payload}.sig")
}

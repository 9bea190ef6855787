//! Bearer token claim inspection.
//!
//! Tokens are not verified here; the claims are only used to learn which
//! user a freshly issued token belongs to.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use coachchat_core::UserId;
use serde_json::Value;

/// User id carried in a JWT payload, from `user_id` or else `sub`.
///
/// Returns `None` for tokens that are not JWTs or carry neither claim.
#[must_use]
pub fn user_id_from_token(token: &str) -> Option<UserId> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: Value = serde_json::from_slice(&bytes).ok()?;

    ["user_id", "sub"]
        .iter()
        .find_map(|claim| claims.get(claim).and_then(Value::as_str))
        .filter(|id| !id.is_empty())
        .map(UserId::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(claims: &str) -> String {
        format!(
            "{}.{}.sig",
            URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#),
            URL_SAFE_NO_PAD.encode(claims)
        )
    }

    #[test]
    fn test_user_id_claim_wins() {
        let t = token(r#"{"user_id":"alice","sub":"other"}"#);
        assert_eq!(user_id_from_token(&t), Some(UserId::new("alice")));
    }

    #[test]
    fn test_sub_fallback() {
        let t = token(r#"{"sub":"bob"}"#);
        assert_eq!(user_id_from_token(&t), Some(UserId::new("bob")));
    }

    #[test]
    fn test_undecodable_tokens() {
        assert_eq!(user_id_from_token("opaque-token"), None);
        assert_eq!(user_id_from_token("a.!!!.c"), None);
        assert_eq!(user_id_from_token(&token(r#"{"exp":1}"#)), None);
        assert_eq!(user_id_from_token(&token(r#"{"user_id":""}"#)), None);
    }
}

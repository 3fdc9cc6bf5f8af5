use crate::store::{AccessLogEntry, Store};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD as BASE64URL};
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Signed, time-bound, revocable portal tokens. A token embeds the order id,
/// expiry, and a random nonce; revocation and the access log key on the
/// SHA-256 of the whole token, never the raw value.
#[derive(Clone)]
pub struct TokenService {
    store: Store,
    signing_key: Vec<u8>,
}

/// `Expired` is deliberately distinct from `InvalidSignature`: both surface
/// as access denied, but logs and metrics must tell them apart.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,
    #[error("invalid token signature")]
    InvalidSignature,
    #[error("token expired")]
    Expired,
    #[error("token revoked")]
    Revoked,
}

impl TokenError {
    pub fn outcome(&self) -> &'static str {
        match self {
            TokenError::Malformed => "malformed",
            TokenError::InvalidSignature => "invalid_signature",
            TokenError::Expired => "expired",
            TokenError::Revoked => "revoked",
        }
    }
}

impl TokenService {
    pub fn new(store: Store, signing_key: impl Into<Vec<u8>>) -> Self {
        Self {
            store,
            signing_key: signing_key.into(),
        }
    }

    pub fn from_env(store: Store) -> Self {
        Self::new(store, crate::config::TOKEN_SIGNING_KEY.as_bytes())
    }

    pub fn issue(&self, order_id: Uuid, ttl_secs: i64) -> String {
        let expiry = Utc::now().timestamp() + ttl_secs;
        // the nonce makes every issued token unique, so revoking one never
        // blocks a replacement minted for the same order in the same second
        let nonce: u64 = rand::random();
        let payload = format!("{order_id}:{expiry}:{nonce:016x}");
        let sig = self.sign(payload.as_bytes());
        format!(
            "{}.{}",
            BASE64URL.encode(payload.as_bytes()),
            BASE64URL.encode(sig)
        )
    }

    /// Verify signature, then expiry, then the revocation list; append an
    /// access-log entry for every decision.
    pub async fn validate(&self, token: &str) -> Result<Uuid, TokenError> {
        let outcome = self.check(token).await;
        let (order_id, result) = match outcome {
            Ok(order_id) => (Some(order_id), Ok(order_id)),
            Err((order_id, err)) => {
                crate::metrics::token_denied(err.outcome());
                (order_id, Err(err))
            }
        };
        self.store
            .append_access_log(AccessLogEntry {
                order_id,
                token_hash: token_hash(token),
                outcome: match &result {
                    Ok(_) => "granted",
                    Err(err) => err.outcome(),
                },
                at: Utc::now(),
            })
            .await;
        result
    }

    /// Append-only revocation; the token itself is never mutated or stored.
    pub async fn revoke(&self, token: &str) {
        self.store.revoke_token_hash(token_hash(token)).await;
    }

    async fn check(&self, token: &str) -> Result<Uuid, (Option<Uuid>, TokenError)> {
        let (payload_b64, sig_b64) = token
            .split_once('.')
            .ok_or((None, TokenError::Malformed))?;
        let payload = BASE64URL
            .decode(payload_b64.as_bytes())
            .map_err(|_| (None, TokenError::Malformed))?;
        let sig = BASE64URL
            .decode(sig_b64.as_bytes())
            .map_err(|_| (None, TokenError::Malformed))?;

        let payload_text =
            String::from_utf8(payload).map_err(|_| (None, TokenError::Malformed))?;
        let mut parts = payload_text.splitn(3, ':');
        let order_part = parts.next().ok_or((None, TokenError::Malformed))?;
        let expiry_part = parts.next().ok_or((None, TokenError::Malformed))?;
        let order_id =
            Uuid::parse_str(order_part).map_err(|_| (None, TokenError::Malformed))?;
        let expiry: i64 = expiry_part
            .parse()
            .map_err(|_| (Some(order_id), TokenError::Malformed))?;
        if parts.next().is_none() {
            return Err((Some(order_id), TokenError::Malformed));
        }

        let mut mac = HmacSha256::new_from_slice(&self.signing_key)
            .map_err(|_| (Some(order_id), TokenError::InvalidSignature))?;
        mac.update(payload_text.as_bytes());
        mac.verify_slice(&sig)
            .map_err(|_| (Some(order_id), TokenError::InvalidSignature))?;

        if expiry < Utc::now().timestamp() {
            return Err((Some(order_id), TokenError::Expired));
        }

        if self.store.is_token_revoked(&token_hash(token)).await {
            return Err((Some(order_id), TokenError::Revoked));
        }

        Ok(order_id)
    }

    fn sign(&self, payload: &[u8]) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(&self.signing_key)
            .expect("hmac accepts any key length");
        mac.update(payload);
        mac.finalize().into_bytes().to_vec()
    }
}

pub fn token_hash(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> TokenService {
        TokenService::new(Store::new(), b"unit-test-signing-key".to_vec())
    }

    #[tokio::test]
    async fn issue_then_validate_roundtrip() {
        let tokens = service();
        let order_id = Uuid::new_v4();
        let token = tokens.issue(order_id, 3600);
        assert_eq!(tokens.validate(&token).await.unwrap(), order_id);

        let log = tokens.store.access_log().await;
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].outcome, "granted");
        assert_eq!(log[0].order_id, Some(order_id));
        assert_ne!(log[0].token_hash, token);
    }

    #[tokio::test]
    async fn expired_is_distinct_from_invalid_signature() {
        let tokens = service();
        let order_id = Uuid::new_v4();

        let expired = tokens.issue(order_id, -10);
        assert_eq!(tokens.validate(&expired).await, Err(TokenError::Expired));

        let other = TokenService::new(tokens.store.clone(), b"another-key".to_vec());
        let forged = other.issue(order_id, 3600);
        assert_eq!(
            tokens.validate(&forged).await,
            Err(TokenError::InvalidSignature)
        );

        let outcomes: Vec<_> = tokens
            .store
            .access_log()
            .await
            .into_iter()
            .map(|entry| entry.outcome)
            .collect();
        assert_eq!(outcomes, vec!["expired", "invalid_signature"]);
    }

    #[tokio::test]
    async fn revocation_is_append_only_denial() {
        let tokens = service();
        let order_id = Uuid::new_v4();
        let token = tokens.issue(order_id, 3600);
        tokens.validate(&token).await.unwrap();

        tokens.revoke(&token).await;
        assert_eq!(tokens.validate(&token).await, Err(TokenError::Revoked));

        // a freshly issued token for the same order still works
        let replacement = tokens.issue(order_id, 3600);
        assert_eq!(tokens.validate(&replacement).await.unwrap(), order_id);
    }

    #[tokio::test]
    async fn same_second_reissue_is_a_distinct_token() {
        let tokens = service();
        let order_id = Uuid::new_v4();
        let first = tokens.issue(order_id, 3600);
        let second = tokens.issue(order_id, 3600);
        assert_ne!(first, second);

        // revoking the first must not take the replacement down with it
        tokens.revoke(&first).await;
        assert_eq!(tokens.validate(&first).await, Err(TokenError::Revoked));
        assert_eq!(tokens.validate(&second).await.unwrap(), order_id);
    }

    #[tokio::test]
    async fn garbage_tokens_are_malformed() {
        let tokens = service();
        assert_eq!(
            tokens.validate("not-a-token").await,
            Err(TokenError::Malformed)
        );
        assert_eq!(
            tokens.validate("bm90OnZhbGlk.c2ln").await,
            Err(TokenError::Malformed)
        );
    }
}

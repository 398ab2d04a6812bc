// ── Bearer tokens ──────────────────────────────────────────────────────────
// Compact HS256 tokens (header.payload.signature, base64url) used in two
// places: the WebSocket/HTTP connect token carrying (userId, role), and the
// 7-day invite token carrying (conversationId, inviterId). One signer, two
// claim shapes; signatures are compared in constant time.

use crate::atoms::constants::INVITE_TOKEN_TTL_DAYS;
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::UserRole;
use crate::engine::clock::SharedClock;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Duration;
use hmac::{Hmac, Mac};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Serialize)]
struct Header {
    alg: &'static str,
    typ: &'static str,
}

/// Claims on the connect token presented at the WS handshake / HTTP calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectClaims {
    pub sub: String,
    pub role: UserRole,
    pub iat: i64,
    pub exp: i64,
}

/// Claims on an invite token. `jti` keys optional single-use tracking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InviteClaims {
    pub conversation_id: String,
    pub inviter_id: String,
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
}

pub struct TokenSigner {
    secret: Vec<u8>,
    clock: SharedClock,
}

impl TokenSigner {
    pub fn new(secret: impl Into<Vec<u8>>, clock: SharedClock) -> Self {
        TokenSigner {
            secret: secret.into(),
            clock,
        }
    }

    fn mac(&self) -> EngineResult<HmacSha256> {
        HmacSha256::new_from_slice(&self.secret)
            .map_err(|_| EngineError::Internal("empty signing secret".into()))
    }

    fn sign_claims<C: Serialize>(&self, claims: &C) -> EngineResult<String> {
        let header = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&Header {
            alg: "HS256",
            typ: "JWT",
        })?);
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);
        let signing_input = format!("{header}.{payload}");

        let mut mac = self.mac()?;
        mac.update(signing_input.as_bytes());
        let sig = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        Ok(format!("{signing_input}.{sig}"))
    }

    fn verify_claims<C: DeserializeOwned>(&self, token: &str) -> EngineResult<C> {
        let mut parts = token.splitn(3, '.');
        let (Some(header), Some(payload), Some(sig)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(EngineError::Auth("malformed token".into()));
        };

        let mut mac = self.mac()?;
        mac.update(format!("{header}.{payload}").as_bytes());
        let expected = mac.finalize().into_bytes();
        let given = URL_SAFE_NO_PAD
            .decode(sig)
            .map_err(|_| EngineError::Auth("malformed token signature".into()))?;
        if !bool::from(given.as_slice().ct_eq(expected.as_slice())) {
            return Err(EngineError::Auth("token signature mismatch".into()));
        }

        let raw = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| EngineError::Auth("malformed token payload".into()))?;
        serde_json::from_slice(&raw).map_err(|_| EngineError::Auth("malformed token claims".into()))
    }

    // ── Connect tokens ─────────────────────────────────────────────────

    pub fn issue_connect(&self, user_id: &str, role: UserRole, ttl: Duration) -> EngineResult<String> {
        let now = self.clock.now();
        self.sign_claims(&ConnectClaims {
            sub: user_id.to_string(),
            role,
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
        })
    }

    pub fn verify_connect(&self, token: &str) -> EngineResult<ConnectClaims> {
        let claims: ConnectClaims = self.verify_claims(token)?;
        if claims.exp <= self.clock.now().timestamp() {
            return Err(EngineError::Auth("token expired".into()));
        }
        Ok(claims)
    }

    // ── Invite tokens ──────────────────────────────────────────────────

    pub fn issue_invite(&self, conversation_id: &str, inviter_id: &str) -> EngineResult<String> {
        let now = self.clock.now();
        self.sign_claims(&InviteClaims {
            conversation_id: conversation_id.to_string(),
            inviter_id: inviter_id.to_string(),
            jti: uuid::Uuid::new_v4().to_string(),
            iat: now.timestamp(),
            exp: (now + Duration::days(INVITE_TOKEN_TTL_DAYS)).timestamp(),
        })
    }

    pub fn verify_invite(&self, token: &str) -> EngineResult<InviteClaims> {
        let claims: InviteClaims = self.verify_claims(token)?;
        if claims.exp <= self.clock.now().timestamp() {
            return Err(EngineError::Auth("invite expired".into()));
        }
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::clock::ManualClock;
    use chrono::{TimeZone, Utc};

    fn signer(clock: std::sync::Arc<ManualClock>) -> TokenSigner {
        TokenSigner::new(b"test-secret".to_vec(), clock)
    }

    #[test]
    fn connect_token_roundtrip() {
        let clock = ManualClock::at(Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap());
        let signer = signer(clock);
        let token = signer
            .issue_connect("u1", UserRole::Premium, Duration::hours(1))
            .unwrap();
        let claims = signer.verify_connect(&token).unwrap();
        assert_eq!(claims.sub, "u1");
        assert_eq!(claims.role, UserRole::Premium);
    }

    #[test]
    fn expired_token_rejected() {
        let clock = ManualClock::at(Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap());
        let signer = signer(clock.clone());
        let token = signer
            .issue_connect("u1", UserRole::Free, Duration::hours(1))
            .unwrap();

        clock.advance(Duration::hours(2));
        let err = signer.verify_connect(&token).unwrap_err();
        assert_eq!(err.code(), "unauthorized");
    }

    #[test]
    fn tampered_payload_rejected() {
        let clock = ManualClock::at(Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap());
        let signer = signer(clock);
        let token = signer
            .issue_connect("u1", UserRole::Free, Duration::hours(1))
            .unwrap();

        let mut parts: Vec<&str> = token.split('.').collect();
        let forged = URL_SAFE_NO_PAD.encode(
            serde_json::json!({"sub": "admin", "role": "admin", "iat": 0, "exp": i64::MAX})
                .to_string(),
        );
        parts[1] = &forged;
        let forged_token = parts.join(".");
        assert!(signer.verify_connect(&forged_token).is_err());
    }

    #[test]
    fn invite_expires_after_seven_days() {
        let clock = ManualClock::at(Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap());
        let signer = signer(clock.clone());
        let token = signer.issue_invite("c1", "u1").unwrap();
        assert!(signer.verify_invite(&token).is_ok());

        clock.advance(Duration::days(7) + Duration::seconds(1));
        assert!(signer.verify_invite(&token).is_err());
    }
}

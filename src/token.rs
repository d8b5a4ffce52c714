use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, AppResult};

/// Claims carried by a voice token: the compact signed envelope that
/// authorizes a client to HELLO a specific voice server into a specific
/// room as a specific user with a pre-allocated SSRC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceClaims {
    pub server_id: String,
    pub room_id: Uuid,
    pub user_id: Uuid,
    pub ssrc: u32,
    #[serde(default)]
    pub audio_only: bool,
    pub exp: i64,
}

/// Mints and verifies voice tokens with HMAC (HS256), the symmetric half of
/// the jsonwebtoken stack used elsewhere for asymmetric user-login tokens.
///
/// Verification accepts both the current secret and, during a rotation's
/// grace window, the previous one — so rotating the secret doesn't kill
/// sessions already in flight.
#[derive(Clone)]
pub struct VoiceTokenCodec {
    current: String,
    previous: Option<String>,
    expiry_secs: u64,
}

impl VoiceTokenCodec {
    pub fn new(current: String, previous: Option<String>, expiry_secs: u64) -> Self {
        Self { current, previous, expiry_secs }
    }

    /// Mint a token for `user_id` to join `room_id` on `server_id` with the
    /// given (assigner-allocated) `ssrc`.
    pub fn issue(
        &self,
        server_id: &str,
        room_id: Uuid,
        user_id: Uuid,
        ssrc: u32,
        audio_only: bool,
    ) -> AppResult<String> {
        let exp = Utc::now().timestamp() + self.expiry_secs as i64;
        let claims = VoiceClaims {
            server_id: server_id.to_string(),
            room_id,
            user_id,
            ssrc,
            audio_only,
            exp,
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.current.as_bytes()),
        )
        .map_err(|e| AppError::Internal(anyhow::anyhow!("token signing failed: {e}")))
    }

    /// Verify a token, trying the current secret first and falling back to
    /// the previous one if a rotation is in progress.
    pub fn verify(&self, token: &str) -> AppResult<VoiceClaims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;

        if let Ok(data) = decode::<VoiceClaims>(
            token,
            &DecodingKey::from_secret(self.current.as_bytes()),
            &validation,
        ) {
            return Ok(data.claims);
        }

        if let Some(prev) = &self.previous {
            if let Ok(data) = decode::<VoiceClaims>(
                token,
                &DecodingKey::from_secret(prev.as_bytes()),
                &validation,
            ) {
                return Ok(data.claims);
            }
        }

        Err(AppError::Unauthorized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> VoiceTokenCodec {
        VoiceTokenCodec::new("secret-a".into(), None, 3600)
    }

    #[test]
    fn round_trips_a_freshly_issued_token() {
        let codec = codec();
        let room_id = Uuid::now_v7();
        let user_id = Uuid::now_v7();
        let token = codec.issue("node-1", room_id, user_id, 42, false).unwrap();
        let claims = codec.verify(&token).unwrap();
        assert_eq!(claims.room_id, room_id);
        assert_eq!(claims.user_id, user_id);
        assert_eq!(claims.ssrc, 42);
    }

    #[test]
    fn rejects_a_token_signed_with_an_unknown_secret() {
        let issuer = VoiceTokenCodec::new("other-secret".into(), None, 3600);
        let token = issuer.issue("node-1", Uuid::now_v7(), Uuid::now_v7(), 1, false).unwrap();
        let verifier = codec();
        assert!(verifier.verify(&token).is_err());
    }

    #[test]
    fn accepts_previous_secret_during_rotation_grace_window() {
        let old_codec = VoiceTokenCodec::new("old-secret".into(), None, 3600);
        let token = old_codec.issue("node-1", Uuid::now_v7(), Uuid::now_v7(), 7, false).unwrap();

        let rotated = VoiceTokenCodec::new("new-secret".into(), Some("old-secret".into()), 3600);
        assert!(rotated.verify(&token).is_ok());

        let fully_rotated = VoiceTokenCodec::new("new-secret".into(), None, 3600);
        assert!(fully_rotated.verify(&token).is_err());
    }
}

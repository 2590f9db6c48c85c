//! Authentication and authorization.
//!
//! Bearer tokens are JWTs carrying the user id with a 24 hour expiry.
//! Passwords are stored as salted SHA-256 hashes (`salt$digest`, both hex).
//! `PermissionGate` performs the role check every book-scoped entry point
//! must pass before touching the editor or the store; it fails closed on a
//! missing grant.

use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::{header::AUTHORIZATION, request::Parts, StatusCode},
    Json,
};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use thiserror::Error;

use crate::editor::{EditorError, EditorResult};
use crate::storage::{BookId, BookStore, Role, UserId};
use crate::AppState;

/// Errors from token handling and credential checks
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("No token provided")]
    MissingToken,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Invalid credentials")]
    InvalidCredentials,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    /// User id
    sub: UserId,
    /// Expiry as unix timestamp
    exp: i64,
}

/// Issue a bearer token for a user, valid for 24 hours
pub fn generate_token(user_id: UserId, secret: &str) -> Result<String, AuthError> {
    let claims = Claims {
        sub: user_id,
        exp: chrono::Utc::now().timestamp() + 24 * 60 * 60,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|_| AuthError::InvalidToken)
}

/// Verify a bearer token and return the user id it was issued to
pub fn verify_token(token: &str, secret: &str) -> Result<UserId, AuthError> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims.sub)
    .map_err(|_| AuthError::InvalidToken)
}

/// Hash a password with a fresh random salt
pub fn hash_password(password: &str) -> String {
    let salt: [u8; 16] = rand::random();
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    format!("{}${}", hex::encode(salt), hex::encode(hasher.finalize()))
}

/// Check a password against a stored `salt$digest` hash
pub fn verify_password(password: &str, stored: &str) -> bool {
    let Some((salt_hex, digest_hex)) = stored.split_once('$') else {
        return false;
    };
    let Ok(salt) = hex::decode(salt_hex) else {
        return false;
    };
    let mut hasher = Sha256::new();
    hasher.update(&salt);
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize()) == digest_hex
}

/// Authenticated caller, extracted from the Authorization header
pub struct AuthUser(pub UserId);

fn unauthorized(err: AuthError) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({ "error": err.to_string() })),
    )
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    Arc<AppState>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = (StatusCode, Json<serde_json::Value>);

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let app = Arc::<AppState>::from_ref(state);
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|header| header.strip_prefix("Bearer "))
            .ok_or_else(|| unauthorized(AuthError::MissingToken))?;

        let user_id = verify_token(token, &app.jwt_secret).map_err(unauthorized)?;
        Ok(AuthUser(user_id))
    }
}

/// Role check every book-scoped operation passes before doing anything else
pub struct PermissionGate {
    store: BookStore,
}

impl PermissionGate {
    pub fn new(store: BookStore) -> Self {
        Self { store }
    }

    /// Succeeds iff the caller holds a grant on the book with role >= required.
    /// Fails closed: a missing grant and an insufficient role are both
    /// `Forbidden`, and a store failure never authorizes anything.
    pub fn authorize(
        &self,
        book_id: BookId,
        user_id: UserId,
        required: Role,
    ) -> EditorResult<Role> {
        match self.store.get_role(book_id, user_id) {
            Ok(Some(role)) if role >= required => Ok(role),
            Ok(Some(_)) => Err(EditorError::Forbidden(
                "insufficient permissions".to_string(),
            )),
            Ok(None) => Err(EditorError::Forbidden("no access to this book".to_string())),
            Err(e) => Err(EditorError::Persistence(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Orientation, PageSize, StorageConfig};
    use tempfile::tempdir;

    #[test]
    fn test_password_round_trip() {
        let hash = hash_password("geheim123");
        assert!(verify_password("geheim123", &hash));
        assert!(!verify_password("geheim124", &hash));
    }

    #[test]
    fn test_password_hashes_are_salted() {
        assert_ne!(hash_password("same"), hash_password("same"));
    }

    #[test]
    fn test_verify_password_malformed_hash() {
        assert!(!verify_password("pw", "not-a-hash"));
        assert!(!verify_password("pw", "zz$zz"));
    }

    #[test]
    fn test_token_round_trip() {
        let token = generate_token(42, "secret").unwrap();
        assert_eq!(verify_token(&token, "secret").unwrap(), 42);
    }

    #[test]
    fn test_token_wrong_secret_rejected() {
        let token = generate_token(42, "secret").unwrap();
        assert!(matches!(
            verify_token(&token, "other"),
            Err(AuthError::InvalidToken)
        ));
    }

    #[test]
    fn test_garbage_token_rejected() {
        assert!(matches!(
            verify_token("not.a.token", "secret"),
            Err(AuthError::InvalidToken)
        ));
    }

    #[test]
    fn test_permission_gate_orderings() {
        let dir = tempdir().unwrap();
        let store = BookStore::open(StorageConfig::new(
            dir.path().join("auth.sled").to_string_lossy().to_string(),
        ))
        .unwrap();

        let owner = store.create_user("alice", "a@example.com", "h").unwrap();
        let viewer = store.create_user("bob", "b@example.com", "h").unwrap();
        let stranger = store.create_user("eve", "e@example.com", "h").unwrap();
        let book = store
            .create_book(owner.id, "Buch", "", PageSize::A4, Orientation::Portrait)
            .unwrap();
        store.grant_role(book.id, viewer.id, Role::Viewer).unwrap();

        let gate = PermissionGate::new(store);

        // Owner was granted admin at creation; admin satisfies everything
        assert!(gate.authorize(book.id, owner.id, Role::Admin).is_ok());
        assert!(gate.authorize(book.id, owner.id, Role::Viewer).is_ok());

        // Viewer can view but not edit
        assert!(gate.authorize(book.id, viewer.id, Role::Viewer).is_ok());
        assert!(matches!(
            gate.authorize(book.id, viewer.id, Role::Editor),
            Err(EditorError::Forbidden(_))
        ));

        // No grant at all fails closed
        assert!(matches!(
            gate.authorize(book.id, stranger.id, Role::Viewer),
            Err(EditorError::Forbidden(_))
        ));
    }
}

//! JWT signing primitives.
//!
//! Access tokens are RS256 JWTs signed with the app's rotating dynamic keys;
//! refresh tokens are HS256 JWTs signed with the app's static refresh key.
//! Both carry the signing key id in the `kid` header so verifiers can pick
//! the right key without trial verification.
//!
//! [`SessionKeyPair`] wraps one key's encode/decode handles and is built
//! either by generating fresh material ([`generate_rsa_material`],
//! [`generate_hmac_material`]) or from a persisted
//! [`SigningKeyRecord`](keyfort_storage::SigningKeyRecord).

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, decode_header, encode,
};
use rand::rngs::OsRng;
use rsa::RsaPrivateKey;
use rsa::pkcs8::{DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use keyfort_storage::{KeyAlgorithm, KeyMaterial};

/// RSA modulus size for generated dynamic keys.
const RSA_BITS: usize = 2048;

/// HMAC secret size in bytes for generated refresh keys.
const HMAC_SECRET_BYTES: usize = 32;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during JWT operations.
#[derive(Debug, thiserror::Error)]
pub enum JwtError {
    /// Failed to encode a token.
    #[error("Failed to encode token: {message}")]
    EncodingError {
        /// Description of the encoding error.
        message: String,
    },

    /// Failed to decode a token.
    #[error("Failed to decode token: {message}")]
    DecodingError {
        /// Description of the decoding error.
        message: String,
    },

    /// The token has expired.
    #[error("Token expired")]
    Expired,

    /// The token signature is invalid.
    #[error("Invalid signature")]
    InvalidSignature,

    /// Failed to generate a cryptographic key.
    #[error("Key generation error: {message}")]
    KeyGenerationError {
        /// Description of the key generation error.
        message: String,
    },

    /// Invalid key format or data.
    #[error("Invalid key: {message}")]
    InvalidKey {
        /// Description of why the key is invalid.
        message: String,
    },
}

impl JwtError {
    /// Creates a new `EncodingError`.
    #[must_use]
    pub fn encoding_error(message: impl Into<String>) -> Self {
        Self::EncodingError {
            message: message.into(),
        }
    }

    /// Creates a new `DecodingError`.
    #[must_use]
    pub fn decoding_error(message: impl Into<String>) -> Self {
        Self::DecodingError {
            message: message.into(),
        }
    }

    /// Creates a new `KeyGenerationError`.
    #[must_use]
    pub fn key_generation_error(message: impl Into<String>) -> Self {
        Self::KeyGenerationError {
            message: message.into(),
        }
    }

    /// Creates a new `InvalidKey` error.
    #[must_use]
    pub fn invalid_key(message: impl Into<String>) -> Self {
        Self::InvalidKey {
            message: message.into(),
        }
    }

    /// Returns `true` if this is a validation error (expired token, bad
    /// signature, malformed token) as opposed to a key/encoding problem.
    #[must_use]
    pub fn is_validation_error(&self) -> bool {
        matches!(
            self,
            Self::Expired | Self::InvalidSignature | Self::DecodingError { .. }
        )
    }
}

impl From<jsonwebtoken::errors::Error> for JwtError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;

        match err.kind() {
            ErrorKind::ExpiredSignature => Self::Expired,
            ErrorKind::InvalidSignature => Self::InvalidSignature,
            ErrorKind::InvalidRsaKey(_) | ErrorKind::InvalidKeyFormat => {
                Self::invalid_key(err.to_string())
            }
            _ => Self::decoding_error(err.to_string()),
        }
    }
}

// ============================================================================
// Claims
// ============================================================================

/// Access token claims.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessTokenClaims {
    /// Subject: the user id.
    pub sub: String,

    /// Expiration time (Unix timestamp).
    pub exp: i64,

    /// Issued at (Unix timestamp).
    pub iat: i64,

    /// The session handle this token belongs to.
    pub session_handle: String,

    /// The tenant the session was created in.
    pub tenant_id: String,

    /// Caller-supplied claims, copied verbatim from the session.
    pub user_data: serde_json::Value,

    /// Anti-CSRF pair token (cookie transport only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anti_csrf_token: Option<String>,
}

/// Refresh token claims.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshTokenClaims {
    /// Expiration time (Unix timestamp).
    pub exp: i64,

    /// Issued at (Unix timestamp).
    pub iat: i64,

    /// The session handle this token refreshes.
    pub session_handle: String,

    /// Lineage counter embedded at issue time.
    pub lineage_counter: u64,

    /// Unique token id, so two rotations in the same second still produce
    /// distinct tokens (and distinct hashes).
    pub jti: String,
}

// ============================================================================
// Key material generation
// ============================================================================

/// Generates PEM material for a new RS256 dynamic key.
///
/// # Errors
///
/// Returns an error if RSA key generation or PEM export fails.
pub fn generate_rsa_material() -> Result<KeyMaterial, JwtError> {
    let private_key = RsaPrivateKey::new(&mut OsRng, RSA_BITS)
        .map_err(|e| JwtError::key_generation_error(e.to_string()))?;

    let private_pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| JwtError::key_generation_error(e.to_string()))?
        .to_string();

    let public_pem = private_key
        .to_public_key()
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| JwtError::key_generation_error(e.to_string()))?;

    Ok(KeyMaterial::Rsa {
        private_pem,
        public_pem,
    })
}

/// Generates secret material for a new HS256 refresh key.
#[must_use]
pub fn generate_hmac_material() -> KeyMaterial {
    let mut bytes = [0u8; HMAC_SECRET_BYTES];
    rand::Rng::fill(&mut rand::thread_rng(), &mut bytes[..]);
    KeyMaterial::Hmac {
        secret: URL_SAFE_NO_PAD.encode(bytes),
    }
}

/// Hashes a token value with SHA-256, hex encoded.
///
/// Used both when storing refresh-token hashes and when looking presented
/// tokens up for comparison.
#[must_use]
pub fn hash_token(token: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Extracts the `kid` header from a token without verifying it.
///
/// # Errors
///
/// Returns a decoding error if the token is not a structurally valid JWT.
pub fn token_kid(token: &str) -> Result<Option<String>, JwtError> {
    let header = decode_header(token)?;
    Ok(header.kid)
}

// ============================================================================
// Session Key Pair
// ============================================================================

/// One signing key's encode/decode handles.
pub struct SessionKeyPair {
    /// Key ID, embedded in the `kid` header of signed tokens.
    pub kid: String,

    /// Signing algorithm.
    pub algorithm: KeyAlgorithm,

    /// Encoding key (private half) for signing.
    encoding_key: EncodingKey,

    /// Decoding key (public half) for verification.
    decoding_key: DecodingKey,

    /// RSA public parts for JWKS export (`None` for HMAC keys).
    public_parts: Option<RsaPublicParts>,
}

struct RsaPublicParts {
    n: Vec<u8>,
    e: Vec<u8>,
}

impl std::fmt::Debug for SessionKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeyPair")
            .field("kid", &self.kid)
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

impl SessionKeyPair {
    /// Builds a key pair from persisted material.
    ///
    /// # Errors
    ///
    /// Returns an error if the material does not match the algorithm or
    /// fails to parse.
    pub fn from_material(
        kid: impl Into<String>,
        algorithm: KeyAlgorithm,
        material: &KeyMaterial,
    ) -> Result<Self, JwtError> {
        let kid = kid.into();
        match (algorithm, material) {
            (
                KeyAlgorithm::RS256,
                KeyMaterial::Rsa {
                    private_pem,
                    public_pem,
                },
            ) => {
                let encoding_key = EncodingKey::from_rsa_pem(private_pem.as_bytes())
                    .map_err(|e| JwtError::invalid_key(e.to_string()))?;
                let decoding_key = DecodingKey::from_rsa_pem(public_pem.as_bytes())
                    .map_err(|e| JwtError::invalid_key(e.to_string()))?;

                // Parse the public key to extract n and e for JWKS export.
                let public_key = rsa::RsaPublicKey::from_public_key_pem(public_pem)
                    .map_err(|e| JwtError::invalid_key(e.to_string()))?;
                let parts = RsaPublicParts {
                    n: public_key.n().to_bytes_be(),
                    e: public_key.e().to_bytes_be(),
                };

                Ok(Self {
                    kid,
                    algorithm,
                    encoding_key,
                    decoding_key,
                    public_parts: Some(parts),
                })
            }
            (KeyAlgorithm::HS256, KeyMaterial::Hmac { secret }) => {
                let bytes = URL_SAFE_NO_PAD
                    .decode(secret)
                    .map_err(|e| JwtError::invalid_key(e.to_string()))?;
                Ok(Self {
                    kid,
                    algorithm,
                    encoding_key: EncodingKey::from_secret(&bytes),
                    decoding_key: DecodingKey::from_secret(&bytes),
                    public_parts: None,
                })
            }
            _ => Err(JwtError::invalid_key(format!(
                "material kind does not match algorithm {algorithm}"
            ))),
        }
    }

    fn jwt_algorithm(&self) -> Algorithm {
        match self.algorithm {
            KeyAlgorithm::RS256 => Algorithm::RS256,
            KeyAlgorithm::HS256 => Algorithm::HS256,
        }
    }

    /// Signs claims into a JWT with this key's `kid` in the header.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn sign<T: Serialize>(&self, claims: &T) -> Result<String, JwtError> {
        let mut header = Header::new(self.jwt_algorithm());
        header.kid = Some(self.kid.clone());

        encode(&header, claims, &self.encoding_key)
            .map_err(|e| JwtError::encoding_error(e.to_string()))
    }

    /// Verifies a token's signature and expiry, returning its claims.
    ///
    /// `leeway_secs` is the tolerated clock skew when checking `exp`.
    ///
    /// # Errors
    ///
    /// Returns [`JwtError::Expired`] / [`JwtError::InvalidSignature`] /
    /// [`JwtError::DecodingError`] on rejection.
    pub fn verify<T: DeserializeOwned>(&self, token: &str, leeway_secs: u64) -> Result<T, JwtError> {
        let mut validation = Validation::new(self.jwt_algorithm());
        validation.leeway = leeway_secs;
        validation.validate_exp = true;
        validation.validate_aud = false;

        let data = decode::<T>(token, &self.decoding_key, &validation)?;
        Ok(data.claims)
    }

    /// Exports the public half as a JWK (`None` for symmetric keys).
    #[must_use]
    pub fn to_jwk(&self) -> Option<Jwk> {
        self.public_parts.as_ref().map(|parts| Jwk {
            kty: "RSA".to_string(),
            kid: self.kid.clone(),
            use_: "sig".to_string(),
            alg: self.algorithm.as_str().to_string(),
            n: Some(URL_SAFE_NO_PAD.encode(&parts.n)),
            e: Some(URL_SAFE_NO_PAD.encode(&parts.e)),
        })
    }
}

// ============================================================================
// JWKS Types
// ============================================================================

/// JSON Web Key Set, as published to external verifiers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Jwks {
    /// The keys in this set.
    pub keys: Vec<Jwk>,
}

impl Jwks {
    /// Creates a new empty JWKS.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a key to the set.
    pub fn add_key(&mut self, key: Jwk) {
        self.keys.push(key);
    }
}

/// JSON Web Key (RSA signature keys only).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jwk {
    /// Key type.
    pub kty: String,

    /// Key ID.
    pub kid: String,

    /// Key use ("sig").
    #[serde(rename = "use")]
    pub use_: String,

    /// Algorithm.
    pub alg: String,

    /// RSA modulus (base64url encoded).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,

    /// RSA exponent (base64url encoded).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use keyfort_core::now_utc;

    fn rsa_pair() -> SessionKeyPair {
        let material = generate_rsa_material().unwrap();
        SessionKeyPair::from_material("kid-rsa", KeyAlgorithm::RS256, &material).unwrap()
    }

    fn hmac_pair() -> SessionKeyPair {
        let material = generate_hmac_material();
        SessionKeyPair::from_material("kid-hmac", KeyAlgorithm::HS256, &material).unwrap()
    }

    fn access_claims(exp_offset_secs: i64) -> AccessTokenClaims {
        let now = now_utc().unix_timestamp();
        AccessTokenClaims {
            sub: "user-1".to_string(),
            exp: now + exp_offset_secs,
            iat: now,
            session_handle: "handle-1".to_string(),
            tenant_id: "public".to_string(),
            user_data: serde_json::json!({"role": "admin"}),
            anti_csrf_token: None,
        }
    }

    #[test]
    fn test_rsa_sign_verify_round_trip() {
        let pair = rsa_pair();
        let claims = access_claims(3600);

        let token = pair.sign(&claims).unwrap();
        let decoded: AccessTokenClaims = pair.verify(&token, 0).unwrap();
        assert_eq!(decoded, claims);
    }

    #[test]
    fn test_hmac_sign_verify_round_trip() {
        let pair = hmac_pair();
        let now = now_utc().unix_timestamp();
        let claims = RefreshTokenClaims {
            exp: now + 3600,
            iat: now,
            session_handle: "handle-1".to_string(),
            lineage_counter: 4,
            jti: "jti-1".to_string(),
        };

        let token = pair.sign(&claims).unwrap();
        let decoded: RefreshTokenClaims = pair.verify(&token, 0).unwrap();
        assert_eq!(decoded, claims);
    }

    #[test]
    fn test_expired_token_rejected() {
        let pair = rsa_pair();
        let token = pair.sign(&access_claims(-3600)).unwrap();

        let err = pair.verify::<AccessTokenClaims>(&token, 0).unwrap_err();
        assert!(matches!(err, JwtError::Expired));
        assert!(err.is_validation_error());
    }

    #[test]
    fn test_leeway_tolerates_recent_expiry() {
        let pair = rsa_pair();
        let token = pair.sign(&access_claims(-30)).unwrap();

        assert!(pair.verify::<AccessTokenClaims>(&token, 0).is_err());
        assert!(pair.verify::<AccessTokenClaims>(&token, 60).is_ok());
    }

    #[test]
    fn test_wrong_key_rejected() {
        let pair1 = rsa_pair();
        let pair2 = rsa_pair();

        let token = pair1.sign(&access_claims(3600)).unwrap();
        let err = pair2.verify::<AccessTokenClaims>(&token, 0).unwrap_err();
        assert!(matches!(err, JwtError::InvalidSignature));
    }

    #[test]
    fn test_kid_header_round_trip() {
        let pair = rsa_pair();
        let token = pair.sign(&access_claims(3600)).unwrap();
        assert_eq!(token_kid(&token).unwrap(), Some("kid-rsa".to_string()));
    }

    #[test]
    fn test_garbage_token_is_decoding_error() {
        let err = token_kid("not-a-jwt").unwrap_err();
        assert!(matches!(err, JwtError::DecodingError { .. }));
    }

    #[test]
    fn test_material_algorithm_mismatch_rejected() {
        let material = generate_hmac_material();
        let err =
            SessionKeyPair::from_material("kid", KeyAlgorithm::RS256, &material).unwrap_err();
        assert!(matches!(err, JwtError::InvalidKey { .. }));
    }

    #[test]
    fn test_rsa_material_round_trips_through_pem() {
        let material = generate_rsa_material().unwrap();
        let pair = SessionKeyPair::from_material("kid", KeyAlgorithm::RS256, &material).unwrap();

        // A second pair built from the same material verifies the first's
        // signatures: persisted keys survive a process restart.
        let pair2 = SessionKeyPair::from_material("kid", KeyAlgorithm::RS256, &material).unwrap();
        let token = pair.sign(&access_claims(3600)).unwrap();
        assert!(pair2.verify::<AccessTokenClaims>(&token, 0).is_ok());
    }

    #[test]
    fn test_hash_token_stable_and_distinct() {
        let hash = hash_token("token-a");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, hash_token("token-a"));
        assert_ne!(hash, hash_token("token-b"));
    }

    #[test]
    fn test_jwk_export() {
        let pair = rsa_pair();
        let jwk = pair.to_jwk().unwrap();
        assert_eq!(jwk.kty, "RSA");
        assert_eq!(jwk.use_, "sig");
        assert_eq!(jwk.alg, "RS256");
        assert!(jwk.n.is_some());
        assert!(jwk.e.is_some());

        // Symmetric keys are never exported.
        assert!(hmac_pair().to_jwk().is_none());
    }

    #[test]
    fn test_anti_csrf_claim_omitted_when_absent() {
        let claims = access_claims(3600);
        let json = serde_json::to_string(&claims).unwrap();
        assert!(!json.contains("antiCsrfToken"));
        assert!(json.contains("sessionHandle"));
    }
}

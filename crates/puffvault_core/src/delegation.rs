//! Delegation token issuance.
//!
//! The operator (acting as the collection builder) lets each owner identity
//! write into the shared collection by issuing a short-lived capability
//! bound to that owner's DID and to a single command. Tokens are serialized
//! as a three-segment base64url envelope (`header.claims.signature`) signed
//! with the operator key; they are cheap to mint and never persisted, so a
//! fresh one is issued per provisioning cycle rather than cached across
//! clock skew.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{MigrationError, Result};
use crate::identity::{Keypair, verify_signature};

/// The only command this pipeline ever delegates: create documents in the
/// target collection.
pub const CREATE_DATA_COMMAND: &str = "/nil/db/data/create";

#[derive(Debug, Serialize, Deserialize)]
struct TokenHeader {
    alg: String,
    typ: String,
}

impl TokenHeader {
    fn es256k() -> Self {
        Self {
            alg: "ES256K".into(),
            typ: "nuc".into(),
        }
    }
}

/// Claims carried by a delegation token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Issuer DID (the operator).
    pub iss: String,
    /// Audience DID (the one owner identity this token is valid for).
    pub aud: String,
    /// Delegated command. Never broader than document creation.
    pub cmd: String,
    /// Expiry as a unix timestamp.
    pub exp: i64,
    /// Random nonce so two tokens for the same audience never collide.
    pub nonce: String,
    /// SHA-256 of the operator's root credential this token derives from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prf: Option<String>,
}

/// A serialized, signed delegation token.
#[derive(Debug, Clone)]
pub struct DelegationToken {
    raw: String,
}

impl DelegationToken {
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Parse the claims segment without verifying the signature.
    pub fn claims(&self) -> Result<TokenClaims> {
        let (_, claims, _) = split_envelope(&self.raw)?;
        Ok(claims)
    }
}

impl std::fmt::Display for DelegationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Issues delegation tokens from the operator's root credential.
pub struct DelegationAuthority {
    operator: Keypair,
    root_proof: Option<String>,
    ttl_seconds: i64,
}

impl DelegationAuthority {
    pub fn new(operator: Keypair, ttl_seconds: i64) -> Self {
        Self {
            operator,
            root_proof: None,
            ttl_seconds,
        }
    }

    /// Record the root credential this authority derives its tokens from.
    /// Only its hash ends up in the claims.
    pub fn with_root_token(mut self, root_token: &str) -> Self {
        self.root_proof = Some(hex::encode(Sha256::digest(root_token.as_bytes())));
        self
    }

    pub fn operator_did(&self) -> String {
        self.operator.did()
    }

    /// Issue a token letting `audience_did` run `command`, expiring after
    /// the configured TTL.
    pub fn delegate(&self, command: &str, audience_did: &str) -> Result<DelegationToken> {
        let nonce: [u8; 16] = rand::rng().random();
        let claims = TokenClaims {
            iss: self.operator.did(),
            aud: audience_did.to_string(),
            cmd: command.to_string(),
            exp: chrono::Utc::now().timestamp() + self.ttl_seconds,
            nonce: hex::encode(nonce),
            prf: self.root_proof.clone(),
        };

        let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&TokenHeader::es256k())?);
        let claims_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims)?);
        let signing_input = format!("{header_b64}.{claims_b64}");
        let signature = self.operator.sign(signing_input.as_bytes());
        let raw = format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(signature));

        tracing::trace!(aud = %claims.aud, exp = claims.exp, "issued delegation");
        Ok(DelegationToken { raw })
    }
}

/// Verify a delegation token at the point of use.
///
/// Checks, in order: envelope shape, issuer signature, audience binding to
/// the presenting identity, command scope, and expiry against `now`.
pub fn verify_delegation(
    token: &DelegationToken,
    issuer_did: &str,
    presenter_did: &str,
    command: &str,
    now: i64,
) -> Result<TokenClaims> {
    let (signing_input, claims, signature) = split_envelope(&token.raw)?;

    if claims.iss != issuer_did {
        return Err(MigrationError::InvalidDelegation(format!(
            "unexpected issuer {}",
            claims.iss
        )));
    }
    verify_signature(&claims.iss, signing_input.as_bytes(), &signature)?;

    if claims.aud != presenter_did {
        return Err(MigrationError::InvalidDelegation(
            "token audience does not match presenting identity".into(),
        ));
    }
    if claims.cmd != command {
        return Err(MigrationError::InvalidDelegation(format!(
            "token scope '{}' does not cover '{command}'",
            claims.cmd
        )));
    }
    if claims.exp <= now {
        return Err(MigrationError::InvalidDelegation("token expired".into()));
    }

    Ok(claims)
}

fn split_envelope(raw: &str) -> Result<(String, TokenClaims, Vec<u8>)> {
    let mut parts = raw.split('.');
    let (header, claims, signature) = match (parts.next(), parts.next(), parts.next(), parts.next())
    {
        (Some(h), Some(c), Some(s), None) => (h, c, s),
        _ => {
            return Err(MigrationError::InvalidDelegation(
                "expected a three-segment envelope".into(),
            ));
        }
    };

    let signing_input = format!("{header}.{claims}");
    let claims_bytes = URL_SAFE_NO_PAD
        .decode(claims)
        .map_err(|e| MigrationError::InvalidDelegation(format!("claims segment: {e}")))?;
    let claims: TokenClaims = serde_json::from_slice(&claims_bytes)?;
    let signature = URL_SAFE_NO_PAD
        .decode(signature)
        .map_err(|e| MigrationError::InvalidDelegation(format!("signature segment: {e}")))?;

    Ok((signing_input, claims, signature))
}

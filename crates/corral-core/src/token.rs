//! One-time bootstrap tokens for freshly spawned instances.
//!
//! A new instance receives a random token out of band and trades it,
//! exactly once, for its bootstrap material (which env keys to fetch plus
//! non-secret env). The plaintext token exists only in the issuance
//! response; the store keeps its SHA-256 hash. Consumption is a single
//! conditional `UPDATE ... WHERE used_at IS NULL AND expires_at > now`, so
//! two racing redeemers cannot both win.

use std::collections::BTreeMap;

use rand::RngCore;
use rusqlite::{named_params, OptionalExtension};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::now_ms;
use crate::queue::{QueueEngine, QueueError};

/// Length of the random token in bytes (hex-encoded on the wire).
const TOKEN_BYTES: usize = 32;

/// Parameters for [`QueueEngine::create_token`].
#[derive(Debug, Clone)]
pub struct CreateTokenRequest {
    /// Spawn job this token belongs to.
    pub job_id: String,
    /// Principal the instance is spawned for.
    pub requester: String,
    /// Name of the instance that will redeem the token.
    pub cattle_name: String,
    /// Names of secrets the instance should fetch after bootstrap.
    pub env_keys: Vec<String>,
    /// Non-secret environment handed over verbatim.
    pub public_env: BTreeMap<String, String>,
    /// Token lifetime; defaults to the policy value.
    pub ttl_ms: Option<i64>,
    /// Clock override for tests.
    pub now_ms: Option<i64>,
}

/// A freshly issued token. The `token` field is the only copy of the
/// plaintext that will ever exist.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    /// Hex-encoded plaintext token; hand it to the instance, never store it.
    pub token: String,
    /// When the token stops being redeemable.
    pub expires_at_ms: i64,
}

/// Bootstrap material released by a successful [`QueueEngine::consume_token`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapClaim {
    /// Spawn job the token was issued for.
    pub job_id: String,
    /// Principal the instance belongs to.
    pub requester: String,
    /// Name of the instance.
    pub cattle_name: String,
    /// Names of secrets the instance should fetch.
    pub env_keys: Vec<String>,
    /// Non-secret environment.
    pub public_env: BTreeMap<String, String>,
}

impl QueueEngine {
    /// Issues a one-time bootstrap token for a spawn job.
    ///
    /// The plaintext is returned exactly once; only its SHA-256 hash is
    /// persisted.
    pub fn create_token(&self, req: &CreateTokenRequest) -> Result<IssuedToken, QueueError> {
        let now = req.now_ms.unwrap_or_else(now_ms);
        let ttl = req.ttl_ms.unwrap_or(self.policy.token_ttl_ms).max(1);
        let expires_at = now.saturating_add(ttl);

        let mut raw = [0u8; TOKEN_BYTES];
        rand::rngs::OsRng.fill_bytes(&mut raw);
        let token = hex::encode(raw);
        let token_hash = hash_token(&token);

        let env_keys = serde_json::to_string(&req.env_keys)?;
        let public_env = serde_json::to_string(&req.public_env)?;

        let conn = self.store.conn();
        conn.execute(
            "INSERT INTO cattle_bootstrap_tokens \
                 (token_hash, job_id, requester, cattle_name, env_keys, public_env, \
                  created_at, expires_at) \
             VALUES (:hash, :job_id, :requester, :name, :env_keys, :public_env, :now, :expires)",
            named_params! {
                ":hash": token_hash,
                ":job_id": req.job_id,
                ":requester": req.requester,
                ":name": req.cattle_name,
                ":env_keys": env_keys,
                ":public_env": public_env,
                ":now": now,
                ":expires": expires_at,
            },
        )?;

        debug!(job_id = %req.job_id, cattle = %req.cattle_name, "issued bootstrap token");
        Ok(IssuedToken {
            token,
            expires_at_ms: expires_at,
        })
    }

    /// Redeems a bootstrap token, marking it used atomically.
    ///
    /// Returns `None` for an unknown, expired, or already-used token; the
    /// caller cannot distinguish the three, by construction.
    pub fn consume_token(
        &self,
        token: &str,
        now_ms_override: Option<i64>,
    ) -> Result<Option<BootstrapClaim>, QueueError> {
        let now = now_ms_override.unwrap_or_else(now_ms);
        let token_hash = hash_token(token);

        let mut conn = self.store.conn();
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE cattle_bootstrap_tokens SET used_at = :now \
             WHERE token_hash = :hash AND used_at IS NULL AND expires_at > :now",
            named_params! { ":now": now, ":hash": token_hash },
        )?;
        if changed != 1 {
            return Ok(None);
        }

        let claim = tx
            .query_row(
                "SELECT job_id, requester, cattle_name, env_keys, public_env \
                 FROM cattle_bootstrap_tokens WHERE token_hash = :hash",
                named_params! { ":hash": token_hash },
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;
        tx.commit()?;

        let Some((job_id, requester, cattle_name, env_keys, public_env)) = claim else {
            return Ok(None);
        };
        debug!(job_id, cattle = %cattle_name, "bootstrap token consumed");
        Ok(Some(BootstrapClaim {
            job_id,
            requester,
            cattle_name,
            env_keys: serde_json::from_str(&env_keys)?,
            public_env: serde_json::from_str(&public_env)?,
        }))
    }

    /// Deletes tokens past their expiry, consumed or not, plus used tokens
    /// older than a short audit window; returns the count.
    pub fn prune_tokens(&self, now_ms_override: Option<i64>) -> Result<u64, QueueError> {
        let now = now_ms_override.unwrap_or_else(now_ms);
        let conn = self.store.conn();
        let deleted = conn.execute(
            "DELETE FROM cattle_bootstrap_tokens \
             WHERE expires_at <= :now \
                OR (used_at IS NOT NULL AND used_at < :used_cutoff)",
            named_params! {
                ":now": now,
                ":used_cutoff": now.saturating_sub(3_600_000),
            },
        )?;
        if deleted > 0 {
            debug!(deleted, "pruned bootstrap tokens");
        }
        Ok(deleted as u64)
    }
}

fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

use base64::Engine;
use chrono::Utc;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{instrument, warn};

use xhbot_core::{BotToken, TokenValidator};

use crate::database::Database;
use crate::error::StoreError;

/// Random bytes per issued token, before base64url encoding.
const TOKEN_BYTES: usize = 32;

/// A stored token. The plaintext is never persisted, only its digest.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BotTokenRow {
    pub id: i64,
    pub label: String,
    pub created_at: String,
    pub revoked_at: Option<String>,
}

impl BotTokenRow {
    pub fn is_active(&self) -> bool {
        self.revoked_at.is_none()
    }
}

/// Returned once by [`BotTokenRepo::issue`]; the only time the plaintext exists.
#[derive(Debug)]
pub struct IssuedToken {
    pub label: String,
    pub token: BotToken,
}

/// Trusted bot-token store.
#[derive(Clone)]
pub struct BotTokenRepo {
    db: Database,
}

impl BotTokenRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Generate a fresh token under a unique label.
    #[instrument(skip(self))]
    pub fn issue(&self, label: &str) -> Result<IssuedToken, StoreError> {
        let label = label.trim();
        if label.is_empty() {
            return Err(StoreError::InvalidInput("token label must not be empty".into()));
        }

        let mut raw = [0u8; TOKEN_BYTES];
        rand::thread_rng().fill_bytes(&mut raw);
        let token = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(raw);
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO bot_tokens (label, token_hash, created_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![label, digest(&token), now],
            )
            .map_err(|e| match StoreError::from(e) {
                StoreError::Conflict(_) => {
                    StoreError::Conflict(format!("token label '{label}' already exists"))
                }
                other => other,
            })?;
            Ok(())
        })?;

        Ok(IssuedToken {
            label: label.to_string(),
            token: BotToken::new(token),
        })
    }

    /// Revoke the active token under `label`.
    #[instrument(skip(self))]
    pub fn revoke(&self, label: &str) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let changed = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE bot_tokens SET revoked_at = ?1 WHERE label = ?2 AND revoked_at IS NULL",
                rusqlite::params![now, label],
            )?)
        })?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("active token label '{label}'")));
        }
        Ok(())
    }

    /// All tokens, oldest first.
    #[instrument(skip(self))]
    pub fn list(&self) -> Result<Vec<BotTokenRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, label, created_at, revoked_at FROM bot_tokens ORDER BY id ASC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(BotTokenRow {
                    id: row.get(0)?,
                    label: row.get(1)?,
                    created_at: row.get(2)?,
                    revoked_at: row.get(3)?,
                })
            })?;
            Ok(rows.collect::<Result<_, _>>()?)
        })
    }

    /// Whether `token` matches an unrevoked stored digest.
    pub fn is_valid(&self, token: &str) -> Result<bool, StoreError> {
        if token.is_empty() {
            return Ok(false);
        }
        let hash = digest(token);
        self.db.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM bot_tokens WHERE token_hash = ?1 AND revoked_at IS NULL",
                [hash],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
    }
}

impl TokenValidator for BotTokenRepo {
    fn validate(&self, token: &str) -> bool {
        match self.is_valid(token) {
            Ok(valid) => valid,
            Err(e) => {
                warn!(error = %e, "token lookup failed, rejecting");
                false
            }
        }
    }
}

fn digest(token: &str) -> String {
    format!("{:x}", Sha256::digest(token.as_bytes()))
}

//! Strategy entity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// A versioned piece of strategy source code. `code` is opaque to the
/// engine — only the backtest container interprets it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strategy {
    pub id: Uuid,
    pub name: String,
    pub code: String,
    /// SHA-256 of `code`, hex-encoded. Deterministic function of `code`;
    /// duplicates are rejected at the repository boundary.
    pub code_hash: String,
    pub parent_id: Option<Uuid>,
    /// 0 if `parent_id` is None, else `parent.generation + 1`.
    pub generation: i32,
    pub description: Option<String>,
    pub tags: Vec<String>,
    /// Free-form metadata: timeframe, indicators list, numeric knobs.
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Strategy {
    /// Deterministic content hash used as the uniqueness key.
    ///
    /// Maintained in application code rather than a DB trigger, so it's
    /// testable without a live Postgres.
    pub fn hash_code(code: &str) -> String {
        let digest = Sha256::digest(code.as_bytes());
        hex_encode(&digest)
    }

    /// Build a new strategy record. `parent` supplies the generation bump;
    /// pass `None` for a root strategy.
    pub fn new(
        name: impl Into<String>,
        code: impl Into<String>,
        parent: Option<&Strategy>,
        metadata: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        let code = code.into();
        let code_hash = Self::hash_code(&code);
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            code,
            code_hash,
            parent_id: parent.map(|p| p.id),
            generation: parent.map_or(0, |p| p.generation + 1),
            description: None,
            tags: Vec::new(),
            metadata,
            created_at: now,
        }
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        let a = Strategy::hash_code("buy low sell high");
        let b = Strategy::hash_code("buy low sell high");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn different_code_differs() {
        assert_ne!(Strategy::hash_code("a"), Strategy::hash_code("b"));
    }

    #[test]
    fn generation_increments_from_parent() {
        let now = Utc::now();
        let root = Strategy::new("root", "code", None, serde_json::json!({}), now);
        assert_eq!(root.generation, 0);
        let child = Strategy::new("child", "code2", Some(&root), serde_json::json!({}), now);
        assert_eq!(child.generation, 1);
        assert_eq!(child.parent_id, Some(root.id));
    }
}

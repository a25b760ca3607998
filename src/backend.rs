//! Seam to the external business layer: scoring, round finalization on the
//! rewards ledger, and durable snapshot uploads. Everything behind
//! [`RewardsBackend`] is opaque to the orchestration core.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{ControllerError, Result};

/// One scoring entry. Entries sharing a `beneficiary` are batched together
/// and never split across score batches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ScoreEntry {
    pub beneficiary: String,
    pub operator: String,
    /// Stake amount as a decimal string; magnitudes exceed u64.
    pub staked: String,
    /// Share of the operator's relays observed running, in [0, 1].
    pub running: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SnapshotSummary {
    pub rewards: String,
    pub ratings: String,
    pub stakes: String,
}

/// Finalized per-round snapshot returned by the rewards ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RoundSnapshot {
    /// Round stamp in milliseconds.
    pub timestamp: u64,
    /// Elapsed round period in seconds.
    pub period: u64,
    #[serde(default)]
    pub summary: SnapshotSummary,
    /// The upstream process encodes empty maps as empty arrays; normalize
    /// that here, at the adapter boundary, so DAG logic never sees it.
    #[serde(default, deserialize_with = "map_or_empty_seq")]
    pub details: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct UploadReceipt {
    pub id: String,
}

/// External business layer. Implementations are expected to be idempotent
/// per round stamp: jobs are delivered at least once.
#[async_trait]
pub trait RewardsBackend: Send + Sync {
    /// Compute the current ordered score list for the round.
    async fn compute_current_scores(&self, stamp: u64) -> Result<Vec<ScoreEntry>>;

    /// Submit one score batch. `Ok(false)` is an explicit business-level
    /// rejection; transport failures surface as `Err`.
    async fn submit_score_batch(&self, stamp: u64, batch: &[ScoreEntry]) -> Result<bool>;

    /// Ask the ledger to finalize the round.
    async fn finalize_round(&self, stamp: u64) -> Result<bool>;

    /// Fetch the latest finalized snapshot, if any.
    async fn fetch_latest_snapshot(&self) -> Result<Option<RoundSnapshot>>;

    /// Upload a snapshot to durable off-chain storage.
    async fn upload_durable(&self, snapshot: &RoundSnapshot) -> Result<UploadReceipt>;
}

/// Accept either a JSON object or an (empty) JSON array for a map field.
fn map_or_empty_seq<'de, D>(deserializer: D) -> std::result::Result<HashMap<String, serde_json::Value>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::Object(map) => Ok(map.into_iter().collect()),
        serde_json::Value::Array(items) if items.is_empty() => Ok(HashMap::new()),
        serde_json::Value::Null => Ok(HashMap::new()),
        other => Err(D::Error::custom(format!(
            "expected map or empty array, got {}",
            other
        ))),
    }
}

/// Backend used when the service is not wired to a live ledger: computes
/// nothing and rejects every mutation, leaving rounds incomplete.
#[derive(Debug, Default)]
pub struct DryRunBackend;

#[async_trait]
impl RewardsBackend for DryRunBackend {
    async fn compute_current_scores(&self, stamp: u64) -> Result<Vec<ScoreEntry>> {
        tracing::warn!(stamp, "Dry-run backend: no scores computed");
        Ok(Vec::new())
    }

    async fn submit_score_batch(&self, stamp: u64, batch: &[ScoreEntry]) -> Result<bool> {
        tracing::warn!(stamp, batch = batch.len(), "Dry-run backend: not submitting scores");
        Ok(false)
    }

    async fn finalize_round(&self, stamp: u64) -> Result<bool> {
        tracing::warn!(stamp, "Dry-run backend: not finalizing round");
        Ok(false)
    }

    async fn fetch_latest_snapshot(&self) -> Result<Option<RoundSnapshot>> {
        Ok(None)
    }

    async fn upload_durable(&self, _snapshot: &RoundSnapshot) -> Result<UploadReceipt> {
        Err(ControllerError::Business(
            "dry-run backend cannot upload snapshots".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_accepts_empty_array_details() {
        let raw = r#"{
            "Timestamp": 1700000000000,
            "Period": 3600,
            "Summary": { "Rewards": "100", "Ratings": "5", "Stakes": "1000" },
            "Details": []
        }"#;
        let snapshot: RoundSnapshot = serde_json::from_str(raw).unwrap();
        assert_eq!(snapshot.timestamp, 1_700_000_000_000);
        assert!(snapshot.details.is_empty());
    }

    #[test]
    fn snapshot_accepts_map_details() {
        let raw = r#"{
            "Timestamp": 1,
            "Period": 60,
            "Details": { "0xAB": { "Score": 1 } }
        }"#;
        let snapshot: RoundSnapshot = serde_json::from_str(raw).unwrap();
        assert_eq!(snapshot.details.len(), 1);
        assert!(snapshot.details.contains_key("0xAB"));
    }

    #[test]
    fn snapshot_rejects_non_empty_array_details() {
        let raw = r#"{ "Timestamp": 1, "Period": 60, "Details": [1, 2] }"#;
        assert!(serde_json::from_str::<RoundSnapshot>(raw).is_err());
    }

    #[test]
    fn score_entry_wire_names() {
        let entry = ScoreEntry {
            beneficiary: "0xA".to_string(),
            operator: "0xB".to_string(),
            staked: "100".to_string(),
            running: 0.5,
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert!(json.get("Beneficiary").is_some());
        assert!(json.get("Staked").is_some());
    }
}

//! Long-term memory: observations and the pipeline that writes them.
//!
//! Observations come from three places: observational-mode traffic captured
//! by the router, group rollups, and explicit `memory.observation.append`
//! calls. All of them go through [`ObservationPipeline::commit`], which skips
//! entries whose dedupe key is already stored.

use crate::config::ObservationPolicy;
use crate::envelope::{CorrelationId, InboundEnvelope};
use crate::error::StorageResult;
use crate::routing::Route;
use crate::store::{append_line, read_jsonl};
use crate::util::{generate_id, timestamp_ms, truncate_str};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

/// Max characters kept from captured observational traffic.
const CAPTURE_MAX_CHARS: usize = 500;

/// Kind of observation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationCategory {
    /// Something moved forward.
    #[default]
    Progress,
    /// Something may need attention.
    Risk,
}

/// A long-term memory record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Observation {
    /// Record id.
    pub id: String,
    /// Category.
    pub category: ObservationCategory,
    /// Summary text.
    pub summary: String,
    /// Confidence in `0.0..=1.0`.
    pub confidence: f64,
    /// Whether a human should review the entry.
    pub pending_review: bool,
    /// Provenance references (correlation ids, source refs, policy refs).
    #[serde(default)]
    pub provenance: Vec<String>,
    /// Producer tag.
    pub source_tag: String,
    /// Project tags.
    #[serde(default)]
    pub project_tags: Vec<String>,
    /// Role tags.
    #[serde(default)]
    pub role_tags: Vec<String>,
    /// Trust class of the producer.
    pub trust_class: String,
    /// Group the observation belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    /// Key used to suppress duplicates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedupe_key: Option<String>,
    /// Unix milliseconds.
    pub created_at: u64,
}

/// Caller-supplied observation, as accepted by `memory.observation.append`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NewObservation {
    /// Summary text (required).
    pub summary: String,
    /// Category; defaults to progress.
    pub category: ObservationCategory,
    /// Confidence; defaults to the policy default.
    pub confidence: Option<f64>,
    /// Review flag.
    pub pending_review: bool,
    /// Provenance references.
    pub provenance: Vec<String>,
    /// Producer tag; defaults to `manual`.
    pub source_tag: Option<String>,
    /// Project tags.
    pub project_tags: Vec<String>,
    /// Role tags.
    pub role_tags: Vec<String>,
    /// Trust class; defaults to `operator`.
    pub trust_class: Option<String>,
    /// Group id.
    pub group_id: Option<String>,
    /// Dedupe key.
    pub dedupe_key: Option<String>,
}

impl NewObservation {
    /// Turn the request into a record.
    #[must_use]
    pub fn into_observation(self) -> Observation {
        Observation {
            id: generate_id("obs"),
            category: self.category,
            summary: self.summary,
            confidence: self.confidence.unwrap_or(0.6).clamp(0.0, 1.0),
            pending_review: self.pending_review,
            provenance: self.provenance,
            source_tag: self.source_tag.unwrap_or_else(|| "manual".to_string()),
            project_tags: self.project_tags,
            role_tags: self.role_tags,
            trust_class: self.trust_class.unwrap_or_else(|| "operator".to_string()),
            group_id: self.group_id,
            dedupe_key: self.dedupe_key,
            created_at: timestamp_ms(),
        }
    }
}

impl Observation {
    /// Build an observation under a policy.
    #[must_use]
    pub fn from_policy(
        policy: &ObservationPolicy,
        category: ObservationCategory,
        summary: impl Into<String>,
        confidence: f64,
    ) -> Self {
        Self {
            id: generate_id("obs"),
            category,
            summary: summary.into(),
            confidence,
            pending_review: false,
            provenance: policy.provenance_ref.iter().cloned().collect(),
            source_tag: policy.source_tag.clone(),
            project_tags: policy.project_tags.clone(),
            role_tags: policy.role_tags.clone(),
            trust_class: policy.trust_class.clone(),
            group_id: None,
            dedupe_key: None,
            created_at: timestamp_ms(),
        }
    }
}

/// Durable observation storage.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Append a record.
    async fn append(&self, observation: &Observation) -> StorageResult<()>;

    /// Most recent `limit` records, oldest first.
    async fn list(&self, limit: usize) -> StorageResult<Vec<Observation>>;

    /// Whether a record with `key` as dedupe key exists.
    async fn has_dedupe_key(&self, key: &str) -> StorageResult<bool>;
}

/// In-memory observation store.
#[derive(Debug, Default)]
pub struct MemoryObservationStore {
    records: RwLock<Vec<Observation>>,
}

impl MemoryObservationStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MemoryStore for MemoryObservationStore {
    async fn append(&self, observation: &Observation) -> StorageResult<()> {
        self.records.write().await.push(observation.clone());
        Ok(())
    }

    async fn list(&self, limit: usize) -> StorageResult<Vec<Observation>> {
        let records = self.records.read().await;
        let skip = records.len().saturating_sub(limit);
        Ok(records.iter().skip(skip).cloned().collect())
    }

    async fn has_dedupe_key(&self, key: &str) -> StorageResult<bool> {
        Ok(self
            .records
            .read()
            .await
            .iter()
            .any(|o| o.dedupe_key.as_deref() == Some(key)))
    }
}

/// JSON-lines observation store with an in-memory dedupe index.
#[derive(Debug)]
pub struct JsonlObservationStore {
    path: PathBuf,
    dedupe_keys: Mutex<Option<HashSet<String>>>,
}

impl JsonlObservationStore {
    /// Create a store backed by `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            dedupe_keys: Mutex::new(None),
        }
    }

    async fn with_index<R>(&self, f: impl FnOnce(&mut HashSet<String>) -> R) -> StorageResult<R> {
        let mut guard = self.dedupe_keys.lock().await;
        if guard.is_none() {
            let records = read_jsonl::<Observation>(&self.path).await?;
            *guard = Some(records.into_iter().filter_map(|o| o.dedupe_key).collect());
        }
        let index = guard.get_or_insert_with(HashSet::new);
        Ok(f(index))
    }
}

#[async_trait]
impl MemoryStore for JsonlObservationStore {
    async fn append(&self, observation: &Observation) -> StorageResult<()> {
        let mut line = serde_json::to_string(observation)?;
        line.push('\n');
        append_line(&self.path, &line).await?;
        if let Some(key) = &observation.dedupe_key {
            let key = key.clone();
            self.with_index(|index| index.insert(key)).await?;
        }
        Ok(())
    }

    async fn list(&self, limit: usize) -> StorageResult<Vec<Observation>> {
        let records = read_jsonl::<Observation>(&self.path).await?;
        let skip = records.len().saturating_sub(limit);
        Ok(records.into_iter().skip(skip).collect())
    }

    async fn has_dedupe_key(&self, key: &str) -> StorageResult<bool> {
        self.with_index(|index| index.contains(key)).await
    }
}

/// Writes observations to a [`MemoryStore`].
#[derive(Clone)]
pub struct ObservationPipeline {
    store: Arc<dyn MemoryStore>,
    capture_observational: bool,
}

impl std::fmt::Debug for ObservationPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservationPipeline")
            .field("capture_observational", &self.capture_observational)
            .finish_non_exhaustive()
    }
}

impl ObservationPipeline {
    /// Create a pipeline over `store`.
    pub fn new(store: Arc<dyn MemoryStore>) -> Self {
        Self {
            store,
            capture_observational: true,
        }
    }

    /// Enable or disable capture of observational traffic.
    #[must_use]
    pub const fn with_capture(mut self, enabled: bool) -> Self {
        self.capture_observational = enabled;
        self
    }

    /// Underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn MemoryStore> {
        &self.store
    }

    /// Commit an observation. Returns `false` when its dedupe key already exists.
    pub async fn commit(&self, observation: Observation) -> StorageResult<bool> {
        if let Some(key) = &observation.dedupe_key
            && self.store.has_dedupe_key(key).await?
        {
            debug!(dedupe_key = %key, "observation already stored");
            return Ok(false);
        }
        self.append(&observation).await?;
        Ok(true)
    }

    /// Append an observation without consulting stored dedupe keys.
    pub async fn append(&self, observation: &Observation) -> StorageResult<()> {
        self.store.append(observation).await?;
        info!(
            id = %observation.id,
            category = ?observation.category,
            source_tag = %observation.source_tag,
            "observation committed"
        );
        Ok(())
    }

    /// Capture one observational-mode message.
    pub async fn capture(
        &self,
        envelope: &InboundEnvelope,
        route: &Route,
        correlation_id: &CorrelationId,
    ) -> StorageResult<Option<Observation>> {
        if !self.capture_observational {
            return Ok(None);
        }
        let summary = truncate_str(
            &format!("{}: {}", envelope.sender_label(), envelope.content),
            CAPTURE_MAX_CHARS,
        );
        let observation = Observation {
            id: generate_id("obs"),
            category: ObservationCategory::Progress,
            summary,
            confidence: 0.6,
            pending_review: false,
            provenance: vec![
                correlation_id.to_string(),
                format!("{}:{}", envelope.channel_id, envelope.source_id),
            ],
            source_tag: format!("observational:{}", envelope.channel_id),
            project_tags: Vec::new(),
            role_tags: Vec::new(),
            trust_class: "channel".to_string(),
            group_id: route.group_id.clone(),
            dedupe_key: Some(format!("capture:{correlation_id}")),
            created_at: timestamp_ms(),
        };
        let committed = self.commit(observation.clone()).await?;
        Ok(committed.then_some(observation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::MessageMode;
    use crate::routing::{BusyPolicy, SessionKey};

    fn keyed(key: &str) -> Observation {
        NewObservation {
            summary: "shipped".into(),
            dedupe_key: Some(key.into()),
            ..NewObservation::default()
        }
        .into_observation()
    }

    #[tokio::test]
    async fn test_commit_skips_duplicate_keys() {
        let pipeline = ObservationPipeline::new(Arc::new(MemoryObservationStore::new()));
        assert!(pipeline.commit(keyed("k1")).await.unwrap());
        assert!(!pipeline.commit(keyed("k1")).await.unwrap());
        assert!(pipeline.commit(keyed("k2")).await.unwrap());
        assert_eq!(pipeline.store().list(10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_jsonl_store_rebuilds_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory").join("observations.jsonl");

        let store = JsonlObservationStore::new(&path);
        store.append(&keyed("k1")).await.unwrap();

        let reopened = JsonlObservationStore::new(&path);
        assert!(reopened.has_dedupe_key("k1").await.unwrap());
        assert!(!reopened.has_dedupe_key("k2").await.unwrap());
        assert_eq!(reopened.list(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_capture_observational() {
        let pipeline = ObservationPipeline::new(Arc::new(MemoryObservationStore::new()));
        let env = InboundEnvelope::new("slack", "C1", "u1", "deploy done").with_sender_name("Ana");
        let route = Route {
            group_id: Some("eng".into()),
            session_key: SessionKey::for_group("eng"),
            allow_from: vec![],
            mode: MessageMode::Observational,
            busy_policy: BusyPolicy::Queue,
        };
        let corr = CorrelationId::generate();

        let obs = pipeline.capture(&env, &route, &corr).await.unwrap().unwrap();
        assert_eq!(obs.summary, "Ana: deploy done");
        assert_eq!(obs.group_id.as_deref(), Some("eng"));
        assert!(obs.provenance.contains(&corr.to_string()));

        let disabled = pipeline.clone().with_capture(false);
        assert!(disabled.capture(&env, &route, &corr).await.unwrap().is_none());
    }

    #[test]
    fn test_new_observation_defaults() {
        let obs: NewObservation = serde_json::from_str(r#"{"summary":"x","confidence":3.0}"#).unwrap();
        let obs = obs.into_observation();
        assert_eq!(obs.category, ObservationCategory::Progress);
        assert!((obs.confidence - 1.0).abs() < f64::EPSILON);
        assert_eq!(obs.source_tag, "manual");
    }
}

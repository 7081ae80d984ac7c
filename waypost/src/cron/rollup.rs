//! Group rollup: compresses a group's recent inbound traffic into a bounded
//! number of deduplicated, confidence-scored observations.
//!
//! Every group with an enabled `rollup` block owns one cron job with id
//! `group:<groupId>:daily-rollup`. When that job completes (or when the
//! aggregation is requested directly) the aggregator scans the message store,
//! buckets messages per `(channel, source)`, ranks the buckets and commits at
//! most `maxWrites` observations through the memory pipeline.

use super::job::{CronJobDefinition, CronRun};
use super::scheduler::{CronManager, JobCompletionHandler};
use crate::config::{GatewayConfig, GroupConfig, RollupConfig};
use crate::error::{CronResult, GatewayError, Result};
use crate::memory::{Observation, ObservationCategory, ObservationPipeline};
use crate::routing::SessionKey;
use crate::store::{MessageStore, StoredMessage};
use crate::util::{timestamp_ms, truncate_str};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

const ROLLUP_JOB_PREFIX: &str = "group:";
const ROLLUP_JOB_SUFFIX: &str = ":daily-rollup";
const MS_PER_HOUR: u64 = 3_600_000;
const MS_PER_MINUTE: u64 = 60_000;

/// Id of the rollup job owned by `group_id`.
#[must_use]
pub fn rollup_job_id(group_id: &str) -> String {
    format!("{ROLLUP_JOB_PREFIX}{group_id}{ROLLUP_JOB_SUFFIX}")
}

/// Group id of a rollup job id, if it is one.
#[must_use]
pub fn rollup_group_of(job_id: &str) -> Option<&str> {
    job_id
        .strip_prefix(ROLLUP_JOB_PREFIX)?
        .strip_suffix(ROLLUP_JOB_SUFFIX)
        .filter(|g| !g.is_empty())
}

/// Confidence of an entry seen `count` times: 0.55 plus one point per
/// message, capped at 0.95 from 40 messages on.
#[must_use]
pub fn confidence_from_count(count: usize) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    let bonus = count.min(40) as f64 / 100.0;
    (0.55 + bonus).min(0.95)
}

/// Dedupe key of an entry within one time bucket.
#[must_use]
pub fn dedupe_bucket_key(group_id: &str, channel_id: &str, source_ref: &str, bucket: u64) -> String {
    format!("rollup:{group_id}:{channel_id}:{source_ref}:{bucket}")
}

/// Bucket index of `timestamp_ms` for buckets `bucket_minutes` wide.
#[must_use]
pub fn bucket_of(timestamp_ms: u64, bucket_minutes: u64) -> u64 {
    timestamp_ms / bucket_minutes.max(1).saturating_mul(MS_PER_MINUTE)
}

/// Per `(channel, source)` aggregate within the lookback window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RollupAggregateEntry {
    /// Channel id.
    pub channel_id: String,
    /// Source id.
    pub source_id: String,
    /// Messages seen.
    pub count: usize,
    /// Timestamp of the newest message.
    pub latest_timestamp: u64,
    /// Content of the newest message.
    pub sample: String,
    /// `<channel>:<source>`.
    pub source_ref: String,
}

/// Bucket `messages` that belong to `group_id` into ranked entries.
///
/// Ranking is count descending, then latest timestamp descending, then
/// source ref; the result is truncated to `max_writes`.
#[must_use]
pub fn collect_entries(
    group_id: &str,
    group: &GroupConfig,
    messages: &[StoredMessage],
    max_writes: usize,
) -> Vec<RollupAggregateEntry> {
    let mut buckets: BTreeMap<(String, String), RollupAggregateEntry> = BTreeMap::new();
    for message in messages {
        if message.meta.group_id.as_deref() != Some(group_id) || !group.has_channel(&message.channel_id) {
            continue;
        }
        let entry = buckets
            .entry((message.channel_id.clone(), message.source_id.clone()))
            .or_insert_with(|| RollupAggregateEntry {
                channel_id: message.channel_id.clone(),
                source_id: message.source_id.clone(),
                count: 0,
                latest_timestamp: 0,
                sample: String::new(),
                source_ref: format!("{}:{}", message.channel_id, message.source_id),
            });
        entry.count += 1;
        if message.timestamp >= entry.latest_timestamp {
            entry.latest_timestamp = message.timestamp;
            entry.sample.clone_from(&message.content);
        }
    }

    let mut entries: Vec<RollupAggregateEntry> = buckets.into_values().collect();
    entries.sort_by(|a, b| {
        b.count
            .cmp(&a.count)
            .then(b.latest_timestamp.cmp(&a.latest_timestamp))
            .then_with(|| a.source_ref.cmp(&b.source_ref))
    });
    entries.truncate(max_writes);
    entries
}

fn entry_observation(
    group_id: &str,
    rollup: &RollupConfig,
    entry: &RollupAggregateEntry,
) -> Observation {
    let confidence = confidence_from_count(entry.count);
    let low = confidence < rollup.low_confidence_threshold;
    let category = if low {
        ObservationCategory::Risk
    } else {
        ObservationCategory::Progress
    };
    let summary = truncate_str(
        &format!(
            "{} messages from {} in the last {}h; latest: {}",
            entry.count, entry.source_ref, rollup.lookback_hours, entry.sample
        ),
        rollup.summary_max_chars,
    );

    let mut observation = Observation::from_policy(&rollup.observation, category, summary, confidence);
    observation.pending_review = low;
    observation.provenance.push(entry.source_ref.clone());
    observation.group_id = Some(group_id.to_string());
    observation.dedupe_key = Some(dedupe_bucket_key(
        group_id,
        &entry.channel_id,
        &entry.source_ref,
        bucket_of(entry.latest_timestamp, rollup.dedupe_bucket_minutes),
    ));
    observation
}

/// Result of one aggregation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RollupReport {
    /// Group id.
    pub group_id: String,
    /// Inbound messages scanned.
    pub scanned: usize,
    /// Ranked entries kept.
    pub entries: Vec<RollupAggregateEntry>,
    /// Observations committed.
    pub written: Vec<Observation>,
    /// Entries skipped because their dedupe key already came up in this run.
    pub duplicates: usize,
}

/// Runs rollups against the message store and the memory pipeline.
#[derive(Clone)]
pub struct GroupRollup {
    config: Arc<GatewayConfig>,
    store: Arc<dyn MessageStore>,
    pipeline: ObservationPipeline,
}

impl std::fmt::Debug for GroupRollup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupRollup")
            .field("groups", &self.config.groups.len())
            .finish_non_exhaustive()
    }
}

impl GroupRollup {
    /// Create an aggregator.
    pub fn new(config: Arc<GatewayConfig>, store: Arc<dyn MessageStore>, pipeline: ObservationPipeline) -> Self {
        Self {
            config,
            store,
            pipeline,
        }
    }

    /// Aggregate `group_id` as of `now`.
    ///
    /// Groups without a rollup block use the default rollup settings. Entries
    /// are deduplicated by bucket key within the run only; a later run writes
    /// its own observations.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::NotFound`] for unknown groups and storage errors.
    pub async fn aggregate(&self, group_id: &str, now: u64) -> Result<RollupReport> {
        let group = self
            .config
            .groups
            .get(group_id)
            .ok_or_else(|| GatewayError::not_found(format!("group {group_id}")))?;
        let defaults = RollupConfig::default();
        let rollup = group.rollup.as_ref().unwrap_or(&defaults);

        let since = now.saturating_sub(rollup.lookback_hours.saturating_mul(MS_PER_HOUR));
        let messages = self.store.recent_inbound(since, rollup.max_inputs).await?;
        let entries = collect_entries(group_id, group, &messages, rollup.max_writes);

        let mut seen = HashSet::new();
        let mut written = Vec::new();
        let mut duplicates = 0;
        for entry in &entries {
            let observation = entry_observation(group_id, rollup, entry);
            let key = observation.dedupe_key.clone().unwrap_or_default();
            if !seen.insert(key) {
                duplicates += 1;
                continue;
            }
            self.pipeline.append(&observation).await?;
            written.push(observation);
        }

        info!(
            group = %group_id,
            scanned = messages.len(),
            entries = entries.len(),
            written = written.len(),
            duplicates,
            "group rollup aggregated"
        );
        Ok(RollupReport {
            group_id: group_id.to_string(),
            scanned: messages.len(),
            entries,
            written,
            duplicates,
        })
    }
}

#[async_trait]
impl JobCompletionHandler for GroupRollup {
    async fn on_complete(&self, job: &CronJobDefinition, _run: &CronRun) {
        let Some(group_id) = rollup_group_of(&job.id) else {
            return;
        };
        if let Err(e) = self.aggregate(group_id, timestamp_ms()).await {
            warn!(job_id = %job.id, error = %e, "group rollup failed");
        }
    }
}

fn rollup_prompt(group_id: &str, group: &GroupConfig, rollup: &RollupConfig) -> String {
    let sources: Vec<String> = group
        .sources
        .iter()
        .map(|s| {
            if s.sources.is_empty() {
                format!("{} (all sources)", s.channel)
            } else {
                format!("{} ({})", s.channel, s.sources.join(", "))
            }
        })
        .collect();
    format!(
        "Daily rollup for group {}. Summarize progress and risks from the last {} hours across: {}.",
        group.name.as_deref().unwrap_or(group_id),
        rollup.lookback_hours,
        sources.join("; ")
    )
}

/// Outcome of a rollup job resync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RollupSync {
    /// Job ids created or refreshed.
    pub upserted: Vec<String>,
    /// Job ids removed.
    pub removed: Vec<String>,
}

/// Make the rollup jobs in `manager` match the groups in `config`.
pub async fn sync_rollup_jobs(manager: &CronManager, config: &GatewayConfig) -> CronResult<RollupSync> {
    let mut sync = RollupSync::default();
    let mut desired = BTreeSet::new();

    for (group_id, group) in &config.groups {
        let Some(rollup) = group.active_rollup() else {
            continue;
        };
        let id = rollup_job_id(group_id);
        let job = CronJobDefinition::new(
            id.clone(),
            format!("{} daily rollup", group.name.as_deref().unwrap_or(group_id)),
            rollup.schedule.clone(),
            rollup_prompt(group_id, group, rollup),
            SessionKey::for_group(group_id),
        )?
        .with_observation(rollup.observation.clone());
        manager.upsert(job).await?;
        desired.insert(id.clone());
        sync.upserted.push(id);
    }

    for job in manager.list().await? {
        if rollup_group_of(&job.id).is_some() && !desired.contains(&job.id) {
            manager.remove(&job.id).await?;
            sync.removed.push(job.id);
        }
    }

    debug!(upserted = sync.upserted.len(), removed = sync.removed.len(), "rollup jobs synced");
    Ok(sync)
}

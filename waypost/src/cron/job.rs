//! Cron job definitions and run records.

use crate::config::ObservationPolicy;
use crate::envelope::CorrelationId;
use crate::error::{CronError, CronResult};
use crate::routing::SessionKey;
use crate::util::{generate_id, timestamp_ms};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for a cron job.
pub type CronJobId = String;

/// Parse a 5-field (or 6-field, with seconds) cron expression.
///
/// # Errors
///
/// Returns [`CronError::InvalidSchedule`] if the expression does not parse.
pub fn parse_schedule(expression: &str) -> CronResult<croner::Cron> {
    croner::Cron::new(expression)
        .with_seconds_optional()
        .parse()
        .map_err(|e| CronError::InvalidSchedule {
            expression: expression.to_string(),
            reason: e.to_string(),
        })
}

/// Next occurrence strictly after `after_ms`, in Unix milliseconds.
#[must_use]
pub fn next_occurrence(cron: &croner::Cron, after_ms: u64) -> Option<u64> {
    let after = DateTime::<Utc>::from_timestamp_millis(i64::try_from(after_ms).ok()?)?;
    cron.find_next_occurrence(&after, false)
        .ok()
        .and_then(|next| u64::try_from(next.timestamp_millis()).ok())
}

/// A scheduled job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJobDefinition {
    /// Unique job identifier.
    pub id: CronJobId,
    /// Human-readable name.
    pub name: String,
    /// Cron expression.
    pub schedule: String,
    /// Prompt sent to the backend.
    pub prompt: String,
    /// Session the prompt is sent to.
    pub session_key: SessionKey,
    /// Whether the job runs.
    pub enabled: bool,
    /// Policy for observations written on completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observation: Option<ObservationPolicy>,
    /// Unix milliseconds.
    pub created_at: u64,
    /// Unix milliseconds.
    pub updated_at: u64,
    /// Unix milliseconds of the last run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<u64>,
    /// Unix milliseconds of the next run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<u64>,
}

impl CronJobDefinition {
    /// Create an enabled job.
    ///
    /// # Errors
    ///
    /// Returns an error if the schedule does not parse.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        schedule: impl Into<String>,
        prompt: impl Into<String>,
        session_key: SessionKey,
    ) -> CronResult<Self> {
        let now = timestamp_ms();
        let mut job = Self {
            id: id.into(),
            name: name.into(),
            schedule: schedule.into(),
            prompt: prompt.into(),
            session_key,
            enabled: true,
            observation: None,
            created_at: now,
            updated_at: now,
            last_run_at: None,
            next_run_at: None,
        };
        job.reschedule(now)?;
        Ok(job)
    }

    /// Attach an observation policy.
    #[must_use]
    pub fn with_observation(mut self, policy: ObservationPolicy) -> Self {
        self.observation = Some(policy);
        self
    }

    /// Recompute `next_run_at` from `now`.
    ///
    /// # Errors
    ///
    /// Returns an error if the schedule does not parse.
    pub fn reschedule(&mut self, now: u64) -> CronResult<()> {
        let cron = parse_schedule(&self.schedule)?;
        self.next_run_at = if self.enabled {
            next_occurrence(&cron, now)
        } else {
            None
        };
        Ok(())
    }

    /// Whether the job is due at `now`.
    #[must_use]
    pub fn is_due(&self, now: u64) -> bool {
        self.enabled && self.next_run_at.is_some_and(|next| next <= now)
    }

    /// Apply a patch.
    ///
    /// # Errors
    ///
    /// Returns an error if the patched schedule does not parse.
    pub fn apply(&mut self, patch: CronJobPatch, now: u64) -> CronResult<()> {
        if let Some(name) = patch.name {
            self.name = name;
        }
        if let Some(schedule) = patch.schedule {
            parse_schedule(&schedule)?;
            self.schedule = schedule;
        }
        if let Some(prompt) = patch.prompt {
            self.prompt = prompt;
        }
        if let Some(session_key) = patch.session_key {
            self.session_key = session_key;
        }
        if let Some(enabled) = patch.enabled {
            self.enabled = enabled;
        }
        if let Some(observation) = patch.observation {
            self.observation = Some(observation);
        }
        self.updated_at = now;
        self.reschedule(now)
    }
}

/// Parameters for creating a job.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCronJob {
    /// Job id; generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    /// Human-readable name; defaults to the id.
    #[serde(default)]
    pub name: Option<String>,
    /// Cron expression.
    pub schedule: String,
    /// Prompt.
    pub prompt: String,
    /// Target session.
    pub session_key: SessionKey,
    /// Enabled flag; defaults to true.
    #[serde(default)]
    pub enabled: Option<bool>,
    /// Observation policy.
    #[serde(default)]
    pub observation: Option<ObservationPolicy>,
}

impl NewCronJob {
    /// Build the definition.
    ///
    /// # Errors
    ///
    /// Returns an error if the schedule does not parse.
    pub fn into_definition(self) -> CronResult<CronJobDefinition> {
        let id = self.id.unwrap_or_else(|| generate_id("job"));
        let name = self.name.unwrap_or_else(|| id.clone());
        let mut job = CronJobDefinition::new(id, name, self.schedule, self.prompt, self.session_key)?;
        job.observation = self.observation;
        if self.enabled == Some(false) {
            job.enabled = false;
            job.next_run_at = None;
        }
        Ok(job)
    }
}

/// Partial update of a job.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CronJobPatch {
    /// New name.
    pub name: Option<String>,
    /// New schedule.
    pub schedule: Option<String>,
    /// New prompt.
    pub prompt: Option<String>,
    /// New target session.
    pub session_key: Option<SessionKey>,
    /// New enabled flag.
    pub enabled: Option<bool>,
    /// New observation policy.
    pub observation: Option<ObservationPolicy>,
}

/// Outcome of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Backend answered.
    Ok,
    /// Backend failed or was unavailable.
    Error,
}

/// One entry of the run log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronRun {
    /// Unix milliseconds when the run started.
    pub timestamp: u64,
    /// Job id.
    pub job_id: CronJobId,
    /// Correlation id of the run.
    pub correlation_id: CorrelationId,
    /// Outcome.
    pub status: RunStatus,
    /// Backend reply or error text.
    pub detail: String,
    /// Wall time of the run.
    pub elapsed_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_schedule() {
        assert!(parse_schedule("0 2 * * *").is_ok());
        assert!(parse_schedule("*/30 * * * * *").is_ok());
        assert!(matches!(
            parse_schedule("every tuesday"),
            Err(CronError::InvalidSchedule { .. })
        ));
    }

    #[test]
    fn test_next_occurrence_daily() {
        let cron = parse_schedule("0 2 * * *").unwrap();
        // 2024-05-01T00:00:00Z
        let base = 1_714_521_600_000;
        assert_eq!(next_occurrence(&cron, base), Some(base + 2 * 3_600_000));
    }

    #[test]
    fn test_new_job_is_scheduled() {
        let job = CronJobDefinition::new(
            "daily",
            "Daily",
            "0 9 * * *",
            "summarize",
            SessionKey::for_group("eng"),
        )
        .unwrap();
        assert!(job.enabled);
        assert!(job.next_run_at.is_some_and(|n| n > job.created_at));
        assert!(!job.is_due(job.created_at));
    }

    #[test]
    fn test_patch_disables_and_validates() {
        let mut job =
            CronJobDefinition::new("j", "J", "0 9 * * *", "p", SessionKey::for_group("eng")).unwrap();

        job.apply(
            CronJobPatch {
                enabled: Some(false),
                ..CronJobPatch::default()
            },
            1,
        )
        .unwrap();
        assert!(!job.enabled);
        assert!(job.next_run_at.is_none());

        let err = job.apply(
            CronJobPatch {
                schedule: Some("bogus".into()),
                ..CronJobPatch::default()
            },
            2,
        );
        assert!(err.is_err());
        assert_eq!(job.schedule, "0 9 * * *");
    }

    #[test]
    fn test_new_cron_job_params() {
        let params: NewCronJob = serde_json::from_value(serde_json::json!({
            "schedule": "0 9 * * 1",
            "prompt": "weekly review",
            "sessionKey": "telegram:chat-1",
            "enabled": false
        }))
        .unwrap();
        let job = params.into_definition().unwrap();
        assert!(job.id.starts_with("job_"));
        assert_eq!(job.name, job.id);
        assert!(!job.enabled);
    }
}

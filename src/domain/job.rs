//! Job record and request types (spec §3.4, §3.5).

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Done,
    Failed,
    Canceled,
    Restored,
}

impl JobState {
    pub fn is_active(self) -> bool {
        matches!(self, JobState::Queued | JobState::Running)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Failed | JobState::Canceled)
    }
}

/// A caller-submitted request (spec §3.5). `params.targets`, when present,
/// is consulted by the dispatcher ahead of directory scanning.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobRequest {
    pub task: String,
    #[serde(default)]
    pub directory: Option<String>,
    #[serde(default)]
    pub recursive: bool,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub params: HashMap<String, Value>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub priority: bool,
}

impl JobRequest {
    pub fn targets(&self) -> Option<Vec<String>> {
        let arr = self.params.get("targets")?.as_array()?;
        Some(
            arr.iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect(),
        )
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: String,
    pub path: String,
    pub state: JobState,
    pub created_at: u64,
    pub started_at: Option<u64>,
    pub ended_at: Option<u64>,
    pub total: u64,
    pub processed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    pub priority: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub request: JobRequest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta_batch: Option<String>,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub pause_requeue: bool,
    /// Last-activity timestamp (ms since epoch), used by the orphan reaper.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_ms: Option<u64>,
}

impl Job {
    pub fn new(id: String, request: JobRequest, task_type: String, path: String) -> Self {
        let now = now_secs();
        Self {
            id,
            task_type,
            path,
            state: JobState::Queued,
            created_at: now,
            started_at: None,
            ended_at: None,
            total: 0,
            processed: 0,
            current: None,
            error: None,
            result: None,
            priority: request.priority,
            label: request.label.clone(),
            meta_batch: None,
            paused: false,
            pause_requeue: false,
            last_heartbeat_ms: None,
            request,
        }
    }

    /// Integer percentage 0..100, `None` when counters are insufficient to
    /// derive a meaningful ratio (spec §3.4 "progress (derived percentage)").
    pub fn progress_percent(&self) -> Option<u64> {
        if self.total == 0 {
            return None;
        }
        Some(((self.processed.min(self.total) * 100) / self.total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_percent_none_without_total() {
        let job = Job::new("abc".into(), JobRequest::default(), "thumbnail".into(), "x".into());
        assert_eq!(job.progress_percent(), None);
    }

    #[test]
    fn progress_percent_clamped_to_total() {
        let mut job = Job::new("abc".into(), JobRequest::default(), "thumbnail".into(), "x".into());
        job.total = 4;
        job.processed = 10; // should never happen, but clamp defensively
        assert_eq!(job.progress_percent(), Some(100));
    }

    #[test]
    fn job_state_active_terminal_partition() {
        assert!(JobState::Queued.is_active());
        assert!(JobState::Running.is_active());
        assert!(!JobState::Done.is_active());
        assert!(JobState::Done.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Canceled.is_terminal());
        assert!(!JobState::Restored.is_terminal());
    }
}

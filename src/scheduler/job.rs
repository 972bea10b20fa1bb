use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Field names accepted as the job identifier, in order of preference.
pub const ID_FIELDS: [&str; 2] = ["jobid", "id"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Dispatched,
    Done,
    Failed,
}

impl JobStatus {
    /// Queued and dispatched jobs make up the "active jobs" view.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Dispatched)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Dispatched => write!(f, "dispatched"),
            JobStatus::Done => write!(f, "done"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Caller-supplied job identifier. Opaque and not guaranteed unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Value);

impl JobId {
    /// Only strings and numbers are accepted as identifiers.
    pub fn new(value: Value) -> Option<Self> {
        match value {
            Value::String(_) | Value::Number(_) => Some(Self(value)),
            _ => None,
        }
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }
}

impl From<u64> for JobId {
    fn from(id: u64) -> Self {
        Self(Value::from(id))
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self(Value::from(id))
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.0 {
            Value::String(s) => write!(f, "{}", s),
            other => write!(f, "{}", other),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    /// Queue-assigned sequence number; unique for the lifetime of the Manager.
    pub seq: u64,
    pub id: JobId,
    pub payload: Map<String, Value>,
    pub status: JobStatus,
    pub submitted_at: DateTime<Utc>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(id: JobId, payload: Map<String, Value>) -> Self {
        Self {
            seq: 0,
            id,
            payload,
            status: JobStatus::Queued,
            submitted_at: Utc::now(),
            dispatched_at: None,
            finished_at: None,
        }
    }

    /// Build a job from one submitted description.
    ///
    /// The identifier is taken from `jobid` (or `id`); every other field is
    /// kept as the opaque payload.
    pub fn from_description(value: Value) -> Result<Self, String> {
        let Value::Object(mut fields) = value else {
            return Err("job description must be a JSON object".to_string());
        };

        let raw_id = ID_FIELDS
            .iter()
            .find_map(|name| fields.remove(*name))
            .ok_or_else(|| "job description is missing a \"jobid\" field".to_string())?;

        let id = JobId::new(raw_id)
            .ok_or_else(|| "job identifier must be a string or a number".to_string())?;

        Ok(Self::new(id, fields))
    }

    /// The message written to the streaming endpoint: `{"jobid": .., ...payload}`.
    pub fn stream_message(&self) -> Value {
        let mut message = Map::with_capacity(self.payload.len() + 1);
        message.insert("jobid".to_string(), self.id.as_value().clone());
        for (key, value) in &self.payload {
            message.insert(key.clone(), value.clone());
        }
        Value::Object(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn description_with_jobid() {
        let job = Job::from_description(json!({"jobid": 42, "data": "text"})).unwrap();
        assert_eq!(job.id, JobId::from(42));
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.payload.get("data"), Some(&json!("text")));
        assert!(!job.payload.contains_key("jobid"));
    }

    #[test]
    fn description_with_plain_id() {
        let job = Job::from_description(json!({"id": "doc-1"})).unwrap();
        assert_eq!(job.id.to_string(), "doc-1");
    }

    #[test]
    fn jobid_wins_over_id() {
        let job = Job::from_description(json!({"jobid": 1, "id": 2})).unwrap();
        assert_eq!(job.id, JobId::from(1));
        // The other field stays part of the payload.
        assert_eq!(job.payload.get("id"), Some(&json!(2)));
    }

    #[test]
    fn description_errors() {
        assert!(Job::from_description(json!("status")).is_err());
        assert!(Job::from_description(json!({"data": 1})).is_err());
        assert!(Job::from_description(json!({"jobid": null})).is_err());
        assert!(Job::from_description(json!({"jobid": [1]})).is_err());
    }

    #[test]
    fn stream_message_carries_id_and_payload() {
        let job = Job::from_description(json!({"jobid": 7, "data": "x"})).unwrap();
        assert_eq!(job.stream_message(), json!({"jobid": 7, "data": "x"}));
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(serde_json::to_value(JobStatus::Dispatched).unwrap(), json!("dispatched"));
        assert!(JobStatus::Queued.is_active());
        assert!(!JobStatus::Done.is_active());
    }
}

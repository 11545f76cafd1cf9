use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Job identifiers double as event stream ids and lock keys
pub type JobId = String;

pub type PartitionId = u32;

/// Priority tier; each tier is served by its own execution pool
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    /// One tier lower; `Low` stays `Low`
    pub fn demote(self) -> Self {
        match self {
            Self::Critical => Self::High,
            Self::High => Self::Normal,
            Self::Normal | Self::Low => Self::Low,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "critical" => Ok(Self::Critical),
            "high" => Ok(Self::High),
            "normal" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            _ => Err(format!("Invalid priority: {s}")),
        }
    }
}

/// One step of a job, executed by the registered step collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    pub name: String,
    #[serde(default)]
    pub params: Value,
    /// Failures of optional steps are recorded and the job carries on
    #[serde(default)]
    pub optional: bool,
}

impl StepSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Value::Null,
            optional: false,
        }
    }
}

/// Job submission accepted by `ExecutionEngine::execute_job`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobData {
    pub id: JobId,
    #[serde(default)]
    pub priority: Priority,
    pub steps: Vec<StepSpec>,
    /// Mirror state to secondary partitions and verify with a checkpoint
    #[serde(default)]
    pub cross_partition: bool,
    /// Opaque to the engine; handed to every step
    #[serde(default)]
    pub payload: Value,
}

impl JobData {
    pub fn new(id: impl Into<JobId>, priority: Priority) -> Self {
        Self {
            id: id.into(),
            priority,
            steps: Vec::new(),
            cross_partition: false,
            payload: Value::Null,
        }
    }

    pub fn with_step(mut self, name: impl Into<String>) -> Self {
        self.steps.push(StepSpec::new(name));
        self
    }

    pub fn with_step_params(mut self, name: impl Into<String>, params: Value) -> Self {
        let mut step = StepSpec::new(name);
        step.params = params;
        self.steps.push(step);
        self
    }

    pub fn with_optional_step(mut self, name: impl Into<String>) -> Self {
        let mut step = StepSpec::new(name);
        step.optional = true;
        self.steps.push(step);
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn cross_partition(mut self, enabled: bool) -> Self {
        self.cross_partition = enabled;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Mutable record of a job owned by the task executing it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub priority: Priority,
    pub payload: Value,
    pub status: JobStatus,
    pub assigned_partition: Option<PartitionId>,
    pub start_time: Option<DateTime<Utc>>,
    /// 1-based attempt counter, incremented on every re-queue
    pub attempt: u32,
}

impl Job {
    pub fn from_data(data: &JobData) -> Self {
        Self {
            id: data.id.clone(),
            priority: data.priority,
            payload: data.payload.clone(),
            status: JobStatus::Queued,
            assigned_partition: None,
            start_time: None,
            attempt: 1,
        }
    }
}

/// Result returned to the submitter of a successful job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOutcome {
    pub success: bool,
    pub job_id: JobId,
    pub partition_id: PartitionId,
    pub result: Value,
    pub attempts: u32,
    pub completed_steps: usize,
    /// Final priority tier; lower than submitted after a demoting re-queue
    pub priority: Priority,
}

use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Created,
    Queued,
    Running,
    WaitingApproval,
    Completed,
    Failed,
    Canceled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::WaitingApproval => "waiting_approval",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    /// Queued or running: a worker owns (or is about to own) the run.
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "waiting_approval" => Ok(Self::WaitingApproval),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

/// Approval state of the proposed patch. Gates the apply step only.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PatchDecision {
    #[default]
    No,
    Yes,
    Rejected,
}

impl PatchDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::No => "no",
            Self::Yes => "yes",
            Self::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for PatchDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PatchDecision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "no" => Ok(Self::No),
            "yes" => Ok(Self::Yes),
            "rejected" => Ok(Self::Rejected),
            other => Err(format!("Invalid decision: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Failed,
    Waiting,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Waiting => "waiting",
            Self::Skipped => "skipped",
        }
    }

    /// Pending and failed steps run, as does a step left running by a
    /// crashed attempt. Everything else is re-read from its artifact.
    pub fn needs_run(&self) -> bool {
        matches!(self, Self::Pending | Self::Failed | Self::Running)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "waiting" => Ok(Self::Waiting),
            "skipped" => Ok(Self::Skipped),
            _ => Err(format!("Invalid step status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: i64,
    pub title: String,
    pub ticket: String,
    pub workspace: String,
    pub status: RunStatus,
    pub patch_decision: PatchDecision,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: i64,
    pub run_id: i64,
    pub order: i64,
    pub name: String,
    pub status: StepStatus,
    pub summary: String,
    pub error: String,
    pub log_path: String,
    pub artifact_path: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: i64,
    pub run_id: i64,
    pub kind: String,
    pub path: String,
    pub created_at: String,
}

/// Raw run row before status/decision parsing.
pub(crate) struct RunRow {
    pub id: i64,
    pub title: String,
    pub ticket: String,
    pub workspace: String,
    pub status: String,
    pub patch_decision: String,
    pub created_at: String,
    pub updated_at: String,
}

impl RunRow {
    pub fn into_run(self) -> anyhow::Result<Run> {
        Ok(Run {
            id: self.id,
            title: self.title,
            ticket: self.ticket,
            workspace: self.workspace,
            status: RunStatus::from_str(&self.status).map_err(|e| anyhow::anyhow!(e))?,
            patch_decision: PatchDecision::from_str(&self.patch_decision).map_err(|e| anyhow::anyhow!(e))?,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

pub(crate) struct StepRow {
    pub id: i64,
    pub run_id: i64,
    pub order: i64,
    pub name: String,
    pub status: String,
    pub summary: String,
    pub error: String,
    pub log_path: String,
    pub artifact_path: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}

impl StepRow {
    pub fn into_step(self) -> anyhow::Result<Step> {
        Ok(Step {
            id: self.id,
            run_id: self.run_id,
            order: self.order,
            name: self.name,
            status: StepStatus::from_str(&self.status).map_err(|e| anyhow::anyhow!(e))?,
            summary: self.summary,
            error: self.error,
            log_path: self.log_path,
            artifact_path: self.artifact_path,
            started_at: self.started_at,
            finished_at: self.finished_at,
        })
    }
}

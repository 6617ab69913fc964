//! The eleven steps of one pipeline attempt.
//!
//! Each step checks the status it had when the attempt started: `pending`,
//! `failed` and `running` steps execute, everything else is re-read from its
//! artifact. Steps that can end the attempt return
//! `ControlFlow::Break(outcome)`.

use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::cancel::Checkpoint;
use super::plan::{model_plan, simple_plan};
use super::report::{ReportInput, render_report};
use super::{Outcome, Pipeline, PipelineStep};
use crate::backends::{PatcherMode, ProposalRequest};
use crate::config::FixloopConfig;
use crate::errors::RunError;
use crate::patch::PatchProposal;
use crate::patch::validate::CHECK_WARNING_MARKER;
use crate::signals::{extract_signals, render_signals};
use crate::store::{PatchDecision, Run, RunDb, RunStatus, Step, StepStatus};
use crate::util::head_chars;
use crate::workspace::{CommandResult, CommandRunner, WorkspaceProfile, build_code_context, search_docs};

pub(super) const PREFLIGHT_LOG: &str = "preflight.log";
pub(super) const BASELINE_LOG: &str = "baseline.log";
pub(super) const SIGNALS_JSON: &str = "signals.json";
pub(super) const SIGNALS_TXT: &str = "signals.txt";
pub(super) const CONTEXT_MD: &str = "context.md";
pub(super) const PLAN_MD: &str = "plan.md";
pub(super) const PROPOSAL_DIFF: &str = "proposal.diff";
pub(super) const PROPOSAL_MD: &str = "proposal.md";
pub(super) const PROPOSAL_JSON: &str = "proposal.json";
pub(super) const INVALID_PATCH: &str = "invalid_patch.txt";
pub(super) const FALLBACK_USED: &str = "fallback_used.txt";
pub(super) const APPLY_RESULT: &str = "apply_result.txt";
pub(super) const APPLY_ERROR: &str = "apply_error.txt";
pub(super) const POST_CHECKS_LOG: &str = "post_checks.log";
pub(super) const NEXT_ACTIONS: &str = "next_actions.md";
pub(super) const SMOKE_LOG: &str = "smoke.log";
pub(super) const REPORT_MD: &str = "report.md";

const KB_DOCS: usize = 4;
const KB_EXCERPT_CHARS: usize = 1200;
const PREVIOUS_ERROR_CHARS: usize = 4000;
const PREVIOUS_DIFF_CHARS: usize = 12_000;

/// Exit code recorded when a check command could not be spawned.
const SPAWN_FAILED_EXIT: i32 = 127;

static FAILED_COUNT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+ failed").unwrap());
static ERROR_LINE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^ERROR").unwrap());

/// Whether a post-check run counts as still failing. Shared by step 9 and
/// the repair loop.
pub(crate) fn checks_failed(exit_code: i32, output: &str) -> bool {
    exit_code != 0
        || FAILED_COUNT_RE.is_match(output)
        || output.contains("FAILED")
        || output.contains("AssertionError")
        || ERROR_LINE_RE.is_match(output)
}

/// A baseline that could not run at all, as opposed to one that found bugs.
fn is_environment_failure(res: &CommandResult) -> bool {
    res.exit_code == SPAWN_FAILED_EXIT || res.stderr.to_lowercase().contains("command not found")
}

/// Reason a freshly proposed patch must not reach the approval gate.
pub(crate) fn invalid_reason(mode: PatcherMode, proposal: &PatchProposal) -> Option<String> {
    let rationale = proposal.rationale.to_lowercase();
    if mode.is_generative()
        && rationale.contains(CHECK_WARNING_MARKER)
        && (rationale.contains("warning") || rationale.contains("fails"))
    {
        return Some(format!("patch still fails `{}` after repair attempts", CHECK_WARNING_MARKER));
    }
    if proposal.diff.trim_start().starts_with("@@") {
        return Some("diff starts with a hunk marker and has no file headers".to_string());
    }
    None
}

/// `proposal.json`: the proposal plus the backend that produced it, so the
/// apply step uses the same backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(super) struct ProposalRecord {
    #[serde(default)]
    pub patcher_mode: Option<String>,
    #[serde(flatten)]
    pub proposal: PatchProposal,
}

impl ProposalRecord {
    pub fn new(mode: PatcherMode, proposal: &PatchProposal) -> Self {
        Self {
            patcher_mode: Some(mode.as_str().to_string()),
            proposal: proposal.clone(),
        }
    }

    pub fn mode_or(&self, fallback: PatcherMode) -> PatcherMode {
        self.patcher_mode
            .as_deref()
            .map(PatcherMode::parse_or_rules)
            .unwrap_or(fallback)
    }
}

pub(super) type StepFlow = Result<ControlFlow<Outcome>, RunError>;

pub(super) struct Attempt<'p> {
    pub(super) pipeline: &'p Pipeline,
    pub(super) run: Run,
    pub(super) base: PathBuf,
    pub(super) sandbox: PathBuf,
    pub(super) profile: WorkspaceProfile,
    pub(super) patcher: PatcherMode,
    steps: Vec<Step>,
    pub(super) checkpoint: Checkpoint,
    runner: CommandRunner,
    pub(super) signals_text: String,
    pub(super) context_text: String,
    plan_text: String,
    pub(super) post_ok: bool,
    smoke_ok: bool,
}

macro_rules! proceed {
    ($step:expr) => {
        if let ControlFlow::Break(outcome) = $step.await? {
            return Ok(outcome);
        }
    };
}

impl<'p> Attempt<'p> {
    pub(super) fn new(
        pipeline: &'p Pipeline,
        run: Run,
        base: PathBuf,
        sandbox: PathBuf,
        patcher: PatcherMode,
        steps: Vec<Step>,
    ) -> Self {
        let profile = WorkspaceProfile::load(&sandbox);
        let checkpoint = Checkpoint::new(pipeline.db.clone(), run.id);
        let runner = CommandRunner::new(&sandbox);
        Self {
            pipeline,
            run,
            base,
            sandbox,
            profile,
            patcher,
            steps,
            checkpoint,
            runner,
            signals_text: String::new(),
            context_text: String::new(),
            plan_text: String::new(),
            post_ok: true,
            smoke_ok: true,
        }
    }

    pub(super) async fn drive(&mut self) -> Result<Outcome, RunError> {
        proceed!(self.preflight());
        proceed!(self.baseline());
        self.summarize().await?;
        self.context_search().await?;
        self.plan().await?;
        proceed!(self.propose());
        proceed!(self.approval_gate());
        proceed!(self.apply());
        self.post_checks().await?;
        self.auto_repair().await?;
        self.smoke().await?;
        self.report().await?;

        self.checkpoint.check().await?;
        if self.post_ok && self.smoke_ok {
            self.set_status(RunStatus::Completed).await?;
            Ok(Outcome::Completed)
        } else {
            self.set_status(RunStatus::Failed).await?;
            Ok(Outcome::failed("Completed with failing checks"))
        }
    }

    pub(super) fn config(&self) -> &FixloopConfig {
        &self.pipeline.config
    }

    pub(super) fn run_id(&self) -> i64 {
        self.run.id
    }

    fn step(&self, step: PipelineStep) -> &Step {
        &self.steps[step.order() as usize - 1]
    }

    fn needs_run(&self, step: PipelineStep) -> bool {
        self.step(step).status.needs_run()
    }

    pub(super) async fn db<F, R>(&self, f: F) -> Result<R, RunError>
    where
        F: FnOnce(&RunDb) -> anyhow::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.pipeline.db.call(f).await.map_err(RunError::Store)
    }

    /// Cancel checkpoint, then mark the step running.
    async fn begin(&self, step: PipelineStep) -> Result<(), RunError> {
        self.checkpoint.check().await?;
        let id = self.step(step).id;
        self.db(move |db| db.set_step_running(id)).await?;
        tracing::info!(run_id = self.run_id(), step = %step, order = step.order(), "step started");
        Ok(())
    }

    pub(super) async fn succeed(&self, step: PipelineStep, summary: &str, log: &str, artifact: &str) -> Result<(), RunError> {
        let id = self.step(step).id;
        let (summary, log, artifact) = (summary.to_string(), log.to_string(), artifact.to_string());
        self.db(move |db| db.set_step_success(id, &summary, &log, &artifact)).await
    }

    pub(super) async fn fail(&self, step: PipelineStep, error: &str, log: &str) -> Result<(), RunError> {
        tracing::warn!(run_id = self.run_id(), step = %step, error, "step failed");
        let id = self.step(step).id;
        let (error, log) = (error.to_string(), log.to_string());
        self.db(move |db| db.set_step_failed(id, &error, &log)).await
    }

    async fn wait(&self, step: PipelineStep, summary: &str) -> Result<(), RunError> {
        let id = self.step(step).id;
        let summary = summary.to_string();
        self.db(move |db| db.set_step_waiting(id, &summary)).await
    }

    async fn skip(&self, step: PipelineStep, summary: &str) -> Result<(), RunError> {
        let id = self.step(step).id;
        let summary = summary.to_string();
        self.db(move |db| db.set_step_skipped(id, &summary)).await
    }

    /// Status writes never overwrite a cancel made while a step was running.
    pub(super) async fn set_status(&self, status: RunStatus) -> Result<(), RunError> {
        let written = self
            .pipeline
            .db
            .advance_status(self.run_id(), status)
            .await
            .map_err(RunError::Store)?;
        if !written {
            tracing::info!(run_id = self.run_id(), %status, "cancellation observed, status left as is");
            return Err(RunError::Canceled { run_id: self.run_id() });
        }
        Ok(())
    }

    async fn set_decision(&self, decision: PatchDecision) -> Result<(), RunError> {
        self.pipeline
            .db
            .set_decision(self.run_id(), decision)
            .await
            .map_err(RunError::Store)
    }

    /// Write an artifact and return its path for step records.
    pub(super) async fn write(&self, name: &str, kind: &str, content: &str) -> Result<String, RunError> {
        let path = self
            .pipeline
            .artifacts
            .write(self.run_id(), name, kind, content)
            .await
            .map_err(RunError::Store)?;
        Ok(path.to_string_lossy().to_string())
    }

    pub(super) fn read(&self, name: &str) -> Option<String> {
        self.pipeline.artifacts.read(self.run_id(), name)
    }

    /// Artifact a finished step recorded, for resumed attempts.
    fn recorded(&self, step: PipelineStep) -> Option<String> {
        let path = &self.step(step).artifact_path;
        if path.is_empty() {
            return None;
        }
        std::fs::read_to_string(path).ok()
    }

    /// Run a check command. A spawn failure is reported like a missing tool.
    pub(super) async fn shell(&self, cmd: &str, limit: Duration) -> CommandResult {
        match self.runner.run_shell(cmd, limit).await {
            Ok(res) => res,
            Err(e) => CommandResult {
                exit_code: SPAWN_FAILED_EXIT,
                stdout: String::new(),
                stderr: format!("{:#}", e),
                timed_out: false,
            },
        }
    }

    /// Persist a proposal as `proposal.diff`, `proposal.md` and
    /// `proposal.json`. Returns the diff and markdown paths.
    pub(super) async fn write_proposal(
        &self,
        mode: PatcherMode,
        proposal: &PatchProposal,
    ) -> Result<(String, String), RunError> {
        let diff_path = self.write(PROPOSAL_DIFF, "proposal_diff", &proposal.diff).await?;
        let md = format!("# {}\n\n{}\n", proposal.title, proposal.rationale);
        let md_path = self.write(PROPOSAL_MD, "proposal_md", &md).await?;
        let record = serde_json::to_string_pretty(&ProposalRecord::new(mode, proposal))
            .map_err(|e| RunError::Other(e.into()))?;
        self.write(PROPOSAL_JSON, "proposal_json", &record).await?;
        Ok((diff_path, md_path))
    }

    // ---- steps -------------------------------------------------------

    async fn preflight(&mut self) -> StepFlow {
        let step = PipelineStep::Preflight;
        if !self.needs_run(step) {
            return Ok(ControlFlow::Continue(()));
        }
        self.begin(step).await?;

        let cmd = self.profile.preflight_command().to_string();
        let res = self.shell(&cmd, self.config().timeouts.preflight()).await;
        let log = self.write(PREFLIGHT_LOG, "preflight_log", &res.transcript(&cmd)).await?;
        if !res.success() {
            let err = RunError::Environment {
                step: step.name().to_string(),
                message: format!("`{}` exited with code {}", cmd, res.exit_code),
            };
            tracing::warn!(run_id = self.run_id(), error = %err, "preflight failed");
            self.fail(step, "Preflight failed (workspace/environment).", &log).await?;
            self.set_status(RunStatus::Failed).await?;
            return Ok(ControlFlow::Break(Outcome::failed("Preflight failed")));
        }
        self.succeed(step, &format!("OK, profile: {}", self.profile.name), &log, "")
            .await?;
        Ok(ControlFlow::Continue(()))
    }

    async fn baseline(&mut self) -> StepFlow {
        let step = PipelineStep::Baseline;
        if !self.needs_run(step) {
            return Ok(ControlFlow::Continue(()));
        }
        self.begin(step).await?;

        let cmd = self.profile.baseline.clone();
        let res = self.shell(&cmd, self.config().timeouts.test_command()).await;
        let log = self.write(BASELINE_LOG, "baseline_log", &res.transcript(&cmd)).await?;

        if is_environment_failure(&res) {
            let err = RunError::Environment {
                step: step.name().to_string(),
                message: head_chars(res.stderr.trim(), 500).to_string(),
            };
            tracing::error!(run_id = self.run_id(), error = %err, "baseline could not run");
            self.fail(
                step,
                &format!("Baseline command could not run (exit {}). Check the workspace tooling.", res.exit_code),
                &log,
            )
            .await?;
            self.set_status(RunStatus::Failed).await?;
            return Ok(ControlFlow::Break(Outcome::failed("Baseline command failed")));
        }

        let summary = if res.success() {
            "OK (no failures detected)".to_string()
        } else {
            tracing::info!(run_id = self.run_id(), command = %cmd, exit_code = res.exit_code, "baseline found failures");
            format!("Found failures (exit {})", res.exit_code)
        };
        self.succeed(step, &summary, &log, "").await?;
        Ok(ControlFlow::Continue(()))
    }

    /// Latest check output: post-checks when present, else the baseline.
    fn latest_check_output(&self) -> String {
        [POST_CHECKS_LOG, BASELINE_LOG]
            .iter()
            .filter_map(|name| self.read(name))
            .find(|text| !text.trim().is_empty())
            .unwrap_or_default()
    }

    async fn summarize(&mut self) -> Result<(), RunError> {
        let step = PipelineStep::Summarize;
        if !self.needs_run(step) {
            self.signals_text = self
                .recorded(step)
                .unwrap_or_else(|| render_signals(&[]));
            return Ok(());
        }
        self.begin(step).await?;

        let output = self.latest_check_output();
        let signals = extract_signals(&output, "", self.profile.ecosystem());
        let payload = serde_json::json!({
            "signals": signals,
            "workspace_profile": {
                "name": self.profile.name,
                "language": self.profile.language,
                "baseline": self.profile.baseline,
            },
        });
        let json = serde_json::to_string_pretty(&payload).map_err(|e| RunError::Other(e.into()))?;
        self.write(SIGNALS_JSON, "signals_json", &json).await?;

        let text = render_signals(&signals);
        let path = self.write(SIGNALS_TXT, "signals_text", &text).await?;
        self.succeed(step, &format!("{} signal(s) extracted", signals.len()), "", &path)
            .await?;
        self.signals_text = text;
        Ok(())
    }

    async fn context_search(&mut self) -> Result<(), RunError> {
        let step = PipelineStep::ContextSearch;
        if !self.needs_run(step) {
            self.context_text = self.recorded(step).unwrap_or_default();
            return Ok(());
        }
        self.begin(step).await?;

        let (indexed, docs) = search_docs(&self.sandbox, &self.run.ticket, KB_DOCS);
        let kb = if docs.is_empty() {
            "(no matching docs)".to_string()
        } else {
            docs.iter()
                .map(|d| format!("### {}\n{}", d.title, head_chars(&d.text, KB_EXCERPT_CHARS)))
                .collect::<Vec<_>>()
                .join("\n\n")
        };
        let code = build_code_context(
            &self.sandbox,
            &self.run.ticket,
            &self.signals_text,
            self.config().context.max_files,
            self.config().context.max_chars,
        );
        let content = format!(
            "## KB docs (from workspace /docs)\n{}\n\n## Code context (most relevant files)\n{}",
            kb, code
        );
        let path = self.write(CONTEXT_MD, "context", &content).await?;
        let note = if indexed > 0 {
            format!("{} doc(s) indexed", indexed)
        } else {
            "no docs folder".to_string()
        };
        self.succeed(step, &format!("Context built, {}", note), "", &path).await?;
        self.context_text = content;
        Ok(())
    }

    async fn plan(&mut self) -> Result<(), RunError> {
        let step = PipelineStep::Plan;
        if !self.needs_run(step) {
            self.plan_text = self.recorded(step).unwrap_or_default();
            return Ok(());
        }
        self.begin(step).await?;

        let text = match self.pipeline.backends.plan_client(self.patcher) {
            Some(client) => {
                model_plan(
                    client.as_ref(),
                    &self.run.ticket,
                    &self.signals_text,
                    &self.context_text,
                    &self.profile,
                )
                .await
            }
            None => simple_plan(&self.run.ticket, &self.signals_text, &self.profile),
        };
        let path = self.write(PLAN_MD, "plan", &text).await?;
        self.succeed(step, "Plan generated", "", &path).await?;
        self.plan_text = text;
        Ok(())
    }

    pub(super) async fn propose_with(
        &self,
        mode: PatcherMode,
        req: &ProposalRequest,
    ) -> anyhow::Result<PatchProposal> {
        let backend = self.pipeline.backends.build(mode, &self.sandbox)?;
        backend.propose(req).await
    }

    async fn propose(&mut self) -> StepFlow {
        let step = PipelineStep::Propose;
        if !self.needs_run(step) {
            return Ok(ControlFlow::Continue(()));
        }
        self.begin(step).await?;

        let context = if self.context_text.trim().is_empty() {
            self.plan_text.clone()
        } else {
            self.context_text.clone()
        };
        let req = ProposalRequest {
            ticket: self.run.ticket.clone(),
            signals: self.signals_text.clone(),
            context,
            previous_diff: self
                .read(PROPOSAL_DIFF)
                .map(|t| head_chars(&t, PREVIOUS_DIFF_CHARS).to_string()),
            previous_error: self
                .read(INVALID_PATCH)
                .map(|t| head_chars(&t, PREVIOUS_ERROR_CHARS).to_string()),
        };

        let first = self.propose_with(self.patcher, &req).await;
        let (proposal, used) = match first {
            Ok(p) => (p, self.patcher),
            Err(e) if self.patcher.is_generative() => {
                tracing::warn!(run_id = self.run_id(), patcher = %self.patcher, error = %e, "backend failed, falling back to rules");
                let note = format!("{} failed, falling back to rules patcher.\nerror={:#}\n", self.patcher, e);
                self.write(FALLBACK_USED, "fallback", &note).await?;
                match self.propose_with(PatcherMode::Rules, &req).await {
                    Ok(p) => (p, PatcherMode::Rules),
                    Err(e) => return self.propose_failed(e).await,
                }
            }
            Err(e) => return self.propose_failed(e).await,
        };

        let (diff_path, md_path) = self.write_proposal(used, &proposal).await?;

        if let Some(reason) = invalid_reason(used, &proposal) {
            let err = RunError::PatchInvalid { reason };
            let body = format!("{}\n\n{}\n\n{}", err, proposal.rationale, proposal.diff);
            let bad = self.write(INVALID_PATCH, "invalid_patch", &body).await?;
            self.fail(step, "Invalid patch. Regenerate the patch to retry.", &bad).await?;
            self.set_status(RunStatus::Failed).await?;
            return Ok(ControlFlow::Break(Outcome::failed("Invalid patch")));
        }

        tracing::info!(run_id = self.run_id(), patcher = %used, title = %proposal.title, "patch proposed");
        self.succeed(step, &format!("Patch proposed via {}", used), &diff_path, &md_path)
            .await?;
        Ok(ControlFlow::Continue(()))
    }

    async fn propose_failed(&self, e: anyhow::Error) -> StepFlow {
        self.fail(PipelineStep::Propose, &format!("Patch proposal failed: {:#}", e), "")
            .await?;
        self.set_status(RunStatus::Failed).await?;
        Ok(ControlFlow::Break(Outcome::failed("Propose failed")))
    }

    async fn approval_gate(&mut self) -> StepFlow {
        let step = PipelineStep::Approval;
        let run = self.checkpoint.check().await?;
        match run.patch_decision {
            PatchDecision::Yes => {
                if self.step(step).status != StepStatus::Success {
                    self.succeed(step, "Approved by user", "", "").await?;
                }
                Ok(ControlFlow::Continue(()))
            }
            PatchDecision::Rejected => {
                self.fail(step, "Patch rejected by user", "").await?;
                self.set_status(RunStatus::Failed).await?;
                Ok(ControlFlow::Break(Outcome::failed("Patch rejected")))
            }
            PatchDecision::No => {
                if self.step(step).status != StepStatus::Waiting {
                    self.wait(step, "Approve or reject the proposed patch to continue.")
                        .await?;
                }
                self.set_status(RunStatus::WaitingApproval).await?;
                tracing::info!(run_id = self.run_id(), "waiting for approval");
                Ok(ControlFlow::Break(Outcome::WaitingApproval))
            }
        }
    }

    async fn apply(&mut self) -> StepFlow {
        let step = PipelineStep::Apply;
        if !self.needs_run(step) {
            return Ok(ControlFlow::Continue(()));
        }
        self.begin(step).await?;

        let run = self.checkpoint.reload().await?;
        if run.patch_decision != PatchDecision::Yes {
            let id = self.step(step).id;
            self.db(move |db| db.set_step_pending(id)).await?;
            self.wait(PipelineStep::Approval, "Approval required").await?;
            self.set_status(RunStatus::WaitingApproval).await?;
            return Ok(ControlFlow::Break(Outcome::WaitingApproval));
        }

        let record = self
            .read(PROPOSAL_JSON)
            .and_then(|raw| serde_json::from_str::<ProposalRecord>(&raw).ok());
        let Some(record) = record else {
            self.fail(step, "No readable proposal.json. Regenerate the patch.", "").await?;
            self.set_status(RunStatus::Failed).await?;
            return Ok(ControlFlow::Break(Outcome::failed("No proposal to apply")));
        };

        let mode = record.mode_or(self.patcher);
        let applied = match self.pipeline.backends.build(mode, &self.sandbox) {
            Ok(backend) => backend.apply(&record.proposal).await,
            Err(e) => Err(e),
        };
        match applied {
            Ok(title) => {
                let path = self
                    .write(APPLY_RESULT, "apply_result", &format!("Applied: {}\n", title))
                    .await?;
                self.succeed(step, &format!("Applied: {}", title), "", &path).await?;
                Ok(ControlFlow::Continue(()))
            }
            Err(e) => {
                let err = RunError::ApplyFailure {
                    diagnostic: format!("{:#}", e),
                };
                let path = self.write(APPLY_ERROR, "apply_error", &err.to_string()).await?;
                self.fail(step, "Apply failed. Approve again to retry, or regenerate the patch.", &path)
                    .await?;
                self.set_status(RunStatus::Failed).await?;
                self.set_decision(PatchDecision::No).await?;
                Ok(ControlFlow::Break(Outcome::failed("Apply failed")))
            }
        }
    }

    async fn post_checks(&mut self) -> Result<(), RunError> {
        let step = PipelineStep::PostChecks;
        if !self.needs_run(step) {
            return Ok(());
        }
        self.begin(step).await?;

        let cmd = self.profile.post_command().to_string();
        let res = self.shell(&cmd, self.config().timeouts.test_command()).await;
        let output = res.transcript(&cmd);
        let log = self.write(POST_CHECKS_LOG, "post_checks_log", &output).await?;

        if !checks_failed(res.exit_code, &output) {
            self.succeed(step, "All checks passed", &log, "").await?;
            return Ok(());
        }

        self.post_ok = false;
        tracing::warn!(run_id = self.run_id(), exit_code = res.exit_code, "post-apply checks failing");
        self.fail(step, "Checks still failing after the patch. Regenerate the patch.", &log)
            .await?;
        self.set_decision(PatchDecision::No).await?;
        self.set_status(RunStatus::Failed).await?;
        let next = format!(
            "# Next actions\n\n\
             - Review `{}` for the remaining failures.\n\
             - Run `fixloop regenerate {}` to propose a new patch from a clean sandbox.\n\
             - Or switch backends with `fixloop set-patcher {} <mode>` first.\n",
            POST_CHECKS_LOG,
            self.run_id(),
            self.run_id()
        );
        self.write(NEXT_ACTIONS, "next_actions", &next).await?;
        Ok(())
    }

    async fn smoke(&mut self) -> Result<(), RunError> {
        let step = PipelineStep::Smoke;
        if !self.needs_run(step) {
            return Ok(());
        }
        self.begin(step).await?;

        let Some(cmd) = self.profile.smoke.clone() else {
            self.skip(step, "No smoke command configured").await?;
            return Ok(());
        };
        let res = self.shell(&cmd, self.config().timeouts.smoke()).await;
        let log = self.write(SMOKE_LOG, "smoke_log", &res.transcript(&cmd)).await?;
        if res.success() {
            self.succeed(step, "Smoke test passed", &log, "").await?;
        } else {
            self.smoke_ok = false;
            self.fail(step, &format!("Smoke test failed (exit {})", res.exit_code), &log)
                .await?;
        }
        Ok(())
    }

    async fn report(&mut self) -> Result<(), RunError> {
        let step = PipelineStep::Report;
        if !self.needs_run(step) {
            return Ok(());
        }
        self.begin(step).await?;

        let run_id = self.run_id();
        let steps = self.db(move |db| db.list_steps(run_id)).await?;
        let diff = self.read(PROPOSAL_DIFF);
        let text = render_report(&ReportInput {
            run_id,
            title: &self.run.title,
            sandbox: &self.sandbox,
            profile: &self.profile.name,
            steps: &steps,
            diff: diff.as_deref(),
        });
        let path = self.write(REPORT_MD, "report", &text).await?;
        self.succeed(step, "Report generated", "", &path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checks_failed_patterns() {
        assert!(!checks_failed(0, "5 passed in 0.1s"));
        assert!(checks_failed(1, ""));
        assert!(checks_failed(0, "== 2 failed, 3 passed =="));
        assert!(checks_failed(0, "FAILED tests/test_x.py::test_a"));
        assert!(checks_failed(0, "E   AssertionError: 1 != 2"));
        assert!(checks_failed(0, "collected 0 items\nERROR tests/test_x.py"));
        assert!(!checks_failed(0, "no ERROR here at line start? fine"));
    }

    #[test]
    fn test_environment_failure_detection() {
        let missing = CommandResult {
            exit_code: 127,
            stdout: String::new(),
            stderr: "bash: pytest: command not found".into(),
            timed_out: false,
        };
        assert!(is_environment_failure(&missing));
        let red = CommandResult {
            exit_code: 1,
            stdout: "1 failed".into(),
            stderr: String::new(),
            timed_out: false,
        };
        assert!(!is_environment_failure(&red));
    }

    #[test]
    fn test_invalid_reason() {
        let bare = PatchProposal::new("t", "", "@@ -1 +1 @@\n-a\n+b\n");
        assert!(invalid_reason(PatcherMode::Rules, &bare).is_some());

        let warned = PatchProposal::new(
            "t",
            "[Warning] Patch still fails git apply --check after 2 attempts.",
            "diff --git a/x b/x\n",
        );
        assert!(invalid_reason(PatcherMode::Ollama, &warned).is_some());
        assert!(invalid_reason(PatcherMode::Rules, &warned).is_none());

        let fine = PatchProposal::new("t", "fix", "diff --git a/x b/x\n");
        assert!(invalid_reason(PatcherMode::Hf, &fine).is_none());
    }

    #[test]
    fn test_proposal_record_shape() {
        let record = ProposalRecord::new(PatcherMode::Ollama, &PatchProposal::new("a", "b", "c"));
        let v = serde_json::to_value(&record).unwrap();
        assert_eq!(v["patcher_mode"], "ollama");
        assert_eq!(v["title"], "a");
        assert_eq!(v["diff"], "c");

        let legacy: ProposalRecord = serde_json::from_str(r#"{"title":"x","diff":"d"}"#).unwrap();
        assert_eq!(legacy.mode_or(PatcherMode::Hf), PatcherMode::Hf);
        assert_eq!(legacy.proposal.diff, "d");
    }
}

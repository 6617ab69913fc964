//! Bounded auto-repair after post-apply checks fail.
//!
//! Each iteration starts from a pristine sandbox, asks the run's backend for
//! a new proposal with the failing output as `previous_error`, applies it and
//! re-runs the checks. The loop stops at the first green run, on the first
//! backend error, or when the run leaves `failed` underneath it.

use super::PipelineStep;
use super::steps::{Attempt, POST_CHECKS_LOG, PROPOSAL_DIFF, checks_failed};
use crate::backends::ProposalRequest;
use crate::errors::RunError;
use crate::signals::{extract_signals, render_signals};
use crate::store::RunStatus;
use crate::util::head_chars;

const REPAIR_ERROR_CHARS: usize = 4000;

impl Attempt<'_> {
    pub(super) async fn auto_repair(&mut self) -> Result<(), RunError> {
        if self.post_ok {
            return Ok(());
        }
        let max = self.config().patcher.max_patch_iterations.max(1);
        let run_id = self.run_id();

        for iteration in 1..=max {
            let run = self.checkpoint.check().await?;
            if run.status != RunStatus::Failed {
                tracing::info!(run_id, status = %run.status, "run left failed state, stopping auto-repair");
                break;
            }
            tracing::info!(run_id, attempt = iteration, max, "auto-repair attempt");

            let failing = self.read(POST_CHECKS_LOG);
            let signals = match &failing {
                Some(output) => render_signals(&extract_signals(output, "", self.profile.ecosystem())),
                None => self.signals_text.clone(),
            };
            self.write(
                &format!("repair_{}.txt", iteration),
                "repair_attempt",
                &format!("Auto-repair attempt {}/{}\n\nSignals:\n{}\n", iteration, max, signals),
            )
            .await?;

            if let Err(e) = self.reset_sandbox().await {
                self.reset_failed(iteration, e).await?;
                break;
            }

            let req = ProposalRequest {
                ticket: self.run.ticket.clone(),
                signals,
                context: self.context_text.clone(),
                previous_diff: self.read(PROPOSAL_DIFF),
                previous_error: failing.map(|t| head_chars(&t, REPAIR_ERROR_CHARS).to_string()),
            };

            let backend = match self.pipeline.backends.build(self.patcher, &self.sandbox) {
                Ok(backend) => backend,
                Err(e) => {
                    self.repair_error(&format!("repair_{}_error.txt", iteration), &e).await?;
                    break;
                }
            };
            let proposal = match backend.propose(&req).await {
                Ok(p) => p,
                Err(e) => {
                    self.repair_error(&format!("repair_{}_error.txt", iteration), &e).await?;
                    break;
                }
            };
            self.write_proposal(self.patcher, &proposal).await?;
            if let Err(e) = backend.apply(&proposal).await {
                self.repair_error(&format!("repair_{}_apply_error.txt", iteration), &e)
                    .await?;
                break;
            }

            let cmd = self.profile.post_command().to_string();
            let res = self.shell(&cmd, self.config().timeouts.test_command()).await;
            let output = res.transcript(&cmd);
            let log = self.write(POST_CHECKS_LOG, "post_checks_log", &output).await?;

            if !checks_failed(res.exit_code, &output) {
                self.post_ok = true;
                self.succeed(
                    PipelineStep::PostChecks,
                    &format!("All checks passed (after {} auto-repair(s))", iteration),
                    &log,
                    "",
                )
                .await?;
                self.set_status(RunStatus::Running).await?;
                tracing::info!(run_id, attempt = iteration, "auto-repair succeeded");
                return Ok(());
            }
            tracing::warn!(run_id, attempt = iteration, exit_code = res.exit_code, "checks still failing after repair");
        }
        Ok(())
    }

    async fn reset_sandbox(&mut self) -> Result<(), RunError> {
        let sandboxes = self.pipeline.sandboxes.clone();
        let (run_id, base) = (self.run_id(), self.base.clone());
        self.sandbox = tokio::task::spawn_blocking(move || sandboxes.reset(run_id, &base))
            .await
            .map_err(|e| RunError::Other(anyhow::anyhow!("sandbox task panicked: {e}")))??;
        Ok(())
    }

    /// A sandbox that cannot be reset fails Re-run checks with the reason.
    async fn reset_failed(&self, iteration: u32, e: RunError) -> Result<(), RunError> {
        tracing::error!(run_id = self.run_id(), attempt = iteration, error = %e, "sandbox reset failed");
        let log = self
            .pipeline
            .artifacts
            .run_dir(self.run_id())
            .join(POST_CHECKS_LOG)
            .to_string_lossy()
            .to_string();
        self.fail(PipelineStep::PostChecks, &format!("Sandbox reset failed: {}", e), &log)
            .await
    }

    async fn repair_error(&self, name: &str, e: &anyhow::Error) -> Result<(), RunError> {
        tracing::warn!(run_id = self.run_id(), error = %e, "auto-repair aborted");
        self.write(name, "repair_error", &format!("{:#}\n", e)).await?;
        Ok(())
    }
}

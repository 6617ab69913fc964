//! Step 5 plan rendering.

use crate::backends::ModelClient;
use crate::util::head_chars;
use crate::workspace::WorkspaceProfile;

const PLAN_CONTEXT_CHARS: usize = 3000;

/// Deterministic markdown plan.
pub fn simple_plan(ticket: &str, signals: &str, profile: &WorkspaceProfile) -> String {
    format!(
        "# Plan\n\n\
         ## Ticket\n{}\n\n\
         ## Signals\n{}\n\n\
         ## Approach\n\
         - Identify root cause from failing test output\n\
         - Edit minimal files to fix the issue\n\
         - Re-run checks to verify fix\n\
         - Produce report\n\n\
         ## Workspace profile\n\
         - name: {}\n\
         - baseline: `{}`\n\
         - post: `{}`\n",
        ticket.trim(),
        signals,
        profile.name,
        profile.baseline,
        profile.post_command()
    )
}

fn plan_prompt(ticket: &str, signals: &str, context: &str) -> String {
    format!(
        "You are a senior software engineer. Create a concise fix plan.\n\n\
         TICKET:\n{}\n\n\
         FAILING SIGNALS:\n{}\n\n\
         REPO CONTEXT (snippets):\n{}\n\n\
         Return a short markdown plan with sections: ## Root Cause, ## Fix Strategy, ## Files to Change\n\
         Be specific about which functions/lines need changing. Max 400 words.",
        ticket,
        signals,
        head_chars(context, PLAN_CONTEXT_CHARS)
    )
}

/// Ask the model for a plan; any error or empty reply yields the
/// deterministic plan.
pub async fn model_plan(
    client: &dyn ModelClient,
    ticket: &str,
    signals: &str,
    context: &str,
    profile: &WorkspaceProfile,
) -> String {
    match client.generate(&plan_prompt(ticket, signals, context), None).await {
        Ok(reply) if !reply.trim().is_empty() => {
            format!("# AI-Generated Plan\n\n{}\n", reply.trim())
        }
        Ok(_) => simple_plan(ticket, signals, profile),
        Err(e) => {
            tracing::warn!(error = %e, "model plan failed, using deterministic plan");
            simple_plan(ticket, signals, profile)
        }
    }
}

//! Model-backed patch proposals routed through the patch validator.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use super::{PatchBackend, PatcherMode, ProposalRequest};
use crate::patch::validate::FileEdits;
use crate::patch::{GitApplier, NO_CHANGES, PatchProposal, PatchValidator, ProposalSource, sanitize};
use crate::util::parse_json_object;

/// Text generation endpoint. `schema` constrains the output to JSON when
/// the server supports it.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn generate(&self, prompt: &str, schema: Option<Value>) -> Result<String>;
}

fn proposal_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "title": {"type": "string"},
            "rationale": {"type": "string"},
            "diff": {"type": "string"},
        },
        "required": ["title", "rationale", "diff"],
    })
}

fn files_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "title": {"type": "string"},
            "rationale": {"type": "string"},
            "files": {"type": "object", "additionalProperties": {"type": "string"}},
        },
        "required": ["title", "rationale", "files"],
    })
}

fn text_field(map: &Map<String, Value>, key: &str) -> String {
    match map.get(key) {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

/// Interpret raw model output as a proposal. Output that is not a JSON
/// object is treated as a bare diff.
pub fn parse_proposal(raw: &str) -> PatchProposal {
    match parse_json_object(raw) {
        Some(map) => {
            let title = Some(text_field(&map, "title"))
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| "LLM proposal".to_string());
            let diff = sanitize(&text_field(&map, "diff"));
            PatchProposal::new(
                title,
                text_field(&map, "rationale"),
                if diff.is_empty() { NO_CHANGES.to_string() } else { diff },
            )
        }
        None => {
            let diff = sanitize(raw);
            PatchProposal::new(
                "LLM proposal (unparsed)",
                "Model did not return valid JSON; using raw output as diff.",
                if diff.is_empty() { NO_CHANGES.to_string() } else { diff },
            )
        }
    }
}

fn parse_file_edits(raw: &str) -> Option<FileEdits> {
    let map = parse_json_object(raw)?;
    let files = map.get("files")?.as_object()?;
    if files.is_empty() {
        return None;
    }
    let files: BTreeMap<String, String> = files
        .iter()
        .map(|(k, v)| {
            let content = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), content)
        })
        .collect();
    Some(FileEdits {
        title: text_field(&map, "title"),
        rationale: text_field(&map, "rationale"),
        files,
    })
}

/// Prompt for one proposal request, including any previous attempt.
pub fn build_prompt(mode: PatcherMode, req: &ProposalRequest) -> String {
    let mut prompt = match mode {
        PatcherMode::Hf => format!(
            "You are a senior software engineer.\n\
             Return ONLY a JSON object with keys: title, rationale, diff.\n\
             The 'diff' must be a complete unified diff in `git diff` style \
             (diff --git / --- / +++ / @@ ...).\n\n\
             TICKET:\n{}\n\nTOOL SIGNALS:\n{}\n\nREPO CONTEXT:\n{}\n",
            req.ticket, req.signals, req.context
        ),
        _ => format!(
            "You are a senior software engineer. You will be given:\n\
             (1) a ticket describing a bug or feature\n\
             (2) tool signals (tests/lint output)\n\
             (3) best-effort repo context snippets\n\n\
             Your job: propose a *single* patch that can be applied with `git apply`.\n\
             Rules:\n\
             - Return ONLY a JSON object matching the schema. No extra keys. No markdown.\n\
             - The `diff` must be a valid unified diff with file headers: `diff --git a/... b/...`, and `---` / `+++`.\n\
             - Use paths relative to repo root.\n\
             - For existing files, the diff MUST include `-` lines (removed) and `+` lines (new content).\n  \
               Do NOT use `@@ -0,0 +1,N @@` for an existing file; that prepends instead of replacing.\n\n\
             === TICKET ===\n{}\n\n=== SIGNALS ===\n{}\n\n=== REPO CONTEXT (snippets) ===\n{}\n",
            req.ticket, req.signals, req.context
        ),
    };
    if req.previous_error.is_some() || req.previous_diff.is_some() {
        prompt.push_str("\n\n=== PREVIOUS ATTEMPT (for repair) ===\n");
        if let Some(err) = &req.previous_error {
            prompt.push_str(&format!("error:\n{}\n\n", err));
        }
        if let Some(diff) = &req.previous_diff {
            prompt.push_str(&format!("diff:\n{}\n", diff));
        }
    }
    prompt
}

struct PromptedSource<'a> {
    client: &'a dyn ModelClient,
    prompt: String,
}

#[async_trait]
impl ProposalSource for PromptedSource<'_> {
    async fn propose_diff(&self, extra: Option<&str>) -> Result<PatchProposal> {
        let prompt = match extra {
            Some(extra) => format!("{}\n\n=== IMPORTANT (fix formatting) ===\n{}\n", self.prompt, extra),
            None => self.prompt.clone(),
        };
        let raw = self.client.generate(&prompt, Some(proposal_schema())).await?;
        Ok(parse_proposal(&raw))
    }

    async fn propose_files(&self, extra: &str) -> Result<Option<FileEdits>> {
        let prompt = format!(
            "{}\n\n=== IMPORTANT (fallback to file edits) ===\n{}\n\n\
             Return JSON matching the schema, but DO NOT return a diff.\n\
             Instead, return full new contents for each changed file in `files` (keys are repo-relative paths).\n\
             Only include files you change. No markdown.\n",
            self.prompt, extra
        );
        let raw = self.client.generate(&prompt, Some(files_schema())).await?;
        Ok(parse_file_edits(&raw))
    }
}

/// `ollama` and `hf` modes: a model proposes, the validator certifies, git
/// applies.
pub struct GenerativeBackend {
    mode: PatcherMode,
    client: Arc<dyn ModelClient>,
    applier: GitApplier,
    max_attempts: usize,
}

impl GenerativeBackend {
    pub fn new(
        mode: PatcherMode,
        client: Arc<dyn ModelClient>,
        sandbox: &Path,
        apply_timeout: Duration,
        max_attempts: usize,
    ) -> Self {
        Self {
            mode,
            client,
            applier: GitApplier::new(sandbox, apply_timeout),
            max_attempts,
        }
    }
}

#[async_trait]
impl PatchBackend for GenerativeBackend {
    fn mode(&self) -> PatcherMode {
        self.mode
    }

    async fn propose(&self, req: &ProposalRequest) -> Result<PatchProposal> {
        let git = self.applier.git();
        git.ensure_repo().await?;
        let source = PromptedSource {
            client: self.client.as_ref(),
            prompt: build_prompt(self.mode, req),
        };
        PatchValidator::new(git, git.root(), self.max_attempts)
            .negotiate(&source)
            .await
    }

    async fn apply(&self, proposal: &PatchProposal) -> Result<String> {
        self.applier.apply(proposal).await
    }
}

//! Workspace command profile and ticket directives.
//!
//! A workspace declares its checks in `.fixloop.yml`:
//!
//! ```yaml
//! name: tinyshop
//! language: python
//! commands:
//!   preflight: python -V
//!   baseline: python -m pytest -q
//!   post: python -m pytest -q
//!   smoke: python -c "import tinyshop"
//! ```
//!
//! Every key is optional. Without a file the `default` profile runs pytest.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use crate::signals::Ecosystem;

pub const PROFILE_FILE_NAMES: &[&str] = &[".fixloop.yml", ".fixloop.yaml"];
pub const DEFAULT_BASELINE: &str = "python -m pytest -vv -ra";
const DEFAULT_PREFLIGHT: &str = "echo preflight_ok";

/// The command set a run executes against its sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceProfile {
    pub name: String,
    pub language: Option<String>,
    pub preflight: Option<String>,
    pub baseline: String,
    pub post: Option<String>,
    pub smoke: Option<String>,
}

impl Default for WorkspaceProfile {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            language: None,
            preflight: None,
            baseline: DEFAULT_BASELINE.to_string(),
            post: None,
            smoke: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ProfileFile {
    name: Option<String>,
    profile: Option<String>,
    language: Option<String>,
    #[serde(default)]
    commands: CommandsBlock,
}

#[derive(Debug, Default, Deserialize)]
struct CommandsBlock {
    preflight: Option<String>,
    baseline: Option<String>,
    post: Option<String>,
    smoke: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl WorkspaceProfile {
    /// Load the profile from the workspace root. An unreadable or malformed
    /// file falls back to the default profile with a warning.
    pub fn load(root: &Path) -> Self {
        for name in PROFILE_FILE_NAMES {
            let path = root.join(name);
            if !path.exists() {
                continue;
            }
            let parsed = std::fs::read_to_string(&path)
                .map_err(anyhow::Error::from)
                .and_then(|text| Ok(serde_yaml::from_str::<ProfileFile>(&text)?));
            return match parsed {
                Ok(file) => Self::from_file(file),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "ignoring malformed workspace profile");
                    Self::default()
                }
            };
        }
        Self::default()
    }

    fn from_file(file: ProfileFile) -> Self {
        let baseline =
            non_empty(file.commands.baseline).unwrap_or_else(|| DEFAULT_BASELINE.to_string());
        Self {
            name: non_empty(file.name.or(file.profile)).unwrap_or_else(|| "custom".to_string()),
            language: non_empty(file.language),
            preflight: non_empty(file.commands.preflight),
            post: Some(non_empty(file.commands.post).unwrap_or_else(|| baseline.clone())),
            baseline,
            smoke: non_empty(file.commands.smoke),
        }
    }

    pub fn preflight_command(&self) -> &str {
        self.preflight.as_deref().unwrap_or(DEFAULT_PREFLIGHT)
    }

    /// Post-apply check command; the baseline when none is declared.
    pub fn post_command(&self) -> &str {
        self.post.as_deref().unwrap_or(&self.baseline)
    }

    pub fn ecosystem(&self) -> Option<Ecosystem> {
        self.language.as_deref().and_then(|l| l.parse().ok())
    }
}

/// `#fixloop: <mode>` plus `key=value` lines near the top of a ticket.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Directives {
    pub mode: Option<String>,
    pub values: HashMap<String, String>,
}

const DIRECTIVE_SCAN_LINES: usize = 60;

impl Directives {
    pub fn parse(ticket: &str) -> Self {
        let mut directives = Self::default();
        for raw in ticket.lines().take(DIRECTIVE_SCAN_LINES) {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            if line.to_lowercase().starts_with("#fixloop:") {
                let mode = line["#fixloop:".len()..].trim().to_lowercase();
                directives.mode = (!mode.is_empty()).then_some(mode);
                continue;
            }
            if line.starts_with('#') {
                continue;
            }
            if let Some((k, v)) = line.split_once('=') {
                let key = k.trim().to_lowercase();
                if !key.is_empty() {
                    directives.values.insert(key, v.trim().to_string());
                }
            }
        }
        directives
    }

    /// Patcher requested by the ticket, if any.
    pub fn patcher(&self) -> Option<&str> {
        self.values
            .get("patcher")
            .or_else(|| self.values.get("patcher_mode"))
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_default() {
        let dir = TempDir::new().unwrap();
        let profile = WorkspaceProfile::load(dir.path());
        assert_eq!(profile, WorkspaceProfile::default());
        assert_eq!(profile.preflight_command(), "echo preflight_ok");
        assert_eq!(profile.post_command(), DEFAULT_BASELINE);
        assert!(profile.smoke.is_none());
    }

    #[test]
    fn test_load_full_profile() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(".fixloop.yml"),
            "name: shop\nlanguage: go\ncommands:\n  preflight: go version\n  baseline: go test ./...\n  smoke: ./bin/smoke\n",
        )
        .unwrap();
        let profile = WorkspaceProfile::load(dir.path());
        assert_eq!(profile.name, "shop");
        assert_eq!(profile.ecosystem(), Some(Ecosystem::Go));
        assert_eq!(profile.preflight_command(), "go version");
        assert_eq!(profile.baseline, "go test ./...");
        // post defaults to baseline
        assert_eq!(profile.post_command(), "go test ./...");
        assert_eq!(profile.smoke.as_deref(), Some("./bin/smoke"));
    }

    #[test]
    fn test_yaml_extension_and_blank_values() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(".fixloop.yaml"),
            "commands:\n  baseline: '  '\n  smoke: ''\n",
        )
        .unwrap();
        let profile = WorkspaceProfile::load(dir.path());
        assert_eq!(profile.name, "custom");
        assert_eq!(profile.baseline, DEFAULT_BASELINE);
        assert!(profile.smoke.is_none());
    }

    #[test]
    fn test_malformed_profile_falls_back() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(".fixloop.yml"), "commands: [unclosed").unwrap();
        assert_eq!(WorkspaceProfile::load(dir.path()), WorkspaceProfile::default());
    }

    #[test]
    fn test_directives() {
        let ticket = "#fixloop: Eval\n# a comment = ignored\npatcher=ollama\nTitle: prices = wrong\n\nbody";
        let d = Directives::parse(ticket);
        assert_eq!(d.mode.as_deref(), Some("eval"));
        assert_eq!(d.patcher(), Some("ollama"));
        assert_eq!(d.values.get("title: prices").map(String::as_str), Some("wrong"));
        assert!(!d.values.contains_key("# a comment"));
    }

    #[test]
    fn test_directives_only_scan_head() {
        let mut ticket = "filler\n".repeat(60);
        ticket.push_str("patcher=hf\n");
        assert_eq!(Directives::parse(&ticket).patcher(), None);
    }
}

//! Deterministic, offline patch backend.
//!
//! Proposals are produced by running a known source transformation against
//! the sandbox, diffing the result and restoring the original files. Apply
//! re-runs the transformation for proposals this backend recognizes.

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::{Captures, Regex};
use std::path::PathBuf;
use std::sync::LazyLock;
use walkdir::WalkDir;

use super::{PatchBackend, PatcherMode, ProposalRequest};
use crate::patch::diffing::restore_snapshot;
use crate::patch::{NO_CHANGES, PatchProposal, snapshot_files, unified_diff};
use crate::workspace::sandbox::EXCLUDED_DIRS;

pub const HEALTH_TITLE: &str = "Add /health endpoint";
pub const DISCOUNT_TITLE: &str = "Fix discount calculation rounding";
pub const NOOP_TITLE: &str = "No-op proposal";

const HEALTH_RATIONALE: &str = "Adds a /health endpoint for service monitoring and deployment checks.\n\
If a pricing/cart module is detected, includes compatibility rounding fixes to keep tests green.";

const DISCOUNT_RATIONALE: &str = "Fixes 3 bugs:\n\
1. apply_discount: uses Python banker rounding, replaced with Decimal ROUND_HALF_UP\n\
2. apply_tax: uses floor division (//), replaced with Decimal ROUND_HALF_UP\n\
3. calculate_final_price: tax was calculated on subtotal, now calculated on after_discount";

const HEALTH_ROUTE: &str = "@app.get(\"/health\")";
const HEALTH_HANDLER: &str = "\n\n@app.get(\"/health\")\ndef health():\n    return {\"status\": \"ok\"}\n";

const CART_CANDIDATES: &[&str] = &["src/cart.py", "tinyshop/pricing.py", "cart.py", "pricing.py"];

static DISCOUNT_FN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"def apply_discount\(([^)]*)\)\s*->\s*int:\s*\n((?:[ \t][^\n]*\n|\n)*)").unwrap()
});

static TAX_FN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"def apply_tax\(([^)]*)\)\s*->\s*int:\s*\n((?:[ \t][^\n]*\n|\n)*)").unwrap()
});

static TAX_ON_SUBTOTAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"total_with_tax\s*=\s*apply_tax\s*\(\s*subtotal\s*,").unwrap());

static TAX_AMOUNT_FROM_SUBTOTAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"tax_amount\s*=\s*total_with_tax\s*-\s*subtotal\b").unwrap());

/// Which transformation a ticket routes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rule {
    AddHealth,
    FixDiscount,
    NoOp,
}

fn route(ticket: &str, signals: &str) -> Rule {
    let combined = format!("{ticket}\n{signals}").to_lowercase();
    // Ticket intent wins over generic failure text.
    if combined.contains("health") {
        return Rule::AddHealth;
    }
    if ["discount", "coupon", "rounding", "fix"]
        .iter()
        .any(|k| combined.contains(k))
    {
        return Rule::FixDiscount;
    }
    if ["failing", "assertion", "tests failed", "failed"]
        .iter()
        .any(|k| combined.contains(k))
    {
        return Rule::FixDiscount;
    }
    Rule::NoOp
}

fn param_names(sig: &str) -> Vec<String> {
    sig.split(',')
        .map(|p| p.trim().split(':').next().unwrap_or("").trim().to_string())
        .collect()
}

fn param_or(params: &[String], idx: usize, default: &str) -> String {
    params
        .get(idx)
        .filter(|p| !p.is_empty())
        .cloned()
        .unwrap_or_else(|| default.to_string())
}

fn rewrite_apply_discount(src: &str) -> String {
    DISCOUNT_FN
        .replacen(src, 1, |caps: &Captures| {
            let sig = &caps[1];
            let params = param_names(sig);
            let amount = param_or(&params, 0, "subtotal_cents");
            let pct = param_or(&params, 1, "discount_percent");
            format!(
                "def apply_discount({sig}) -> int:\n    \
                 \"\"\"Apply percentage discount. Returns discounted price in cents.\n    \
                 Rounding: half-up to nearest cent.\n    \
                 Percent is clamped to 0..100.\n    \
                 \"\"\"\n    \
                 {pct} = max(0, min(100, {pct}))\n    \
                 from decimal import Decimal, ROUND_HALF_UP\n    \
                 discounted_total = (Decimal({amount}) * (Decimal(100) - Decimal({pct})) / Decimal(100)).quantize(Decimal('1'), rounding=ROUND_HALF_UP)\n    \
                 return int(discounted_total)\n"
            )
        })
        .into_owned()
}

fn rewrite_apply_tax(src: &str) -> String {
    TAX_FN
        .replacen(src, 1, |caps: &Captures| {
            let sig = &caps[1];
            let params = param_names(sig);
            let amount = param_or(&params, 0, "amount_cents");
            let rate = param_or(&params, 1, "tax_rate_percent");
            format!(
                "def apply_tax({sig}) -> int:\n    \
                 \"\"\"Apply tax rate. Returns total with tax in cents.\n    \
                 Rounding: half-up to nearest cent.\n    \
                 \"\"\"\n    \
                 from decimal import Decimal, ROUND_HALF_UP\n    \
                 tax = (Decimal({amount}) * Decimal({rate}) / Decimal(100)).quantize(Decimal('1'), rounding=ROUND_HALF_UP)\n    \
                 return int(Decimal({amount}) + tax)\n"
            )
        })
        .into_owned()
}

fn rewrite_calculate_final_price(src: &str) -> String {
    let fixed = TAX_ON_SUBTOTAL.replace_all(src, "total_with_tax = apply_tax(after_discount,");
    TAX_AMOUNT_FROM_SUBTOTAL
        .replace_all(&fixed, "tax_amount = total_with_tax - after_discount")
        .into_owned()
}

/// Apply all three pricing rewrites to a module's source.
pub fn fix_pricing_source(src: &str) -> String {
    rewrite_calculate_final_price(&rewrite_apply_tax(&rewrite_apply_discount(src)))
}

/// Offline backend that pattern-matches tickets onto known fixes.
pub struct RulesBackend {
    root: PathBuf,
}

impl RulesBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Locate the pricing module: well-known paths first, then any Python
    /// file defining the pricing functions.
    pub fn find_cart_file(&self) -> Option<PathBuf> {
        if let Some(found) = CART_CANDIDATES
            .iter()
            .map(|rel| self.root.join(rel))
            .find(|p| p.is_file())
        {
            return Some(found);
        }
        WalkDir::new(&self.root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                e.depth() == 0
                    || !(e.file_type().is_dir()
                        && e.file_name()
                            .to_str()
                            .is_some_and(|n| EXCLUDED_DIRS.contains(&n)))
            })
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file() && e.path().extension().is_some_and(|x| x == "py"))
            .find(|e| {
                std::fs::read_to_string(e.path())
                    .map(|t| t.contains("apply_discount") || t.contains("apply_tax"))
                    .unwrap_or(false)
            })
            .map(|e| e.into_path())
    }

    fn fix_discount_rounding(&self) -> Result<()> {
        let path = self
            .find_cart_file()
            .unwrap_or_else(|| self.root.join("tinyshop/pricing.py"));
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read pricing module {}", path.display()))?;
        let fixed = fix_pricing_source(&text);
        if fixed != text {
            std::fs::write(&path, fixed)
                .with_context(|| format!("Failed to write {}", path.display()))?;
        }
        Ok(())
    }

    fn add_health(&self) -> Result<()> {
        let path = self.root.join("tinyshop/main.py");
        if !path.is_file() {
            tracing::warn!(path = %path.display(), "no service entrypoint for /health; skipping");
            return Ok(());
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        if text.contains(HEALTH_ROUTE) {
            return Ok(());
        }
        std::fs::write(&path, text + HEALTH_HANDLER)
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    fn run_rule(&self, rule: Rule) -> Result<()> {
        match rule {
            Rule::AddHealth => {
                self.add_health()?;
                if self.find_cart_file().is_some() {
                    self.fix_discount_rounding()?;
                }
                Ok(())
            }
            Rule::FixDiscount => self.fix_discount_rounding(),
            Rule::NoOp => Ok(()),
        }
    }

    /// Run `rule` against the sandbox, diff, then put every file back.
    fn preview(&self, rule: Rule) -> Result<String> {
        let before = snapshot_files(&self.root, &["*.py"])?;
        let outcome = self.run_rule(rule);
        let after = snapshot_files(&self.root, &["*.py"]);
        restore_snapshot(&self.root, &before)?;
        outcome?;
        Ok(unified_diff(&before, &after?))
    }
}

#[async_trait]
impl PatchBackend for RulesBackend {
    fn mode(&self) -> PatcherMode {
        PatcherMode::Rules
    }

    async fn propose(&self, req: &ProposalRequest) -> Result<PatchProposal> {
        let rule = route(&req.ticket, &req.signals);
        tracing::debug!(?rule, "rules backend routing");
        let proposal = match rule {
            Rule::AddHealth => PatchProposal::new(HEALTH_TITLE, HEALTH_RATIONALE, self.preview(rule)?),
            Rule::FixDiscount => PatchProposal::new(DISCOUNT_TITLE, DISCOUNT_RATIONALE, self.preview(rule)?),
            Rule::NoOp => PatchProposal::new(NOOP_TITLE, "No matching rule for this ticket.", NO_CHANGES),
        };
        Ok(proposal)
    }

    async fn apply(&self, proposal: &PatchProposal) -> Result<String> {
        let rule = match proposal.title.as_str() {
            HEALTH_TITLE => Rule::AddHealth,
            DISCOUNT_TITLE => Rule::FixDiscount,
            _ => Rule::NoOp,
        };
        self.run_rule(rule)?;
        Ok(proposal.title.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const BUGGY_PRICING: &str = "\"\"\"Pricing rules.\"\"\"\n\n\n\
def apply_discount(total_cents: int, percent: int) -> int:\n    \
\"\"\"Return discounted total in cents.\"\"\"\n    \
percent = max(0, min(100, percent))\n\n    \
return int(total_cents * (100 - percent) / 100)\n";

    fn workspace() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("tinyshop")).unwrap();
        std::fs::write(dir.path().join("tinyshop/__init__.py"), "").unwrap();
        std::fs::write(dir.path().join("tinyshop/pricing.py"), BUGGY_PRICING).unwrap();
        dir
    }

    fn request(ticket: &str) -> ProposalRequest {
        ProposalRequest {
            ticket: ticket.into(),
            ..ProposalRequest::default()
        }
    }

    #[test]
    fn test_routing() {
        assert_eq!(route("Add a health check", "1 failed"), Rule::AddHealth);
        assert_eq!(route("Coupon totals are off", ""), Rule::FixDiscount);
        assert_eq!(route("Something", "AssertionError in test"), Rule::FixDiscount);
        assert_eq!(route("Update README", ""), Rule::NoOp);
    }

    #[test]
    fn test_rewrite_discount_uses_signature_names() {
        let fixed = fix_pricing_source(BUGGY_PRICING);
        assert!(fixed.contains("def apply_discount(total_cents: int, percent: int) -> int:\n"));
        assert!(fixed.contains("    percent = max(0, min(100, percent))\n"));
        assert!(fixed.contains("(Decimal(total_cents) * (Decimal(100) - Decimal(percent)) / Decimal(100))"));
        assert!(!fixed.contains("return int(total_cents * (100 - percent) / 100)"));
        assert!(fixed.starts_with("\"\"\"Pricing rules.\"\"\""));
    }

    #[test]
    fn test_rewrite_tax_and_final_price() {
        let src = "def apply_tax(amount: int, rate: int) -> int:\n    return amount + amount * rate // 100\n\n\
def calculate_final_price(subtotal, pct, rate):\n    after_discount = apply_discount(subtotal, pct)\n    \
total_with_tax = apply_tax(subtotal, rate)\n    tax_amount = total_with_tax - subtotal\n    return tax_amount\n";
        let fixed = fix_pricing_source(src);
        assert!(fixed.contains("tax = (Decimal(amount) * Decimal(rate) / Decimal(100))"));
        assert!(fixed.contains("return int(Decimal(amount) + tax)"));
        assert!(fixed.contains("total_with_tax = apply_tax(after_discount, rate)"));
        assert!(fixed.contains("tax_amount = total_with_tax - after_discount"));
    }

    #[tokio::test]
    async fn test_propose_leaves_workspace_untouched() {
        let dir = workspace();
        let backend = RulesBackend::new(dir.path());
        let proposal = backend.propose(&request("Fix discount rounding")).await.unwrap();
        assert_eq!(proposal.title, DISCOUNT_TITLE);
        assert!(proposal.diff.contains("+++ b/tinyshop/pricing.py"));
        assert!(proposal.diff.contains("ROUND_HALF_UP"));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("tinyshop/pricing.py")).unwrap(),
            BUGGY_PRICING
        );
    }

    #[tokio::test]
    async fn test_noop_and_unknown_title() {
        let dir = workspace();
        let backend = RulesBackend::new(dir.path());
        let proposal = backend.propose(&request("Update README")).await.unwrap();
        assert_eq!(proposal.title, NOOP_TITLE);
        assert!(proposal.is_no_change());
        let applied = backend
            .apply(&PatchProposal::new("Something else", "", NO_CHANGES))
            .await
            .unwrap();
        assert_eq!(applied, "Something else");
        assert_eq!(
            std::fs::read_to_string(dir.path().join("tinyshop/pricing.py")).unwrap(),
            BUGGY_PRICING
        );
    }

    #[tokio::test]
    async fn test_health_adds_route_once() {
        let dir = workspace();
        std::fs::write(dir.path().join("tinyshop/main.py"), "app = object()\n").unwrap();
        let backend = RulesBackend::new(dir.path());
        let proposal = backend.propose(&request("Add health endpoint")).await.unwrap();
        assert_eq!(proposal.title, HEALTH_TITLE);
        assert!(proposal.diff.contains("+++ b/tinyshop/main.py"));
        assert!(proposal.diff.contains("+++ b/tinyshop/pricing.py"));

        backend.apply(&proposal).await.unwrap();
        backend.apply(&proposal).await.unwrap();
        let main = std::fs::read_to_string(dir.path().join("tinyshop/main.py")).unwrap();
        assert_eq!(main.matches(HEALTH_ROUTE).count(), 1);
    }

    #[test]
    fn test_find_cart_file_by_content() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("shop")).unwrap();
        std::fs::write(dir.path().join("shop/money.py"), "def apply_tax(a, b):\n    pass\n").unwrap();
        let found = RulesBackend::new(dir.path()).find_cart_file().unwrap();
        assert!(found.ends_with("shop/money.py"));
        assert!(RulesBackend::new(TempDir::new().unwrap().path()).find_cart_file().is_none());
    }

    #[tokio::test]
    async fn test_applied_fix_rounds_half_up() {
        let python = std::process::Command::new("python3").arg("--version").output();
        if !python.map(|o| o.status.success()).unwrap_or(false) {
            return;
        }
        let dir = workspace();
        let backend = RulesBackend::new(dir.path());
        let proposal = backend.propose(&request("Fix discount rounding")).await.unwrap();
        backend.apply(&proposal).await.unwrap();
        let out = std::process::Command::new("python3")
            .args([
                "-c",
                "from tinyshop.pricing import apply_discount; print(apply_discount(995, 10), apply_discount(1000, 150))",
            ])
            .current_dir(dir.path())
            .output()
            .unwrap();
        assert!(out.status.success());
        assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "896 0");
    }
}

//! Policy Enforcer — static script validation and per-call gating.
//!
//! Every privileged host call passes through a `check_*` predicate before
//! it is allowed to proceed. Checks are pure: they never mutate state on
//! their own, they only report whether a call would exceed a cap. Callers
//! invoke the matching `record_*` after the call succeeds.

use std::collections::HashSet;
use std::sync::Mutex;

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use uuid::Uuid;

use crate::tracer::UsageSnapshot;

const MAX_COMPLEXITY: usize = 50;

/// A dangerous textual pattern flagged by static validation, paired with a
/// human-legible description of why it matters.
struct DangerPattern {
    regex: Regex,
    description: &'static str,
}

static DANGER_PATTERNS: LazyLock<Vec<DangerPattern>> = LazyLock::new(|| {
    let specs: &[(&str, &str)] = &[
        (r"(?i)\brequire\s*\(", "module-loading construct (require)"),
        (r"(?i)\bimport\s*\(", "dynamic module import"),
        (r"(?i)\bprocess\.", "direct process access"),
        (r"(?i)\bglobal(This)?\.", "direct global object access"),
        (r"(?i)\beval\s*\(", "dynamic evaluation (eval)"),
        (r"(?i)\bnew\s+Function\s*\(", "dynamic evaluation (Function constructor)"),
        (r"(?i)\bset(Timeout|Interval)\s*\(", "timer primitive"),
        (r"(?i)\b(fetch|XMLHttpRequest|net\.connect|WebSocket)\s*\(", "low-level network primitive"),
    ];
    specs
        .iter()
        .map(|(pattern, description)| DangerPattern {
            regex: Regex::new(pattern).expect("static danger pattern must compile"),
            description,
        })
        .collect()
});

static COMPLEXITY_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(for|while|function|=>|if)\b").expect("static complexity pattern must compile")
});

// ─── Data model ───────────────────────────────────────────────────────────────

/// Absolute resource ceilings for a single run. No replenishment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ResourceQuotas {
    pub max_tool_calls: u64,
    pub max_tokens: u64,
    pub max_wall_ms: u64,
    pub max_cost_usd: f64,
    pub max_memory_mb: u64,
}

impl Default for ResourceQuotas {
    fn default() -> Self {
        Self {
            max_tool_calls: 50,
            max_tokens: 10_000,
            max_wall_ms: 30_000,
            max_cost_usd: 1.0,
            max_memory_mb: 100,
        }
    }
}

impl ResourceQuotas {
    /// Overlay `overrides` on top of `self`, component-wise. `None` fields in
    /// the override keep this quota's value.
    pub fn merge(self, overrides: &ResourceQuotaOverrides) -> Self {
        Self {
            max_tool_calls: overrides.max_tool_calls.unwrap_or(self.max_tool_calls),
            max_tokens: overrides.max_tokens.unwrap_or(self.max_tokens),
            max_wall_ms: overrides.max_wall_ms.unwrap_or(self.max_wall_ms),
            max_cost_usd: overrides.max_cost_usd.unwrap_or(self.max_cost_usd),
            max_memory_mb: overrides.max_memory_mb.unwrap_or(self.max_memory_mb),
        }
    }
}

/// Caller-supplied partial overrides for [`ResourceQuotas`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceQuotaOverrides {
    pub max_tool_calls: Option<u64>,
    pub max_tokens: Option<u64>,
    pub max_wall_ms: Option<u64>,
    pub max_cost_usd: Option<f64>,
    pub max_memory_mb: Option<u64>,
}

/// Allow/deny lists and static-validation parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SecurityPolicy {
    /// Empty means "allow all not denied".
    pub allow_list: HashSet<String>,
    pub deny_list: HashSet<String>,
    pub max_script_length: usize,
    pub allow_network: bool,
    pub allow_filesystem: bool,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            allow_list: HashSet::new(),
            deny_list: ["execCommand", "writeFileChunk", "patchFile"]
                .into_iter()
                .map(str::to_owned)
                .collect(),
            max_script_length: 50_000,
            allow_network: false,
            allow_filesystem: false,
        }
    }
}

/// Caller-supplied partial overrides for [`SecurityPolicy`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityPolicyOverrides {
    pub allow_list: Option<HashSet<String>>,
    pub deny_list: Option<HashSet<String>>,
    pub max_script_length: Option<usize>,
    pub allow_network: Option<bool>,
    pub allow_filesystem: Option<bool>,
}

impl SecurityPolicy {
    pub fn merge(self, overrides: &SecurityPolicyOverrides) -> Self {
        Self {
            allow_list: overrides.allow_list.clone().unwrap_or(self.allow_list),
            deny_list: overrides.deny_list.clone().unwrap_or(self.deny_list),
            max_script_length: overrides.max_script_length.unwrap_or(self.max_script_length),
            allow_network: overrides.allow_network.unwrap_or(self.allow_network),
            allow_filesystem: overrides.allow_filesystem.unwrap_or(self.allow_filesystem),
        }
    }
}

/// One issue found during static script validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub description: String,
}

/// Result of static script validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub issues: Vec<ValidationIssue>,
}

/// The kind of policy violation recorded.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    QuotaExceeded,
    ToolDenied,
    ToolNotAllowed,
    ScriptValidation,
}

/// An append-only record of a denied or quota-exceeding call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyViolation {
    pub id: String,
    pub kind: ViolationKind,
    pub message: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub usage_snapshot: UsageSnapshot,
}

// ─── Static validation ────────────────────────────────────────────────────────

/// Validate `script` against `policy`. This is a heuristic contract, not a
/// security boundary — the isolate is the security boundary.
pub fn validate_script(script: &str, policy: &SecurityPolicy) -> ValidationResult {
    let mut issues = Vec::new();

    if script.len() > policy.max_script_length {
        issues.push(ValidationIssue {
            description: format!(
                "script length {} exceeds max_script_length {}",
                script.len(),
                policy.max_script_length
            ),
        });
    }

    for pattern in DANGER_PATTERNS.iter() {
        if pattern.regex.is_match(script) {
            issues.push(ValidationIssue {
                description: pattern.description.to_owned(),
            });
        }
    }

    let complexity = COMPLEXITY_PATTERN.find_iter(script).count();
    if complexity > MAX_COMPLEXITY {
        issues.push(ValidationIssue {
            description: format!(
                "script complexity {complexity} exceeds limit of {MAX_COMPLEXITY} loop/function/arrow/if constructs"
            ),
        });
    }

    ValidationResult {
        valid: issues.is_empty(),
        issues,
    }
}

// ─── Enforcer ─────────────────────────────────────────────────────────────────

struct EnforcerState {
    usage: UsageSnapshot,
    violations: Vec<PolicyViolation>,
}

/// Reference monitor for a single run: gates every privileged call against
/// the run's [`SecurityPolicy`] and [`ResourceQuotas`], and keeps the
/// append-only violation log.
pub struct PolicyEnforcer {
    policy: SecurityPolicy,
    quotas: ResourceQuotas,
    state: Mutex<EnforcerState>,
}

impl PolicyEnforcer {
    pub fn new(policy: SecurityPolicy, quotas: ResourceQuotas) -> Self {
        Self {
            policy,
            quotas,
            state: Mutex::new(EnforcerState {
                usage: UsageSnapshot::default(),
                violations: Vec::new(),
            }),
        }
    }

    pub fn policy(&self) -> &SecurityPolicy {
        &self.policy
    }

    pub fn quotas(&self) -> &ResourceQuotas {
        &self.quotas
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EnforcerState> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn record_violation(&self, kind: ViolationKind, message: impl Into<String>) {
        let message = message.into();
        let mut state = self.lock();
        let snapshot = state.usage;
        state.violations.push(PolicyViolation {
            id: Uuid::new_v4().to_string(),
            kind,
            message,
            timestamp: chrono::Utc::now(),
            usage_snapshot: snapshot,
        });
    }

    /// Record a script-validation failure as a policy violation.
    pub fn record_script_validation_failure(&self, message: impl Into<String>) {
        self.record_violation(ViolationKind::ScriptValidation, message);
    }

    /// `false` if `name` is denied, not on a non-empty allow list, or the
    /// tool-call quota is already exhausted. Records a violation on refusal.
    pub fn check_tool_call(&self, name: &str) -> bool {
        if self.policy.deny_list.contains(name) {
            self.record_violation(ViolationKind::ToolDenied, format!("tool '{name}' is denied"));
            return false;
        }
        if !self.policy.allow_list.is_empty() && !self.policy.allow_list.contains(name) {
            self.record_violation(
                ViolationKind::ToolNotAllowed,
                format!("tool '{name}' is not in the allow list"),
            );
            return false;
        }
        if self.lock().usage.tool_calls >= self.quotas.max_tool_calls {
            self.record_violation(
                ViolationKind::QuotaExceeded,
                format!("tool_calls quota of {} exhausted", self.quotas.max_tool_calls),
            );
            return false;
        }
        true
    }

    /// `false` if adding `n` tokens would exceed `max_tokens`.
    pub fn check_token_usage(&self, n: u64) -> bool {
        let current = self.lock().usage.tokens;
        if current + n > self.quotas.max_tokens {
            self.record_violation(
                ViolationKind::QuotaExceeded,
                format!("token quota of {} would be exceeded by {n}", self.quotas.max_tokens),
            );
            return false;
        }
        true
    }

    /// `false` if `ms` exceeds `max_wall_ms`.
    pub fn check_wall(&self, ms: u64) -> bool {
        if ms > self.quotas.max_wall_ms {
            self.record_violation(
                ViolationKind::QuotaExceeded,
                format!("wall-clock ceiling of {}ms exceeded", self.quotas.max_wall_ms),
            );
            return false;
        }
        true
    }

    /// `false` if adding `c` dollars would exceed `max_cost_usd`.
    pub fn check_cost(&self, c: f64) -> bool {
        let current = self.lock().usage.cost_usd;
        if current + c > self.quotas.max_cost_usd {
            self.record_violation(
                ViolationKind::QuotaExceeded,
                format!("cost quota of ${:.2} would be exceeded", self.quotas.max_cost_usd),
            );
            return false;
        }
        true
    }

    pub fn record_tool_call(&self) {
        self.lock().usage.tool_calls += 1;
    }

    pub fn record_tokens(&self, n: u64) {
        self.lock().usage.tokens += n;
    }

    pub fn record_cost(&self, c: f64) {
        self.lock().usage.cost_usd += c;
    }

    pub fn record_wall(&self, ms: u64) {
        self.lock().usage.wall_ms = ms;
    }

    pub fn current_usage(&self) -> UsageSnapshot {
        self.lock().usage
    }

    pub fn violations(&self) -> Vec<PolicyViolation> {
        self.lock().violations.clone()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn enforcer() -> PolicyEnforcer {
        PolicyEnforcer::new(
            SecurityPolicy::default(),
            ResourceQuotas {
                max_tool_calls: 2,
                max_tokens: 100,
                max_wall_ms: 1_000,
                max_cost_usd: 1.0,
                max_memory_mb: 64,
            },
        )
    }

    #[test]
    fn denies_blocked_tool() {
        let e = enforcer();
        assert!(!e.check_tool_call("execCommand"));
        assert_eq!(e.violations().len(), 1);
        assert_eq!(e.violations()[0].kind, ViolationKind::ToolDenied);
    }

    #[test]
    fn allow_list_restricts_when_non_empty() {
        let mut policy = SecurityPolicy::default();
        policy.allow_list.insert("echo".to_owned());
        let e = PolicyEnforcer::new(policy, ResourceQuotas::default());
        assert!(e.check_tool_call("echo"));
        assert!(!e.check_tool_call("other_tool"));
    }

    #[test]
    fn tool_call_quota_exhausts() {
        let e = enforcer();
        assert!(e.check_tool_call("echo"));
        e.record_tool_call();
        assert!(e.check_tool_call("echo"));
        e.record_tool_call();
        assert!(!e.check_tool_call("echo"));
    }

    #[test]
    fn token_quota_blocks_overage() {
        let e = enforcer();
        assert!(e.check_token_usage(100));
        assert!(!e.check_token_usage(101));
    }

    #[test]
    fn cost_quota_blocks_overage() {
        let e = enforcer();
        assert!(e.check_cost(1.0));
        assert!(!e.check_cost(1.01));
    }

    #[test]
    fn wall_quota_rejects_over_ceiling() {
        let e = enforcer();
        assert!(e.check_wall(1_000));
        assert!(!e.check_wall(1_001));
    }

    #[test]
    fn script_over_length_is_invalid() {
        let policy = SecurityPolicy { max_script_length: 10, ..SecurityPolicy::default() };
        let result = validate_script(&"x".repeat(11), &policy);
        assert!(!result.valid);
    }

    #[test]
    fn script_with_eval_is_flagged() {
        let result = validate_script("eval(userInput)", &SecurityPolicy::default());
        assert!(!result.valid);
        assert!(result.issues.iter().any(|i| i.description.contains("eval")));
    }

    #[test]
    fn script_with_high_complexity_is_flagged() {
        let script = "if (true) {}\n".repeat(60);
        let result = validate_script(&script, &SecurityPolicy::default());
        assert!(!result.valid);
    }

    #[test]
    fn clean_script_is_valid() {
        let result = validate_script("const x = 1 + 1; x", &SecurityPolicy::default());
        assert!(result.valid);
        assert!(result.issues.is_empty());
    }

    #[test]
    fn script_validation_failure_is_recorded_as_a_violation() {
        let e = enforcer();
        e.record_script_validation_failure("script exceeds max_script_length");
        let violations = e.violations();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].kind, ViolationKind::ScriptValidation);
    }

    #[test]
    fn quota_merge_overrides_component_wise() {
        let base = ResourceQuotas::default();
        let overrides = ResourceQuotaOverrides { max_tool_calls: Some(5), ..Default::default() };
        let merged = base.merge(&overrides);
        assert_eq!(merged.max_tool_calls, 5);
        assert_eq!(merged.max_tokens, base.max_tokens);
    }
}

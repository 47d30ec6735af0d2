use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// One parsed report file, as produced by the external orchestrator.
///
/// Every section except `run_id` is optional in the wild; defaulting is
/// applied here, at parse time, so downstream code never touches raw JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportDocument {
    pub run_id: String,
    #[serde(default)]
    pub generated_at: Option<String>,
    #[serde(default)]
    pub summary: ReportSummary,
    #[serde(default)]
    pub tools_config: ToolsConfig,
    #[serde(default)]
    pub supabase_specific: DomainIssues,
    #[serde(default)]
    pub token_usage: TokenUsage,
    #[serde(default)]
    pub raw_data: RawData,
    #[serde(default)]
    pub step_outcomes: Vec<StepOutcome>,
    #[serde(default)]
    pub failures: FailureSection,
    #[serde(default)]
    pub web_searches: Vec<WebSearchEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportSummary {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub duration_minutes: Option<f64>,
    #[serde(default)]
    pub total_steps: Option<i64>,
    #[serde(default)]
    pub passed_steps: Option<i64>,
    #[serde(default)]
    pub failed_steps: Option<i64>,
    #[serde(default)]
    pub total_retries: Option<i64>,
    #[serde(default)]
    pub replan_checkpoints: Option<i64>,
    #[serde(default)]
    pub replans_triggered: Option<i64>,
    #[serde(default)]
    pub success_rate: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default)]
    pub planner: Option<String>,
    #[serde(default)]
    pub implementer: Option<String>,
    #[serde(default)]
    pub verifier: Option<String>,
    #[serde(default)]
    pub models_used: Vec<String>,
}

/// Domain-specific issue counters carried by the report.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DomainIssues {
    #[serde(default)]
    pub rls_issues: i64,
    #[serde(default)]
    pub migration_issues: i64,
    #[serde(default)]
    pub edge_function_issues: i64,
    #[serde(default)]
    pub auth_issues: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub total_input_tokens: i64,
    #[serde(default)]
    pub total_output_tokens: i64,
    #[serde(default)]
    pub total_cache_read_tokens: i64,
    #[serde(default)]
    pub total_cache_creation_tokens: i64,
    #[serde(default)]
    pub total_cost_usd: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawData {
    #[serde(default)]
    pub steps: Vec<RawStep>,
}

/// One raw sub-step record; the derivation engine folds these per step number.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawStep {
    #[serde(default, deserialize_with = "deserialize_opt_i64")]
    pub step: Option<i64>,
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub tool: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepOutcome {
    #[serde(default, deserialize_with = "deserialize_opt_i64")]
    pub step: Option<i64>,
    #[serde(default)]
    pub build_phase: Option<String>,
    #[serde(default)]
    pub final_verdict: Option<String>,
    #[serde(default)]
    pub attempts: Option<i64>,
    #[serde(default)]
    pub retries: Option<i64>,
    #[serde(default)]
    pub duration_seconds: Option<f64>,
    #[serde(default)]
    pub resolution_actions: Option<Vec<String>>,
    #[serde(default)]
    pub input_tokens: i64,
    #[serde(default)]
    pub output_tokens: i64,
    #[serde(default)]
    pub cost_usd: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FailureSection {
    #[serde(default)]
    pub details: Vec<FailureDetail>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FailureDetail {
    #[serde(default, deserialize_with = "deserialize_opt_i64")]
    pub step: Option<i64>,
    #[serde(default)]
    pub build_phase: Option<String>,
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, deserialize_with = "deserialize_opt_i64")]
    pub exit_code: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebSearchEntry {
    #[serde(default)]
    pub step_id: Option<String>,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default, deserialize_with = "deserialize_opt_i64")]
    pub count: Option<i64>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// Normalized run status. Anything the orchestrator emits outside the two
/// known labels collapses to `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    Failed,
    Other,
}

impl RunStatus {
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_lowercase().as_str() {
            "success" => RunStatus::Success,
            "failed" => RunStatus::Failed,
            _ => RunStatus::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Other => "other",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Step classification label, produced by the external classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Architectural,
    Implementation,
    CleanPass,
    Ambiguous,
    Pending,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Architectural => "architectural",
            Classification::Implementation => "implementation",
            Classification::CleanPass => "clean_pass",
            Classification::Ambiguous => "ambiguous",
            Classification::Pending => "pending",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Classification {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "architectural" => Ok(Classification::Architectural),
            "implementation" => Ok(Classification::Implementation),
            "clean_pass" => Ok(Classification::CleanPass),
            "ambiguous" => Ok(Classification::Ambiguous),
            "pending" | "" => Ok(Classification::Pending),
            other => Err(format!("Unknown classification: {other}")),
        }
    }
}

/// Derived step identifier shared by steps and web-search references.
pub fn step_id(run_id: &str, step_number: i64) -> String {
    format!("{run_id}_{step_number}")
}

/// One run row, both as written by ingestion and as read back for the API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub generated_at: Option<String>,
    pub prompt: Option<String>,
    pub status: Option<String>,
    pub duration_minutes: Option<f64>,
    pub total_steps: Option<i64>,
    pub passed_steps: Option<i64>,
    pub failed_steps: Option<i64>,
    pub total_retries: Option<i64>,
    pub replan_checkpoints: Option<i64>,
    pub replans_triggered: Option<i64>,
    pub success_rate: Option<f64>,
    pub planner: Option<String>,
    pub implementer: Option<String>,
    pub verifier: Option<String>,
    pub models_used: Option<Vec<String>>,
    pub rls_issues: i64,
    pub migration_issues: i64,
    pub edge_function_issues: i64,
    pub auth_issues: i64,
    pub total_input_tokens: i64,
    pub total_output_tokens: i64,
    pub total_cache_read_tokens: i64,
    pub total_cache_creation_tokens: i64,
    pub total_cost_usd: f64,
    pub ingested_at: String,
    pub classified_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub id: String,
    pub run_id: String,
    pub step_number: i64,
    pub build_phase: Option<String>,
    pub phase: Option<String>,
    pub tool: Option<String>,
    pub final_verdict: Option<String>,
    pub attempts: Option<i64>,
    pub retries: Option<i64>,
    pub duration_seconds: Option<f64>,
    pub resolution_actions: Option<Vec<String>>,
    pub error_categories: Option<Vec<String>>,
    pub errors_summary: Option<String>,
    pub classification: Option<String>,
    pub classification_confidence: Option<f64>,
    pub classification_reasoning: Option<String>,
    pub classification_evidence: Option<String>,
    pub approach_changed: Option<bool>,
    pub same_file_repeated: Option<bool>,
    pub error_category_stable: Option<bool>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub run_id: String,
    pub step_number: Option<i64>,
    pub build_phase: Option<String>,
    pub phase: Option<String>,
    pub category: Option<String>,
    pub error: Option<String>,
    pub exit_code: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebSearchRecord {
    pub run_id: String,
    pub step_id: Option<String>,
    pub query: Option<String>,
    pub count: Option<i64>,
    pub timestamp: Option<String>,
}

/// Everything the persistence writer commits for one report, as one unit.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecords {
    pub run: RunRecord,
    pub steps: Vec<StepRecord>,
    pub failures: Vec<FailureRecord>,
    pub web_searches: Vec<WebSearchRecord>,
}

/// The classifier-owned field group written back onto a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepClassification {
    pub label: Classification,
    pub confidence: f64,
    pub reasoning: Option<String>,
    pub evidence: Option<String>,
    pub approach_changed: Option<bool>,
    pub same_file_repeated: Option<bool>,
    pub error_category_stable: Option<bool>,
}

/// Per-run step counts by classification label; null/empty labels land in
/// the `pending` bucket.
pub type ClassificationSummary = BTreeMap<String, i64>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassificationCounts {
    pub architectural: i64,
    pub implementation: i64,
    pub clean_pass: i64,
    pub ambiguous: i64,
    pub pending: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryCount {
    pub category: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseCount {
    pub build_phase: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsPayload {
    pub total_runs: i64,
    pub completed_runs: i64,
    pub failed_runs: i64,
    pub total_steps: i64,
    pub total_failures: i64,
    pub total_retries: i64,
    pub avg_success_rate: f64,
    pub classification_counts: ClassificationCounts,
    pub top_error_categories: Vec<CategoryCount>,
    pub top_failure_phases: Vec<PhaseCount>,
}

/// Failure counts for one (category, build phase) cell, split by the owning
/// step's classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeatmapCell {
    pub category: String,
    pub build_phase: String,
    pub count: i64,
    pub architectural: i64,
    pub implementation: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternGroup {
    pub category: String,
    pub build_phase: String,
    pub total_occurrences: i64,
    pub architectural_count: i64,
    pub implementation_count: i64,
    pub example_run_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelfCorrectionRow {
    pub category: String,
    pub total: i64,
    pub self_corrected: i64,
    pub failed: i64,
    pub rate: f64,
}

/// Structured tool-configuration key; formatted as "planner/implementer/
/// verifier" only at the presentation boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ToolTriple {
    pub planner: String,
    pub implementer: Option<String>,
    pub verifier: Option<String>,
}

impl ToolTriple {
    pub fn label(&self) -> String {
        format!(
            "{}/{}/{}",
            self.planner,
            self.implementer.as_deref().unwrap_or(""),
            self.verifier.as_deref().unwrap_or("")
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolComparisonRow {
    pub tools: ToolTriple,
    pub run_count: i64,
    pub avg_success_rate: f64,
    pub total_retries: i64,
    pub architectural_count: i64,
    pub implementation_count: i64,
}

/// Deserialize a value that can be a number, a numeric string, or null.
fn deserialize_opt_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let val: Option<serde_json::Value> = Option::deserialize(deserializer)?;
    match val {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Number(n)) => Ok(n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))),
        Some(serde_json::Value::String(s)) => {
            s.trim().parse::<i64>().map(Some).map_err(serde::de::Error::custom)
        }
        _ => Err(serde::de::Error::custom("expected number or string")),
    }
}

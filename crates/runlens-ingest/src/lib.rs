use chrono::Utc;
use runlens_core::{
    step_id, FailureDetail, FailureRecord, RawStep, ReportDocument, RunRecord, RunRecords,
    RunStatus, StepRecord, WebSearchRecord,
};
use runlens_storage::{RunStore, StorageError, WriteOutcome};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

/// Reports are discovered by this suffix inside the configured directory.
pub const REPORT_SUFFIX: &str = "_full.json";

const ERRORS_SUMMARY_MAX_CHARS: usize = 1000;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed report {file}: {reason}")]
    MalformedReport { file: String, reason: String },
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Aggregate counts for one ingestion pass over the reports directory.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestOutcome {
    pub ingested: usize,
    pub skipped: usize,
    pub errors: usize,
}

/// Parse one report file. Pure: no store access, no side effects.
///
/// Invalid JSON and a missing or empty `run_id` are both malformed input.
pub fn read_report(path: &Path) -> Result<ReportDocument, IngestError> {
    let contents = fs::read_to_string(path)?;
    let report: ReportDocument =
        serde_json::from_str(&contents).map_err(|err| IngestError::MalformedReport {
            file: display_name(path),
            reason: err.to_string(),
        })?;
    if report.run_id.trim().is_empty() {
        return Err(IngestError::MalformedReport {
            file: display_name(path),
            reason: "empty run_id".to_string(),
        });
    }
    Ok(report)
}

/// All raw sub-step records declared for a given step number.
pub fn raw_steps_for<'a>(report: &'a ReportDocument, step_number: i64) -> Vec<&'a RawStep> {
    report
        .raw_data
        .steps
        .iter()
        .filter(|raw| raw.step == Some(step_number))
        .collect()
}

/// Dominant phase for a step: the single shared phase value, or the
/// comma-joined distinct values in first-seen order.
fn derive_phase(raw_steps: &[&RawStep]) -> Option<String> {
    let mut unique: Vec<&str> = Vec::new();
    for raw in raw_steps {
        if let Some(phase) = raw.phase.as_deref().filter(|value| !value.is_empty()) {
            if !unique.contains(&phase) {
                unique.push(phase);
            }
        }
    }
    match unique.len() {
        0 => None,
        1 => Some(unique[0].to_string()),
        _ => Some(unique.join(",")),
    }
}

/// Most frequent tool among the sub-steps; on a tie the tool seen first
/// wins.
fn derive_tool(raw_steps: &[&RawStep]) -> Option<String> {
    let mut counts: Vec<(&str, usize)> = Vec::new();
    for raw in raw_steps {
        if let Some(tool) = raw.tool.as_deref().filter(|value| !value.is_empty()) {
            match counts.iter_mut().find(|(name, _)| *name == tool) {
                Some(entry) => entry.1 += 1,
                None => counts.push((tool, 1)),
            }
        }
    }

    let mut best: Option<(&str, usize)> = None;
    for (name, count) in counts {
        if best.map_or(true, |(_, best_count)| count > best_count) {
            best = Some((name, count));
        }
    }
    best.map(|(name, _)| name.to_string())
}

fn failures_for_step<'a>(
    details: &'a [FailureDetail],
    step_number: i64,
) -> Vec<&'a FailureDetail> {
    details
        .iter()
        .filter(|failure| failure.step == Some(step_number))
        .collect()
}

/// Deduplicated non-empty categories, sorted for a stable stored form.
fn error_categories(failures: &[&FailureDetail]) -> Option<Vec<String>> {
    let mut categories: Vec<String> = failures
        .iter()
        .filter_map(|failure| failure.category.clone())
        .filter(|category| !category.is_empty())
        .collect();
    categories.sort();
    categories.dedup();
    if categories.is_empty() {
        None
    } else {
        Some(categories)
    }
}

/// Pipe-joined error messages, truncated to the first 1000 characters
/// after joining.
fn errors_summary(failures: &[&FailureDetail]) -> Option<String> {
    let messages: Vec<&str> = failures
        .iter()
        .filter_map(|failure| failure.error.as_deref())
        .filter(|message| !message.is_empty())
        .collect();
    if messages.is_empty() {
        return None;
    }
    let joined = messages.join(" | ");
    Some(joined.chars().take(ERRORS_SUMMARY_MAX_CHARS).collect())
}

/// Translate a parsed report into the normalized records the writer
/// commits: one run, one step per outcome, one failure per detail, one
/// search per entry.
pub fn build_records(report: &ReportDocument, ingested_at: &str) -> RunRecords {
    let run_id = report.run_id.clone();
    let summary = &report.summary;
    let tools = &report.tools_config;
    let issues = &report.supabase_specific;
    let usage = &report.token_usage;

    let run = RunRecord {
        run_id: run_id.clone(),
        generated_at: report.generated_at.clone(),
        prompt: summary.prompt.clone(),
        status: summary
            .status
            .as_deref()
            .map(|label| RunStatus::from_label(label).as_str().to_string()),
        duration_minutes: summary.duration_minutes,
        total_steps: summary.total_steps,
        passed_steps: summary.passed_steps,
        failed_steps: summary.failed_steps,
        total_retries: summary.total_retries,
        replan_checkpoints: summary.replan_checkpoints,
        replans_triggered: summary.replans_triggered,
        success_rate: summary.success_rate,
        planner: tools.planner.clone(),
        implementer: tools.implementer.clone(),
        verifier: tools.verifier.clone(),
        models_used: if tools.models_used.is_empty() {
            None
        } else {
            Some(tools.models_used.clone())
        },
        rls_issues: issues.rls_issues,
        migration_issues: issues.migration_issues,
        edge_function_issues: issues.edge_function_issues,
        auth_issues: issues.auth_issues,
        total_input_tokens: usage.total_input_tokens,
        total_output_tokens: usage.total_output_tokens,
        total_cache_read_tokens: usage.total_cache_read_tokens,
        total_cache_creation_tokens: usage.total_cache_creation_tokens,
        total_cost_usd: usage.total_cost_usd,
        ingested_at: ingested_at.to_string(),
        classified_at: None,
    };

    let details = &report.failures.details;
    let mut steps = Vec::new();
    for outcome in &report.step_outcomes {
        let Some(step_number) = outcome.step else {
            warn!(event = "step_outcome_without_number", run_id = %run_id);
            continue;
        };
        let raw_steps = raw_steps_for(report, step_number);
        let step_failures = failures_for_step(details, step_number);

        steps.push(StepRecord {
            id: step_id(&run_id, step_number),
            run_id: run_id.clone(),
            step_number,
            build_phase: outcome.build_phase.clone(),
            phase: derive_phase(&raw_steps),
            tool: derive_tool(&raw_steps),
            final_verdict: outcome.final_verdict.clone(),
            attempts: outcome.attempts,
            retries: outcome.retries,
            duration_seconds: outcome.duration_seconds,
            resolution_actions: outcome
                .resolution_actions
                .clone()
                .filter(|actions| !actions.is_empty()),
            error_categories: error_categories(&step_failures),
            errors_summary: errors_summary(&step_failures),
            classification: None,
            classification_confidence: None,
            classification_reasoning: None,
            classification_evidence: None,
            approach_changed: None,
            same_file_repeated: None,
            error_category_stable: None,
            input_tokens: outcome.input_tokens,
            output_tokens: outcome.output_tokens,
            cost_usd: outcome.cost_usd,
        });
    }

    let failures = details
        .iter()
        .map(|detail| FailureRecord {
            run_id: run_id.clone(),
            step_number: detail.step,
            build_phase: detail.build_phase.clone(),
            phase: detail.phase.clone(),
            category: detail.category.clone(),
            error: detail.error.clone(),
            exit_code: detail.exit_code,
        })
        .collect();

    let web_searches = report
        .web_searches
        .iter()
        .map(|entry| WebSearchRecord {
            run_id: run_id.clone(),
            step_id: entry.step_id.clone(),
            query: entry.query.clone(),
            count: entry.count,
            timestamp: entry.timestamp.clone(),
        })
        .collect();

    RunRecords {
        run,
        steps,
        failures,
        web_searches,
    }
}

/// Candidate report files under `reports_dir`, sorted by name for a
/// deterministic processing order.
pub fn discover_report_files(reports_dir: &Path) -> Vec<PathBuf> {
    let entries = match fs::read_dir(reports_dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(event = "reports_dir_unreadable", dir = %reports_dir.display(), error = %err);
            return Vec::new();
        }
    };

    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.ends_with(REPORT_SUFFIX))
        })
        .collect();
    files.sort();
    files
}

/// Ingest every candidate report in `reports_dir`. Failures are isolated
/// per file: a malformed report is counted and the rest of the batch
/// proceeds.
pub fn ingest_reports(store: &mut RunStore, reports_dir: &Path, force: bool) -> IngestOutcome {
    let mut outcome = IngestOutcome::default();

    if !reports_dir.is_dir() {
        warn!(event = "reports_dir_missing", dir = %reports_dir.display());
        return outcome;
    }

    let files = discover_report_files(reports_dir);
    if files.is_empty() {
        info!(event = "no_reports_found", dir = %reports_dir.display());
        return outcome;
    }
    info!(event = "ingest_scan", dir = %reports_dir.display(), files = files.len());

    for path in files {
        match ingest_file(store, &path, force) {
            Ok((WriteOutcome::Inserted, run_id)) => {
                info!(event = "report_ingested", run_id = %run_id);
                outcome.ingested += 1;
            }
            Ok((WriteOutcome::Replaced, run_id)) => {
                info!(event = "report_replaced", run_id = %run_id);
                outcome.ingested += 1;
            }
            Ok((WriteOutcome::SkippedExisting, run_id)) => {
                info!(event = "report_skipped", run_id = %run_id);
                outcome.skipped += 1;
            }
            Err(err) => {
                warn!(event = "report_error", file = %display_name(&path), error = %err);
                outcome.errors += 1;
            }
        }
    }

    outcome
}

fn ingest_file(
    store: &mut RunStore,
    path: &Path,
    force: bool,
) -> Result<(WriteOutcome, String), IngestError> {
    let report = read_report(path)?;
    let records = build_records(&report, &Utc::now().to_rfc3339());
    let outcome = store.write_records(&records, force)?;
    Ok((outcome, report.run_id))
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("<unnamed>")
        .to_string()
}

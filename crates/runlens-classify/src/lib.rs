use chrono::Utc;
use runlens_core::{Classification, FailureRecord, StepClassification, StepRecord};
use runlens_storage::{RunStore, StorageError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("run {0} not found")]
    RunNotFound(String),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Counts for one run's classification pass.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifyOutcome {
    pub classified: usize,
    pub skipped: usize,
    pub errors: usize,
}

/// Totals across a classify-everything pass.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllRunsOutcome {
    pub total_runs: usize,
    pub runs_classified: usize,
    pub total_steps_classified: usize,
    pub total_errors: usize,
}

/// The external classification collaborator. Implementations inspect one
/// step plus its failures and either return a verdict or leave the step
/// pending.
pub trait StepClassifier {
    fn classify(
        &self,
        step: &StepRecord,
        failures: &[FailureRecord],
    ) -> Option<StepClassification>;
}

/// Fallback used when no AI backend is configured: only unambiguous clean
/// passes are labeled; every other step stays pending for a later pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct CleanPassClassifier;

impl StepClassifier for CleanPassClassifier {
    fn classify(
        &self,
        step: &StepRecord,
        failures: &[FailureRecord],
    ) -> Option<StepClassification> {
        let passed = step
            .final_verdict
            .as_deref()
            .map(|verdict| {
                let verdict = verdict.to_uppercase();
                verdict == "PASS" || verdict == "PROCEED"
            })
            .unwrap_or(false);
        let retried = step.retries.unwrap_or(0) > 0;

        if passed && !retried && failures.is_empty() {
            Some(StepClassification {
                label: Classification::CleanPass,
                confidence: 1.0,
                reasoning: Some("no failures, no retries, passing verdict".to_string()),
                evidence: None,
                approach_changed: Some(false),
                same_file_repeated: Some(false),
                error_category_stable: None,
            })
        } else {
            None
        }
    }
}

/// Classify one run's pending steps. `force` wipes prior labels first so
/// the whole run is re-examined.
pub fn classify_run(
    store: &mut RunStore,
    classifier: &dyn StepClassifier,
    run_id: &str,
    force: bool,
) -> Result<ClassifyOutcome, ClassifyError> {
    if !store.run_exists(run_id)? {
        return Err(ClassifyError::RunNotFound(run_id.to_string()));
    }

    if force {
        info!(event = "clearing_classifications", run_id = %run_id);
        store.clear_classifications(run_id)?;
    }

    let mut outcome = ClassifyOutcome::default();
    for step in store.unclassified_steps(run_id)? {
        let failures = store.failures_for_step(run_id, step.step_number)?;
        match classifier.classify(&step, &failures) {
            Some(classification) => {
                if store.update_step_classification(&step.id, &classification)? {
                    outcome.classified += 1;
                } else {
                    warn!(event = "classification_lost_step", step_id = %step.id);
                    outcome.errors += 1;
                }
            }
            None => outcome.skipped += 1,
        }
    }

    store.mark_run_classified(run_id, Utc::now())?;
    info!(
        event = "run_classified",
        run_id = %run_id,
        classified = outcome.classified,
        skipped = outcome.skipped,
    );
    Ok(outcome)
}

/// Drive `classify_run` over every stored run, accumulating totals.
pub fn classify_all_runs(
    store: &mut RunStore,
    classifier: &dyn StepClassifier,
) -> Result<AllRunsOutcome, ClassifyError> {
    let run_ids = store.run_ids()?;
    let mut totals = AllRunsOutcome {
        total_runs: run_ids.len(),
        ..AllRunsOutcome::default()
    };

    for run_id in run_ids {
        match classify_run(store, classifier, &run_id, false) {
            Ok(outcome) => {
                totals.runs_classified += 1;
                totals.total_steps_classified += outcome.classified;
                totals.total_errors += outcome.errors;
            }
            Err(err) => {
                warn!(event = "run_classification_failed", run_id = %run_id, error = %err);
                totals.total_errors += 1;
            }
        }
    }

    Ok(totals)
}

use chrono::{DateTime, Utc};
use runlens_core::{
    CategoryCount, Classification, ClassificationCounts, ClassificationSummary, FailureRecord,
    HeatmapCell, PatternGroup, PhaseCount, RunRecord, RunRecords, SelfCorrectionRow, StatsPayload,
    StepClassification, StepRecord, ToolComparisonRow, ToolTriple, WebSearchRecord,
};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::path::Path;
use thiserror::Error;

pub const SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

/// Disposition of one report inside `write_records`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Inserted,
    Replaced,
    SkippedExisting,
}

/// Filters for the run-list query. All present filters must match.
#[derive(Debug, Default, Clone)]
pub struct RunFilter {
    pub status: Option<String>,
    pub has_architectural: Option<bool>,
    pub build_phase: Option<String>,
    pub error_category: Option<String>,
}

pub struct RunStore {
    conn: Connection,
}

const RUN_COLUMNS: &str = "run_id, generated_at, prompt, status, duration_minutes, \
     total_steps, passed_steps, failed_steps, total_retries, replan_checkpoints, \
     replans_triggered, success_rate, planner, implementer, verifier, models_used_json, \
     rls_issues, migration_issues, edge_function_issues, auth_issues, \
     total_input_tokens, total_output_tokens, total_cache_read_tokens, \
     total_cache_creation_tokens, total_cost_usd, ingested_at, classified_at";

const STEP_COLUMNS: &str = "id, run_id, step_number, build_phase, phase, tool, final_verdict, \
     attempts, retries, duration_seconds, resolution_actions_json, error_categories_json, \
     errors_summary, classification, classification_confidence, classification_reasoning, \
     classification_evidence, approach_changed, same_file_repeated, error_category_stable, \
     input_tokens, output_tokens, cost_usd";

impl RunStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_runlens_schema.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
        }

        Ok(())
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        let exists = self
            .conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type='table' AND name = ?1 LIMIT 1",
                [table_name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(exists.is_some())
    }

    /// Commit one report's records. The existence check, the forced delete,
    /// and the inserts all happen inside a single transaction, so two callers
    /// racing on the same run id can never interleave a partial replace.
    pub fn write_records(
        &mut self,
        records: &RunRecords,
        force: bool,
    ) -> Result<WriteOutcome, StorageError> {
        let tx = self.conn.transaction()?;
        let exists = run_exists_in(&tx, &records.run.run_id)?;

        if exists && !force {
            return Ok(WriteOutcome::SkippedExisting);
        }
        if exists {
            delete_run_in(&tx, &records.run.run_id)?;
        }
        insert_records(&tx, records)?;
        tx.commit()?;

        Ok(if exists {
            WriteOutcome::Replaced
        } else {
            WriteOutcome::Inserted
        })
    }

    /// Remove a run and everything attached to it, children before parent.
    /// Returns false when the run was not present.
    pub fn delete_run(&mut self, run_id: &str) -> Result<bool, StorageError> {
        let tx = self.conn.transaction()?;
        if !run_exists_in(&tx, run_id)? {
            return Ok(false);
        }
        delete_run_in(&tx, run_id)?;
        tx.commit()?;
        Ok(true)
    }

    pub fn run_exists(&self, run_id: &str) -> Result<bool, StorageError> {
        run_exists_in(&self.conn, run_id)
    }

    pub fn run(&self, run_id: &str) -> Result<Option<RunRecord>, StorageError> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM runs WHERE run_id = ?1");
        let row = self
            .conn
            .query_row(&sql, [run_id], run_from_row)
            .optional()?;
        Ok(row)
    }

    /// All runs, newest generation timestamp first; runs without a timestamp
    /// sort as empty string, i.e. last.
    pub fn runs(&self) -> Result<Vec<RunRecord>, StorageError> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM runs \
             ORDER BY COALESCE(generated_at, '') DESC, run_id ASC"
        );
        let mut statement = self.conn.prepare(&sql)?;
        let rows = statement.query_map([], run_from_row)?;

        let mut runs = Vec::new();
        for row in rows {
            runs.push(row?);
        }
        Ok(runs)
    }

    pub fn run_ids(&self) -> Result<Vec<String>, StorageError> {
        let mut statement = self.conn.prepare(
            "SELECT run_id FROM runs ORDER BY COALESCE(generated_at, '') DESC, run_id ASC",
        )?;
        let rows = statement.query_map([], |row| row.get(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    /// Runs with their classification summaries, filtered per `filter`.
    pub fn runs_filtered(
        &self,
        filter: &RunFilter,
    ) -> Result<Vec<(RunRecord, ClassificationSummary)>, StorageError> {
        let mut out = Vec::new();
        for run in self.runs()? {
            if let Some(status) = &filter.status {
                if run.status.as_deref() != Some(status.as_str()) {
                    continue;
                }
            }
            let summary = self.classification_summary(&run.run_id)?;
            if let Some(wanted) = filter.has_architectural {
                let has = summary
                    .get(Classification::Architectural.as_str())
                    .copied()
                    .unwrap_or(0)
                    > 0;
                if has != wanted {
                    continue;
                }
            }
            if let Some(phase) = &filter.build_phase {
                if !self.run_has_build_phase(&run.run_id, phase)? {
                    continue;
                }
            }
            if let Some(category) = &filter.error_category {
                if !self.run_has_error_category(&run.run_id, category)? {
                    continue;
                }
            }
            out.push((run, summary));
        }
        Ok(out)
    }

    fn run_has_build_phase(&self, run_id: &str, phase: &str) -> Result<bool, StorageError> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM steps WHERE run_id = ?1 AND build_phase = ?2 LIMIT 1",
                params![run_id, phase],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn run_has_error_category(&self, run_id: &str, category: &str) -> Result<bool, StorageError> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM failures WHERE run_id = ?1 AND category = ?2 LIMIT 1",
                params![run_id, category],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn steps_for_run(&self, run_id: &str) -> Result<Vec<StepRecord>, StorageError> {
        let sql = format!(
            "SELECT {STEP_COLUMNS} FROM steps WHERE run_id = ?1 ORDER BY step_number ASC"
        );
        let mut statement = self.conn.prepare(&sql)?;
        let rows = statement.query_map([run_id], step_from_row)?;

        let mut steps = Vec::new();
        for row in rows {
            steps.push(row?);
        }
        Ok(steps)
    }

    pub fn step_detail(
        &self,
        run_id: &str,
        step_number: i64,
    ) -> Result<Option<StepRecord>, StorageError> {
        let sql = format!(
            "SELECT {STEP_COLUMNS} FROM steps WHERE run_id = ?1 AND step_number = ?2"
        );
        let row = self
            .conn
            .query_row(&sql, params![run_id, step_number], step_from_row)
            .optional()?;
        Ok(row)
    }

    pub fn failures_for_run(&self, run_id: &str) -> Result<Vec<FailureRecord>, StorageError> {
        let mut statement = self.conn.prepare(
            "SELECT run_id, step_number, build_phase, phase, category, error, exit_code \
             FROM failures WHERE run_id = ?1 ORDER BY id ASC",
        )?;
        let rows = statement.query_map([run_id], failure_from_row)?;

        let mut failures = Vec::new();
        for row in rows {
            failures.push(row?);
        }
        Ok(failures)
    }

    pub fn failures_for_step(
        &self,
        run_id: &str,
        step_number: i64,
    ) -> Result<Vec<FailureRecord>, StorageError> {
        let mut statement = self.conn.prepare(
            "SELECT run_id, step_number, build_phase, phase, category, error, exit_code \
             FROM failures WHERE run_id = ?1 AND step_number = ?2 ORDER BY id ASC",
        )?;
        let rows = statement.query_map(params![run_id, step_number], failure_from_row)?;

        let mut failures = Vec::new();
        for row in rows {
            failures.push(row?);
        }
        Ok(failures)
    }

    pub fn web_searches_for_run(
        &self,
        run_id: &str,
    ) -> Result<Vec<WebSearchRecord>, StorageError> {
        let mut statement = self.conn.prepare(
            "SELECT run_id, step_id, query, count, timestamp \
             FROM web_searches WHERE run_id = ?1 ORDER BY id ASC",
        )?;
        let rows = statement.query_map([run_id], web_search_from_row)?;

        let mut searches = Vec::new();
        for row in rows {
            searches.push(row?);
        }
        Ok(searches)
    }

    pub fn web_searches_for_step(
        &self,
        run_id: &str,
        step_id: &str,
    ) -> Result<Vec<WebSearchRecord>, StorageError> {
        let mut statement = self.conn.prepare(
            "SELECT run_id, step_id, query, count, timestamp \
             FROM web_searches WHERE run_id = ?1 AND step_id = ?2 ORDER BY id ASC",
        )?;
        let rows = statement.query_map(params![run_id, step_id], web_search_from_row)?;

        let mut searches = Vec::new();
        for row in rows {
            searches.push(row?);
        }
        Ok(searches)
    }

    /// Per-run step counts keyed by classification label; NULL and empty
    /// labels land in the `pending` bucket.
    pub fn classification_summary(
        &self,
        run_id: &str,
    ) -> Result<ClassificationSummary, StorageError> {
        let mut statement = self.conn.prepare(
            "SELECT COALESCE(NULLIF(classification, ''), 'pending') AS label, COUNT(*) \
             FROM steps WHERE run_id = ?1 GROUP BY label",
        )?;
        let rows = statement.query_map([run_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut summary = ClassificationSummary::new();
        for row in rows {
            let (label, count) = row?;
            *summary.entry(label).or_insert(0) += count;
        }
        Ok(summary)
    }

    pub fn stats(&self) -> Result<StatsPayload, StorageError> {
        let total_runs = self.count("SELECT COUNT(*) FROM runs")?;
        let completed_runs =
            self.count("SELECT COUNT(*) FROM runs WHERE status = 'success'")?;
        let failed_runs = self.count("SELECT COUNT(*) FROM runs WHERE status = 'failed'")?;
        let total_steps = self.count("SELECT COUNT(*) FROM steps")?;
        let total_failures = self.count("SELECT COUNT(*) FROM failures")?;
        let total_retries =
            self.count("SELECT COALESCE(SUM(total_retries), 0) FROM runs")?;

        let avg_success_rate: Option<f64> = self.conn.query_row(
            "SELECT AVG(success_rate) FROM runs WHERE success_rate IS NOT NULL",
            [],
            |row| row.get(0),
        )?;

        let mut statement = self.conn.prepare(
            "SELECT COALESCE(classification, 'pending') AS label, COUNT(*) \
             FROM steps GROUP BY label",
        )?;
        let rows = statement.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut counts = ClassificationCounts::default();
        for row in rows {
            let (label, count) = row?;
            match label.to_lowercase().as_str() {
                "architectural" => counts.architectural = count,
                "implementation" => counts.implementation = count,
                "clean_pass" => counts.clean_pass = count,
                "ambiguous" => counts.ambiguous = count,
                "pending" => counts.pending = count,
                "" => counts.pending += count,
                _ => {}
            }
        }

        let mut statement = self.conn.prepare(
            "SELECT category, COUNT(*) as count FROM failures \
             WHERE category IS NOT NULL AND category != '' \
             GROUP BY category ORDER BY count DESC LIMIT 10",
        )?;
        let rows = statement.query_map([], |row| {
            Ok(CategoryCount {
                category: row.get(0)?,
                count: row.get(1)?,
            })
        })?;
        let mut top_error_categories = Vec::new();
        for row in rows {
            top_error_categories.push(row?);
        }

        let mut statement = self.conn.prepare(
            "SELECT build_phase, COUNT(*) as count FROM failures \
             WHERE build_phase IS NOT NULL AND build_phase != '' \
             GROUP BY build_phase ORDER BY count DESC",
        )?;
        let rows = statement.query_map([], |row| {
            Ok(PhaseCount {
                build_phase: row.get(0)?,
                count: row.get(1)?,
            })
        })?;
        let mut top_failure_phases = Vec::new();
        for row in rows {
            top_failure_phases.push(row?);
        }

        Ok(StatsPayload {
            total_runs,
            completed_runs,
            failed_runs,
            total_steps,
            total_failures,
            total_retries,
            avg_success_rate: avg_success_rate.map(|rate| round_to(rate, 4)).unwrap_or(0.0),
            classification_counts: counts,
            top_error_categories,
            top_failure_phases,
        })
    }

    /// Failure counts by (category, build phase), cross-tabulated with the
    /// owning step's classification, descending by total.
    pub fn error_heatmap(&self) -> Result<Vec<HeatmapCell>, StorageError> {
        let mut statement = self.conn.prepare(
            "SELECT f.category, f.build_phase, COUNT(*) as count, \
                    SUM(CASE WHEN s.classification = 'architectural' THEN 1 ELSE 0 END), \
                    SUM(CASE WHEN s.classification = 'implementation' THEN 1 ELSE 0 END) \
             FROM failures f \
             LEFT JOIN steps s ON f.run_id = s.run_id AND f.step_number = s.step_number \
             WHERE f.category IS NOT NULL AND f.category != '' \
               AND f.build_phase IS NOT NULL AND f.build_phase != '' \
             GROUP BY f.category, f.build_phase \
             ORDER BY count DESC",
        )?;
        let rows = statement.query_map([], |row| {
            Ok(HeatmapCell {
                category: row.get(0)?,
                build_phase: row.get(1)?,
                count: row.get(2)?,
                architectural: row.get::<_, Option<i64>>(3)?.unwrap_or(0),
                implementation: row.get::<_, Option<i64>>(4)?.unwrap_or(0),
            })
        })?;

        let mut cells = Vec::new();
        for row in rows {
            cells.push(row?);
        }
        Ok(cells)
    }

    /// Heatmap grouping plus up to 5 example run ids per group, top 20 groups.
    pub fn top_patterns(&self) -> Result<Vec<PatternGroup>, StorageError> {
        let mut statement = self.conn.prepare(
            "SELECT f.category, f.build_phase, COUNT(*) as total_occurrences, \
                    SUM(CASE WHEN s.classification = 'architectural' THEN 1 ELSE 0 END), \
                    SUM(CASE WHEN s.classification = 'implementation' THEN 1 ELSE 0 END), \
                    GROUP_CONCAT(DISTINCT f.run_id) \
             FROM failures f \
             LEFT JOIN steps s ON f.run_id = s.run_id AND f.step_number = s.step_number \
             WHERE f.category IS NOT NULL AND f.category != '' \
               AND f.build_phase IS NOT NULL AND f.build_phase != '' \
             GROUP BY f.category, f.build_phase \
             ORDER BY total_occurrences DESC \
             LIMIT 20",
        )?;
        let rows = statement.query_map([], |row| {
            let run_ids: Option<String> = row.get(5)?;
            let example_run_ids = run_ids
                .map(|joined| {
                    joined
                        .split(',')
                        .take(5)
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            Ok(PatternGroup {
                category: row.get(0)?,
                build_phase: row.get(1)?,
                total_occurrences: row.get(2)?,
                architectural_count: row.get::<_, Option<i64>>(3)?.unwrap_or(0),
                implementation_count: row.get::<_, Option<i64>>(4)?.unwrap_or(0),
                example_run_ids,
            })
        })?;

        let mut groups = Vec::new();
        for row in rows {
            groups.push(row?);
        }
        Ok(groups)
    }

    /// Per error category, how often retried steps ended in a passing verdict.
    pub fn self_correction(&self) -> Result<Vec<SelfCorrectionRow>, StorageError> {
        let mut statement = self.conn.prepare(
            "SELECT f.category, COUNT(DISTINCT s.id) as total, \
                    SUM(CASE WHEN s.retries > 0 AND UPPER(s.final_verdict) IN ('PROCEED', 'PASS') \
                        THEN 1 ELSE 0 END), \
                    SUM(CASE WHEN s.retries > 0 AND UPPER(s.final_verdict) IN ('FAIL', 'SKIP') \
                        THEN 1 ELSE 0 END) \
             FROM failures f \
             JOIN steps s ON f.run_id = s.run_id AND f.step_number = s.step_number \
             WHERE f.category IS NOT NULL AND f.category != '' AND s.retries > 0 \
             GROUP BY f.category \
             ORDER BY total DESC",
        )?;
        let rows = statement.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Option<i64>>(2)?.unwrap_or(0),
                row.get::<_, Option<i64>>(3)?.unwrap_or(0),
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (category, total, self_corrected, failed) = row?;
            let rate = if total > 0 {
                round_to(self_corrected as f64 / total as f64, 3)
            } else {
                0.0
            };
            out.push(SelfCorrectionRow {
                category,
                total,
                self_corrected,
                failed,
                rate,
            });
        }
        Ok(out)
    }

    /// Per (planner, implementer, verifier) triple: run count, average
    /// success rate, total retries, and classification counts across all
    /// steps belonging to matching runs.
    pub fn tool_comparison(&self) -> Result<Vec<ToolComparisonRow>, StorageError> {
        let mut statement = self.conn.prepare(
            "SELECT planner, implementer, verifier, COUNT(*) as run_count, \
                    AVG(success_rate), COALESCE(SUM(total_retries), 0) \
             FROM runs WHERE planner IS NOT NULL \
             GROUP BY planner, implementer, verifier \
             ORDER BY run_count DESC",
        )?;
        let rows = statement.query_map([], |row| {
            Ok((
                ToolTriple {
                    planner: row.get(0)?,
                    implementer: row.get(1)?,
                    verifier: row.get(2)?,
                },
                row.get::<_, i64>(3)?,
                row.get::<_, Option<f64>>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?;

        let mut grouped = Vec::new();
        for row in rows {
            grouped.push(row?);
        }

        let mut out = Vec::new();
        for (tools, run_count, avg_success_rate, total_retries) in grouped {
            let (architectural_count, implementation_count) = self.conn.query_row(
                "SELECT SUM(CASE WHEN s.classification = 'architectural' THEN 1 ELSE 0 END), \
                        SUM(CASE WHEN s.classification = 'implementation' THEN 1 ELSE 0 END) \
                 FROM steps s JOIN runs r ON s.run_id = r.run_id \
                 WHERE r.planner = ?1 AND r.implementer IS ?2 AND r.verifier IS ?3",
                params![tools.planner, tools.implementer, tools.verifier],
                |row| {
                    Ok((
                        row.get::<_, Option<i64>>(0)?.unwrap_or(0),
                        row.get::<_, Option<i64>>(1)?.unwrap_or(0),
                    ))
                },
            )?;

            out.push(ToolComparisonRow {
                tools,
                run_count,
                avg_success_rate: avg_success_rate
                    .map(|rate| round_to(rate, 4))
                    .unwrap_or(0.0),
                total_retries,
                architectural_count,
                implementation_count,
            });
        }
        Ok(out)
    }

    pub fn unclassified_steps(&self, run_id: &str) -> Result<Vec<StepRecord>, StorageError> {
        let sql = format!(
            "SELECT {STEP_COLUMNS} FROM steps \
             WHERE run_id = ?1 AND (classification IS NULL OR classification = '') \
             ORDER BY step_number ASC"
        );
        let mut statement = self.conn.prepare(&sql)?;
        let rows = statement.query_map([run_id], step_from_row)?;

        let mut steps = Vec::new();
        for row in rows {
            steps.push(row?);
        }
        Ok(steps)
    }

    /// The only post-create mutation: the classifier writing its verdict
    /// back onto a step. Returns false when the step id is unknown.
    pub fn update_step_classification(
        &mut self,
        step_id: &str,
        classification: &StepClassification,
    ) -> Result<bool, StorageError> {
        let changes = self.conn.execute(
            "UPDATE steps SET \
                classification = ?1, \
                classification_confidence = ?2, \
                classification_reasoning = ?3, \
                classification_evidence = ?4, \
                approach_changed = ?5, \
                same_file_repeated = ?6, \
                error_category_stable = ?7 \
             WHERE id = ?8",
            params![
                classification.label.as_str(),
                classification.confidence,
                classification.reasoning,
                classification.evidence,
                classification.approach_changed.map(i64::from),
                classification.same_file_repeated.map(i64::from),
                classification.error_category_stable.map(i64::from),
                step_id,
            ],
        )?;
        Ok(changes > 0)
    }

    pub fn mark_run_classified(
        &mut self,
        run_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.conn.execute(
            "UPDATE runs SET classified_at = ?1 WHERE run_id = ?2",
            params![at.to_rfc3339(), run_id],
        )?;
        Ok(())
    }

    /// Reset all classifier-owned fields for a run, for forced
    /// reclassification.
    pub fn clear_classifications(&mut self, run_id: &str) -> Result<(), StorageError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "UPDATE steps SET \
                classification = NULL, \
                classification_confidence = NULL, \
                classification_reasoning = NULL, \
                classification_evidence = NULL, \
                approach_changed = NULL, \
                same_file_repeated = NULL, \
                error_category_stable = NULL \
             WHERE run_id = ?1",
            [run_id],
        )?;
        tx.execute(
            "UPDATE runs SET classified_at = NULL WHERE run_id = ?1",
            [run_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn count(&self, sql: &str) -> Result<i64, StorageError> {
        Ok(self.conn.query_row(sql, [], |row| row.get(0))?)
    }
}

fn run_exists_in(conn: &Connection, run_id: &str) -> Result<bool, StorageError> {
    let found = conn
        .query_row(
            "SELECT 1 FROM runs WHERE run_id = ?1 LIMIT 1",
            [run_id],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

fn delete_run_in(conn: &Connection, run_id: &str) -> Result<(), StorageError> {
    conn.execute("DELETE FROM web_searches WHERE run_id = ?1", [run_id])?;
    conn.execute("DELETE FROM failures WHERE run_id = ?1", [run_id])?;
    conn.execute("DELETE FROM steps WHERE run_id = ?1", [run_id])?;
    conn.execute("DELETE FROM runs WHERE run_id = ?1", [run_id])?;
    Ok(())
}

fn insert_records(tx: &Transaction<'_>, records: &RunRecords) -> Result<(), StorageError> {
    let run = &records.run;
    let models_used_json = encode_json_list(run.models_used.as_ref())?;

    tx.execute(
        &format!(
            "INSERT INTO runs ({RUN_COLUMNS}) VALUES (\
             ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, \
             ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27)"
        ),
        params![
            run.run_id,
            run.generated_at,
            run.prompt,
            run.status,
            run.duration_minutes,
            run.total_steps,
            run.passed_steps,
            run.failed_steps,
            run.total_retries,
            run.replan_checkpoints,
            run.replans_triggered,
            run.success_rate,
            run.planner,
            run.implementer,
            run.verifier,
            models_used_json,
            run.rls_issues,
            run.migration_issues,
            run.edge_function_issues,
            run.auth_issues,
            run.total_input_tokens,
            run.total_output_tokens,
            run.total_cache_read_tokens,
            run.total_cache_creation_tokens,
            run.total_cost_usd,
            run.ingested_at,
            run.classified_at,
        ],
    )?;

    for step in &records.steps {
        let resolution_actions_json = encode_json_list(step.resolution_actions.as_ref())?;
        let error_categories_json = encode_json_list(step.error_categories.as_ref())?;

        tx.execute(
            &format!(
                "INSERT INTO steps ({STEP_COLUMNS}) VALUES (\
                 ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, \
                 ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23)"
            ),
            params![
                step.id,
                step.run_id,
                step.step_number,
                step.build_phase,
                step.phase,
                step.tool,
                step.final_verdict,
                step.attempts,
                step.retries,
                step.duration_seconds,
                resolution_actions_json,
                error_categories_json,
                step.errors_summary,
                step.classification,
                step.classification_confidence,
                step.classification_reasoning,
                step.classification_evidence,
                step.approach_changed.map(i64::from),
                step.same_file_repeated.map(i64::from),
                step.error_category_stable.map(i64::from),
                step.input_tokens,
                step.output_tokens,
                step.cost_usd,
            ],
        )?;
    }

    for failure in &records.failures {
        tx.execute(
            "INSERT INTO failures \
             (run_id, step_number, build_phase, phase, category, error, exit_code) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                failure.run_id,
                failure.step_number,
                failure.build_phase,
                failure.phase,
                failure.category,
                failure.error,
                failure.exit_code,
            ],
        )?;
    }

    for search in &records.web_searches {
        tx.execute(
            "INSERT INTO web_searches (run_id, step_id, query, count, timestamp) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                search.run_id,
                search.step_id,
                search.query,
                search.count,
                search.timestamp,
            ],
        )?;
    }

    Ok(())
}

fn run_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRecord> {
    Ok(RunRecord {
        run_id: row.get(0)?,
        generated_at: row.get(1)?,
        prompt: row.get(2)?,
        status: row.get(3)?,
        duration_minutes: row.get(4)?,
        total_steps: row.get(5)?,
        passed_steps: row.get(6)?,
        failed_steps: row.get(7)?,
        total_retries: row.get(8)?,
        replan_checkpoints: row.get(9)?,
        replans_triggered: row.get(10)?,
        success_rate: row.get(11)?,
        planner: row.get(12)?,
        implementer: row.get(13)?,
        verifier: row.get(14)?,
        models_used: decode_json_list(15, row.get(15)?)?,
        rls_issues: row.get(16)?,
        migration_issues: row.get(17)?,
        edge_function_issues: row.get(18)?,
        auth_issues: row.get(19)?,
        total_input_tokens: row.get(20)?,
        total_output_tokens: row.get(21)?,
        total_cache_read_tokens: row.get(22)?,
        total_cache_creation_tokens: row.get(23)?,
        total_cost_usd: row.get(24)?,
        ingested_at: row.get(25)?,
        classified_at: row.get(26)?,
    })
}

fn step_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StepRecord> {
    Ok(StepRecord {
        id: row.get(0)?,
        run_id: row.get(1)?,
        step_number: row.get(2)?,
        build_phase: row.get(3)?,
        phase: row.get(4)?,
        tool: row.get(5)?,
        final_verdict: row.get(6)?,
        attempts: row.get(7)?,
        retries: row.get(8)?,
        duration_seconds: row.get(9)?,
        resolution_actions: decode_json_list(10, row.get(10)?)?,
        error_categories: decode_json_list(11, row.get(11)?)?,
        errors_summary: row.get(12)?,
        classification: row.get(13)?,
        classification_confidence: row.get(14)?,
        classification_reasoning: row.get(15)?,
        classification_evidence: row.get(16)?,
        approach_changed: row.get::<_, Option<i64>>(17)?.map(|value| value != 0),
        same_file_repeated: row.get::<_, Option<i64>>(18)?.map(|value| value != 0),
        error_category_stable: row.get::<_, Option<i64>>(19)?.map(|value| value != 0),
        input_tokens: row.get(20)?,
        output_tokens: row.get(21)?,
        cost_usd: row.get(22)?,
    })
}

fn failure_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FailureRecord> {
    Ok(FailureRecord {
        run_id: row.get(0)?,
        step_number: row.get(1)?,
        build_phase: row.get(2)?,
        phase: row.get(3)?,
        category: row.get(4)?,
        error: row.get(5)?,
        exit_code: row.get(6)?,
    })
}

fn web_search_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<WebSearchRecord> {
    Ok(WebSearchRecord {
        run_id: row.get(0)?,
        step_id: row.get(1)?,
        query: row.get(2)?,
        count: row.get(3)?,
        timestamp: row.get(4)?,
    })
}

fn encode_json_list(list: Option<&Vec<String>>) -> Result<Option<String>, StorageError> {
    list.map(|values| {
        serde_json::to_string(values).map_err(|err| StorageError::Serialization(err.to_string()))
    })
    .transpose()
}

fn decode_json_list(
    index: usize,
    raw: Option<String>,
) -> rusqlite::Result<Option<Vec<String>>> {
    raw.map(|json| {
        serde_json::from_str(&json).map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(
                index,
                rusqlite::types::Type::Text,
                Box::new(err),
            )
        })
    })
    .transpose()
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use runlens_core::step_id;
    use tempfile::NamedTempFile;

    fn sample_run(run_id: &str) -> RunRecord {
        RunRecord {
            run_id: run_id.to_string(),
            generated_at: Some("2026-07-01T10:00:00Z".to_string()),
            prompt: Some("build a todo app".to_string()),
            status: Some("success".to_string()),
            duration_minutes: Some(12.5),
            total_steps: Some(2),
            passed_steps: Some(2),
            failed_steps: Some(0),
            total_retries: Some(1),
            replan_checkpoints: Some(0),
            replans_triggered: Some(0),
            success_rate: Some(1.0),
            planner: Some("claude".to_string()),
            implementer: Some("codex".to_string()),
            verifier: Some("claude".to_string()),
            models_used: Some(vec!["opus".to_string(), "sonnet".to_string()]),
            rls_issues: 0,
            migration_issues: 0,
            edge_function_issues: 0,
            auth_issues: 0,
            total_input_tokens: 1000,
            total_output_tokens: 500,
            total_cache_read_tokens: 0,
            total_cache_creation_tokens: 0,
            total_cost_usd: 0.42,
            ingested_at: "2026-07-02T00:00:00Z".to_string(),
            classified_at: None,
        }
    }

    fn sample_step(run_id: &str, step_number: i64) -> StepRecord {
        StepRecord {
            id: step_id(run_id, step_number),
            run_id: run_id.to_string(),
            step_number,
            build_phase: Some("build".to_string()),
            phase: Some("implement".to_string()),
            tool: Some("claude".to_string()),
            final_verdict: Some("PASS".to_string()),
            attempts: Some(1),
            retries: Some(0),
            duration_seconds: Some(30.0),
            resolution_actions: None,
            error_categories: None,
            errors_summary: None,
            classification: None,
            classification_confidence: None,
            classification_reasoning: None,
            classification_evidence: None,
            approach_changed: None,
            same_file_repeated: None,
            error_category_stable: None,
            input_tokens: 100,
            output_tokens: 50,
            cost_usd: 0.01,
        }
    }

    fn sample_failure(run_id: &str, step_number: i64, category: &str) -> FailureRecord {
        FailureRecord {
            run_id: run_id.to_string(),
            step_number: Some(step_number),
            build_phase: Some("build".to_string()),
            phase: Some("implement".to_string()),
            category: Some(category.to_string()),
            error: Some(format!("{category} exploded")),
            exit_code: Some(1),
        }
    }

    fn sample_records(run_id: &str) -> RunRecords {
        RunRecords {
            run: sample_run(run_id),
            steps: vec![sample_step(run_id, 1), sample_step(run_id, 2)],
            failures: vec![sample_failure(run_id, 1, "type_error")],
            web_searches: vec![WebSearchRecord {
                run_id: run_id.to_string(),
                step_id: Some(step_id(run_id, 1)),
                query: Some("rust borrow checker".to_string()),
                count: Some(2),
                timestamp: Some("2026-07-01T10:05:00Z".to_string()),
            }],
        }
    }

    #[test]
    fn migration_creates_tables() {
        let store = RunStore::open_in_memory().expect("open store");
        for table in ["runs", "steps", "failures", "web_searches"] {
            assert!(store.table_exists(table).expect("table check"), "{table}");
        }
        assert_eq!(store.schema_version().expect("schema version"), SCHEMA_VERSION);
    }

    #[test]
    fn migration_is_idempotent_on_reopen() {
        let file = NamedTempFile::new().expect("temp db");
        {
            let mut store = RunStore::open(file.path()).expect("open store");
            store
                .write_records(&sample_records("run-1"), false)
                .expect("write");
        }
        let store = RunStore::open(file.path()).expect("reopen store");
        assert!(store.run_exists("run-1").expect("exists"));
    }

    #[test]
    fn write_skip_and_force_replace() {
        let mut store = RunStore::open_in_memory().expect("open store");

        let outcome = store
            .write_records(&sample_records("run-1"), false)
            .expect("first write");
        assert_eq!(outcome, WriteOutcome::Inserted);

        let outcome = store
            .write_records(&sample_records("run-1"), false)
            .expect("second write");
        assert_eq!(outcome, WriteOutcome::SkippedExisting);
        assert_eq!(store.steps_for_run("run-1").expect("steps").len(), 2);

        let mut updated = sample_records("run-1");
        updated.steps.push(sample_step("run-1", 3));
        let outcome = store.write_records(&updated, true).expect("forced write");
        assert_eq!(outcome, WriteOutcome::Replaced);
        assert_eq!(store.steps_for_run("run-1").expect("steps").len(), 3);
        assert_eq!(store.runs().expect("runs").len(), 1);
    }

    #[test]
    fn skipped_write_leaves_store_untouched() {
        let mut store = RunStore::open_in_memory().expect("open store");
        store
            .write_records(&sample_records("run-1"), false)
            .expect("write");

        let mut mutated = sample_records("run-1");
        mutated.failures.push(sample_failure("run-1", 2, "timeout"));
        store.write_records(&mutated, false).expect("skip");

        assert_eq!(store.failures_for_run("run-1").expect("failures").len(), 1);
    }

    #[test]
    fn delete_run_cascades_to_children() {
        let mut store = RunStore::open_in_memory().expect("open store");
        store
            .write_records(&sample_records("run-1"), false)
            .expect("write");

        assert!(store.delete_run("run-1").expect("delete"));
        assert!(!store.run_exists("run-1").expect("exists"));
        assert!(store.steps_for_run("run-1").expect("steps").is_empty());
        assert!(store.failures_for_run("run-1").expect("failures").is_empty());
        assert!(store
            .web_searches_for_run("run-1")
            .expect("searches")
            .is_empty());

        assert!(!store.delete_run("run-1").expect("second delete"));
    }

    #[test]
    fn runs_sort_newest_first_with_missing_timestamp_last() {
        let mut store = RunStore::open_in_memory().expect("open store");

        let mut old = sample_records("run-old");
        old.run.generated_at = Some("2026-01-01T00:00:00Z".to_string());
        let mut new = sample_records("run-new");
        new.run.generated_at = Some("2026-06-01T00:00:00Z".to_string());
        let mut undated = sample_records("run-undated");
        undated.run.generated_at = None;

        for records in [&undated, &old, &new] {
            store.write_records(records, false).expect("write");
        }

        let ids: Vec<String> = store
            .runs()
            .expect("runs")
            .into_iter()
            .map(|run| run.run_id)
            .collect();
        assert_eq!(ids, vec!["run-new", "run-old", "run-undated"]);
    }

    #[test]
    fn round_trips_json_list_columns() {
        let mut store = RunStore::open_in_memory().expect("open store");
        let mut records = sample_records("run-1");
        records.steps[0].resolution_actions =
            Some(vec!["retry".to_string(), "replan".to_string()]);
        records.steps[0].error_categories = Some(vec!["type_error".to_string()]);
        store.write_records(&records, false).expect("write");

        let run = store.run("run-1").expect("query").expect("present");
        assert_eq!(
            run.models_used,
            Some(vec!["opus".to_string(), "sonnet".to_string()])
        );

        let steps = store.steps_for_run("run-1").expect("steps");
        assert_eq!(
            steps[0].resolution_actions,
            Some(vec!["retry".to_string(), "replan".to_string()])
        );
        assert_eq!(steps[0].error_categories, Some(vec!["type_error".to_string()]));
    }

    #[test]
    fn classification_summary_buckets_null_as_pending() {
        let mut store = RunStore::open_in_memory().expect("open store");
        store
            .write_records(&sample_records("run-1"), false)
            .expect("write");

        let classification = StepClassification {
            label: Classification::Architectural,
            confidence: 0.9,
            reasoning: Some("schema mismatch across steps".to_string()),
            evidence: None,
            approach_changed: Some(true),
            same_file_repeated: Some(false),
            error_category_stable: None,
        };
        assert!(store
            .update_step_classification(&step_id("run-1", 1), &classification)
            .expect("update"));

        let summary = store.classification_summary("run-1").expect("summary");
        assert_eq!(summary.get("architectural"), Some(&1));
        assert_eq!(summary.get("pending"), Some(&1));
    }

    #[test]
    fn clear_classifications_resets_steps_and_run_stamp() {
        let mut store = RunStore::open_in_memory().expect("open store");
        store
            .write_records(&sample_records("run-1"), false)
            .expect("write");

        let classification = StepClassification {
            label: Classification::Implementation,
            confidence: 0.7,
            reasoning: None,
            evidence: None,
            approach_changed: None,
            same_file_repeated: None,
            error_category_stable: None,
        };
        store
            .update_step_classification(&step_id("run-1", 1), &classification)
            .expect("update");
        store
            .mark_run_classified("run-1", Utc::now())
            .expect("mark classified");
        assert!(store
            .run("run-1")
            .expect("query")
            .expect("present")
            .classified_at
            .is_some());

        store.clear_classifications("run-1").expect("clear");
        let run = store.run("run-1").expect("query").expect("present");
        assert!(run.classified_at.is_none());
        assert_eq!(store.unclassified_steps("run-1").expect("steps").len(), 2);
    }

    #[test]
    fn stats_aggregates_runs_steps_and_failures() {
        let mut store = RunStore::open_in_memory().expect("open store");

        let mut success = sample_records("run-ok");
        success.run.success_rate = Some(1.0);
        let mut failed = sample_records("run-bad");
        failed.run.status = Some("failed".to_string());
        failed.run.success_rate = Some(0.5);
        failed.failures.push(sample_failure("run-bad", 2, "timeout"));
        failed.failures.push(sample_failure("run-bad", 2, "timeout"));
        failed.failures.push(sample_failure("run-bad", 2, "timeout"));

        store.write_records(&success, false).expect("write");
        store.write_records(&failed, false).expect("write");

        let stats = store.stats().expect("stats");
        assert_eq!(stats.total_runs, 2);
        assert_eq!(stats.completed_runs, 1);
        assert_eq!(stats.failed_runs, 1);
        assert_eq!(stats.total_steps, 4);
        assert_eq!(stats.total_failures, 5);
        assert_eq!(stats.total_retries, 2);
        assert_eq!(stats.avg_success_rate, 0.75);
        assert_eq!(stats.classification_counts.pending, 4);
        assert_eq!(stats.top_error_categories[0].category, "timeout");
        assert_eq!(stats.top_error_categories[0].count, 3);
        assert_eq!(stats.top_failure_phases[0].build_phase, "build");
    }

    #[test]
    fn heatmap_and_patterns_group_by_category_and_phase() {
        let mut store = RunStore::open_in_memory().expect("open store");

        let mut records = sample_records("run-1");
        records.failures = vec![
            sample_failure("run-1", 1, "type_error"),
            sample_failure("run-1", 2, "type_error"),
            sample_failure("run-1", 2, "timeout"),
        ];
        store.write_records(&records, false).expect("write");

        let classification = StepClassification {
            label: Classification::Architectural,
            confidence: 0.8,
            reasoning: None,
            evidence: None,
            approach_changed: None,
            same_file_repeated: None,
            error_category_stable: None,
        };
        store
            .update_step_classification(&step_id("run-1", 1), &classification)
            .expect("update");

        let heatmap = store.error_heatmap().expect("heatmap");
        assert_eq!(heatmap.len(), 2);
        assert_eq!(heatmap[0].category, "type_error");
        assert_eq!(heatmap[0].count, 2);
        assert_eq!(heatmap[0].architectural, 1);
        assert_eq!(heatmap[0].implementation, 0);

        let patterns = store.top_patterns().expect("patterns");
        assert_eq!(patterns[0].category, "type_error");
        assert_eq!(patterns[0].total_occurrences, 2);
        assert_eq!(patterns[0].example_run_ids, vec!["run-1".to_string()]);
    }

    #[test]
    fn self_correction_rate_counts_retried_steps() {
        let mut store = RunStore::open_in_memory().expect("open store");

        // 4 retried steps with a timeout failure: 3 passed, 1 failed.
        let run_id = "run-sc";
        let mut steps = Vec::new();
        let mut failures = Vec::new();
        for (number, verdict) in [(1, "PASS"), (2, "pass"), (3, "PROCEED"), (4, "FAIL")] {
            let mut step = sample_step(run_id, number);
            step.retries = Some(1);
            step.final_verdict = Some(verdict.to_string());
            steps.push(step);
            failures.push(sample_failure(run_id, number, "timeout"));
        }
        let records = RunRecords {
            run: sample_run(run_id),
            steps,
            failures,
            web_searches: Vec::new(),
        };
        store.write_records(&records, false).expect("write");

        let rows = store.self_correction().expect("self correction");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].category, "timeout");
        assert_eq!(rows[0].total, 4);
        assert_eq!(rows[0].self_corrected, 3);
        assert_eq!(rows[0].failed, 1);
        assert_eq!(rows[0].rate, 0.75);
    }

    #[test]
    fn tool_comparison_groups_by_structured_triple() {
        let mut store = RunStore::open_in_memory().expect("open store");

        let mut first = sample_records("run-1");
        first.run.success_rate = Some(1.0);
        let mut second = sample_records("run-2");
        second.run.success_rate = Some(0.5);
        second.run.total_retries = Some(3);
        let mut other = sample_records("run-3");
        other.run.planner = Some("gpt".to_string());

        for records in [&first, &second, &other] {
            store.write_records(records, false).expect("write");
        }

        let classification = StepClassification {
            label: Classification::Implementation,
            confidence: 0.6,
            reasoning: None,
            evidence: None,
            approach_changed: None,
            same_file_repeated: None,
            error_category_stable: None,
        };
        store
            .update_step_classification(&step_id("run-1", 1), &classification)
            .expect("update");

        let rows = store.tool_comparison().expect("tool comparison");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].tools.planner, "claude");
        assert_eq!(rows[0].run_count, 2);
        assert_eq!(rows[0].avg_success_rate, 0.75);
        assert_eq!(rows[0].total_retries, 4);
        assert_eq!(rows[0].implementation_count, 1);
        assert_eq!(rows[0].tools.label(), "claude/codex/claude");
        assert_eq!(rows[1].tools.planner, "gpt");
    }

    #[test]
    fn run_filters_compose() {
        let mut store = RunStore::open_in_memory().expect("open store");

        let mut failed_arch = sample_records("run-a");
        failed_arch.run.status = Some("failed".to_string());
        let mut failed_plain = sample_records("run-b");
        failed_plain.run.status = Some("failed".to_string());
        let success = sample_records("run-c");

        for records in [&failed_arch, &failed_plain, &success] {
            store.write_records(records, false).expect("write");
        }

        let classification = StepClassification {
            label: Classification::Architectural,
            confidence: 0.9,
            reasoning: None,
            evidence: None,
            approach_changed: None,
            same_file_repeated: None,
            error_category_stable: None,
        };
        store
            .update_step_classification(&step_id("run-a", 1), &classification)
            .expect("update");

        let filter = RunFilter {
            status: Some("failed".to_string()),
            has_architectural: Some(true),
            ..RunFilter::default()
        };
        let matched = store.runs_filtered(&filter).expect("filtered");
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].0.run_id, "run-a");

        let filter = RunFilter {
            status: Some("failed".to_string()),
            has_architectural: Some(false),
            ..RunFilter::default()
        };
        let matched = store.runs_filtered(&filter).expect("filtered");
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].0.run_id, "run-b");

        let filter = RunFilter {
            build_phase: Some("deploy".to_string()),
            ..RunFilter::default()
        };
        assert!(store.runs_filtered(&filter).expect("filtered").is_empty());

        let filter = RunFilter {
            error_category: Some("type_error".to_string()),
            ..RunFilter::default()
        };
        assert_eq!(store.runs_filtered(&filter).expect("filtered").len(), 3);
    }

    #[test]
    fn step_and_search_lookups_scope_to_step() {
        let mut store = RunStore::open_in_memory().expect("open store");
        let mut records = sample_records("run-1");
        records.web_searches.push(WebSearchRecord {
            run_id: "run-1".to_string(),
            step_id: Some(step_id("run-1", 2)),
            query: Some("sqlite upsert".to_string()),
            count: Some(1),
            timestamp: None,
        });
        store.write_records(&records, false).expect("write");

        let step = store
            .step_detail("run-1", 1)
            .expect("query")
            .expect("present");
        assert_eq!(step.id, step_id("run-1", 1));
        assert!(store.step_detail("run-1", 99).expect("query").is_none());

        assert_eq!(store.failures_for_step("run-1", 1).expect("failures").len(), 1);
        assert!(store.failures_for_step("run-1", 2).expect("failures").is_empty());

        let searches = store
            .web_searches_for_step("run-1", &step_id("run-1", 2))
            .expect("searches");
        assert_eq!(searches.len(), 1);
        assert_eq!(searches[0].query.as_deref(), Some("sqlite upsert"));
    }
}

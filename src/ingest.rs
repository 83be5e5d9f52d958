//! Row-level ingestion: locating the date, key and provider columns, turning
//! each sheet row into upsert-ready values, and tallying the sync summary.

use crate::errors::{AppError, AppResult};
use crate::mapping::{cell, find_column, ColumnResolver, ResolvedCell};
use crate::models::{ConnectionStatus, DataSource, ImportedUpsert, RowIssue, SyncSummary, UpsertOutcome};
use crate::transform::{CellOutcome, UnmappedReason};
use chrono::{DateTime, Days, NaiveDate, Utc};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

pub const REASON_UNPARSEABLE_DATE: &str = "unparseable date";
pub const REASON_MISSING_DATE: &str = "missing date";
pub const REASON_MISSING_KEY: &str = "missing external id key";
pub const REASON_UNKNOWN_PROVIDER: &str = "unknown provider";

const EXTERNAL_ID_LEN: usize = 32;
const FIELD_SEPARATOR: char = '\u{1f}';
/// Largest serial day a spreadsheet can hold (9999-12-31).
const MAX_SERIAL_DAY: f64 = 2_958_465.0;

/// Stable identity of a source row for one sheet.
pub fn external_id(sheet_name: &str, key: RowKey<'_>) -> String {
    let material = match key {
        RowKey::Column(value) => format!("{sheet_name}{FIELD_SEPARATOR}key{FIELD_SEPARATOR}{}", value.trim()),
        RowKey::Position(row_number) => format!("{sheet_name}{FIELD_SEPARATOR}row{FIELD_SEPARATOR}{row_number}"),
    };
    let mut hasher = Sha256::new();
    hasher.update(material.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..EXTERNAL_ID_LEN].to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowKey<'a> {
    Column(&'a str),
    /// 1-based data row number, used when the source has no key column.
    Position(usize),
}

/// Accepts `YYYY-MM-DD`, `YYYY/MM/DD` and spreadsheet serial days. Day/month
/// orders are ambiguous across locales and are rejected.
pub fn parse_sheet_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    for format in ["%Y-%m-%d", "%Y/%m/%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
            return Some(date);
        }
    }

    let serial = trimmed.parse::<f64>().ok()?;
    if !(1.0..=MAX_SERIAL_DAY).contains(&serial) {
        return None;
    }
    let epoch = NaiveDate::from_ymd_opt(1899, 12, 30)?;
    epoch.checked_add_days(Days::new(serial.trunc() as u64))
}

/// Positions of the structural columns inside one header row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceLayout {
    date_index: usize,
    key_index: Option<usize>,
    provider_index: Option<usize>,
}

impl SourceLayout {
    pub fn resolve(source: &DataSource, header: &[String]) -> AppResult<Self> {
        let date_index = find_column(header, &source.date_column).ok_or_else(|| {
            AppError::Configuration(format!("date column '{}' is missing from the header", source.date_column))
        })?;
        let key_index = match source.key_column.as_deref().filter(|column| !column.trim().is_empty()) {
            Some(column) => Some(find_column(header, column).ok_or_else(|| {
                AppError::Configuration(format!("key column '{}' is missing from the header", column))
            })?),
            None => None,
        };
        let provider_index = match source.provider_column.as_deref().filter(|column| !column.trim().is_empty()) {
            Some(column) => {
                if source.clinic_id.is_none() {
                    return Err(AppError::Configuration(
                        "a provider column requires the data source to belong to a clinic".to_string(),
                    ));
                }
                Some(find_column(header, column).ok_or_else(|| {
                    AppError::Configuration(format!("provider column '{}' is missing from the header", column))
                })?)
            }
            None => None,
        };
        Ok(Self {
            date_index,
            key_index,
            provider_index,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PreparedRow {
    pub row_number: usize,
    pub date: NaiveDate,
    pub external_id: String,
    pub provider_name: Option<String>,
    pub cells: Vec<ResolvedCell>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RowPlan {
    Blank,
    Failed(RowIssue),
    Ready(PreparedRow),
}

/// Classifies one data row. `row_number` is 1-based over data rows.
pub fn prepare_row(
    layout: &SourceLayout,
    resolver: &ColumnResolver,
    sheet_name: &str,
    row_number: usize,
    row: &[String],
) -> RowPlan {
    if row.iter().all(|value| value.trim().is_empty()) {
        return RowPlan::Blank;
    }

    let raw_date = cell(row, layout.date_index);
    let date = match parse_sheet_date(raw_date) {
        Some(date) => date,
        None => {
            let reason = if raw_date.trim().is_empty() {
                REASON_MISSING_DATE
            } else {
                REASON_UNPARSEABLE_DATE
            };
            return RowPlan::Failed(issue(row_number, None, reason, raw_date));
        }
    };

    let key = match layout.key_index {
        Some(index) => {
            let raw_key = cell(row, index);
            if raw_key.trim().is_empty() {
                return RowPlan::Failed(issue(row_number, None, REASON_MISSING_KEY, raw_key));
            }
            RowKey::Column(raw_key)
        }
        None => RowKey::Position(row_number),
    };

    let provider_name = layout
        .provider_index
        .map(|index| cell(row, index).trim().to_string())
        .filter(|name| !name.is_empty());

    RowPlan::Ready(PreparedRow {
        row_number,
        date,
        external_id: external_id(sheet_name, key),
        provider_name,
        cells: resolver.resolve_row(row),
    })
}

fn issue(row_number: usize, column: Option<&str>, reason: &str, raw: &str) -> RowIssue {
    RowIssue {
        row_number,
        column: column.map(ToString::to_string),
        reason: reason.to_string(),
        raw: Some(raw.to_string()).filter(|raw| !raw.is_empty()),
    }
}

/// Accumulates counters for one sync run. Issue details are sampled; counts
/// are always complete.
#[derive(Debug)]
pub struct SummaryBuilder {
    summary: SyncSummary,
    issue_limit: usize,
    changed_metric_ids: BTreeSet<String>,
    changed_dates: BTreeSet<NaiveDate>,
    changed_clinics: BTreeSet<Option<String>>,
}

impl SummaryBuilder {
    pub fn new(data_source_id: &str, started_at: DateTime<Utc>, issue_limit: usize) -> Self {
        Self {
            summary: SyncSummary {
                data_source_id: data_source_id.to_string(),
                connection_status: ConnectionStatus::Syncing,
                rows_processed: 0,
                rows_skipped: 0,
                rows_failed: 0,
                rows_blank: 0,
                values_inserted: 0,
                values_updated: 0,
                values_unchanged: 0,
                cells_unmapped: 0,
                skip_reasons: BTreeMap::new(),
                issues: Vec::new(),
                configuration_errors: Vec::new(),
                unmatched_columns: Vec::new(),
                composites_recomputed: 0,
                error: None,
                started_at,
                finished_at: started_at,
            },
            issue_limit,
            changed_metric_ids: BTreeSet::new(),
            changed_dates: BTreeSet::new(),
            changed_clinics: BTreeSet::new(),
        }
    }

    pub fn configuration_error(&mut self, message: impl Into<String>) {
        self.summary.configuration_errors.push(message.into());
    }

    pub fn unmatched_columns(&mut self, columns: &[String]) {
        self.summary.unmatched_columns.extend(columns.iter().cloned());
    }

    pub fn blank_row(&mut self) {
        self.summary.rows_blank += 1;
    }

    pub fn failed_row(&mut self, row_issue: RowIssue) {
        self.summary.rows_failed += 1;
        *self.summary.skip_reasons.entry(row_issue.reason.clone()).or_default() += 1;
        self.push_issue(row_issue);
    }

    /// Records unmapped cells of a row. Returns how many cells were mapped.
    pub fn cells(&mut self, row_number: usize, cells: &[ResolvedCell]) -> usize {
        let mut mapped = 0;
        let mut first_reason: Option<UnmappedReason> = None;
        for resolved in cells {
            match &resolved.outcome {
                CellOutcome::Mapped(_) => mapped += 1,
                CellOutcome::Unmapped(reason) => {
                    self.summary.cells_unmapped += 1;
                    if first_reason.is_none() || first_reason == Some(UnmappedReason::EmptyCell) {
                        first_reason = Some(*reason);
                    }
                    if *reason != UnmappedReason::EmptyCell {
                        self.push_issue(issue(
                            row_number,
                            Some(&resolved.column_name),
                            reason.as_str(),
                            &resolved.raw,
                        ));
                    }
                }
            }
        }
        if mapped == 0 {
            self.summary.rows_skipped += 1;
            let reason = first_reason.map(UnmappedReason::as_str).unwrap_or("no mapped columns");
            *self.summary.skip_reasons.entry(reason.to_string()).or_default() += 1;
        }
        mapped
    }

    /// Counts one stored row. Updates mark both the new and the previous
    /// placement as changed so composites at either one are refreshed.
    pub fn row_written(
        &mut self,
        metric_ids: &[&str],
        date: NaiveDate,
        clinic_id: Option<&str>,
        upserts: &[ImportedUpsert],
    ) {
        self.summary.rows_processed += 1;
        for (metric_id, upsert) in metric_ids.iter().zip(upserts) {
            match upsert.outcome {
                UpsertOutcome::Inserted => self.summary.values_inserted += 1,
                UpsertOutcome::Updated => self.summary.values_updated += 1,
                UpsertOutcome::Unchanged => {
                    self.summary.values_unchanged += 1;
                    continue;
                }
            }
            self.changed_metric_ids.insert((*metric_id).to_string());
            self.changed_dates.insert(date);
            self.changed_clinics.insert(clinic_id.map(ToString::to_string));
            if let Some(previous) = &upsert.previous {
                self.changed_dates.insert(previous.date);
                self.changed_clinics.insert(previous.clinic_id.clone());
            }
        }
    }

    pub fn row_storage_failed(&mut self, row_number: usize, error: &AppError) {
        self.failed_row(RowIssue {
            row_number,
            column: None,
            reason: format!("storage failure: {}", error),
            raw: None,
        });
    }

    pub fn changed_metric_ids(&self) -> Vec<String> {
        self.changed_metric_ids.iter().cloned().collect()
    }

    pub fn changed_dates(&self) -> Vec<NaiveDate> {
        self.changed_dates.iter().copied().collect()
    }

    pub fn changed_clinics(&self) -> Vec<Option<String>> {
        self.changed_clinics.iter().cloned().collect()
    }

    pub fn composites_recomputed(&mut self, count: usize) {
        self.summary.composites_recomputed = count;
    }

    pub fn finish(mut self, status: ConnectionStatus, error: Option<String>, finished_at: DateTime<Utc>) -> SyncSummary {
        self.summary.connection_status = status;
        self.summary.error = error;
        self.summary.finished_at = finished_at;
        self.summary
    }

    fn push_issue(&mut self, row_issue: RowIssue) {
        if self.summary.issues.len() < self.issue_limit {
            self.summary.issues.push(row_issue);
        }
    }
}

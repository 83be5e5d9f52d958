use crate::errors::{AppError, AppResult};
use crate::formula::normalize_metric_name;
use crate::models::{
    CalculatedValue, Clinic, ColumnMapping, ConnectionStatus, DataSource, Goal, ImportedUpsert, ImportedValue,
    MetricDataType, MetricDefinition, MetricValue, MetricValueQuery, PreviousPlacement, Provider,
    RecordManualValuePayload, SaveColumnMappingPayload, SaveDataSourcePayload, SaveGoalPayload,
    SaveMetricDefinitionPayload, SourceType, SyncFrequency, TimePeriod, TransformationRule, UpsertOutcome,
    FORMULA_GRAMMAR_VERSION, TRANSFORMATION_RULE_VERSION,
};
use crate::repository::Repository;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

const SCHEMA_SQL: &str = include_str!("schema.sql");
const DATE_FORMAT: &str = "%Y-%m-%d";

const METRIC_DEFINITION_COLUMNS: &str = "id, name, description, data_type, calculation_formula, category,
     is_composite, created_at, updated_at";
const DATA_SOURCE_COLUMNS: &str = "id, name, spreadsheet_id, sheet_name, clinic_id, date_column, key_column,
     provider_column, sync_frequency, connection_status, last_synced_at, sync_started_at, last_error,
     app_script_id, created_at";
const METRIC_VALUE_COLUMNS: &str = "id, date, value, source_type, source_sheet, external_id,
     metric_definition_id, clinic_id, provider_id, data_source_id, created_at, updated_at";
const GOAL_COLUMNS: &str = "id, time_period, start_date, end_date, target_value, metric_definition_id,
     clinic_id, provider_id, created_at";

#[derive(Debug, Serialize, Deserialize)]
struct StoredRule {
    version: u32,
    rule: TransformationRule,
}

#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn new(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;

        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }
}

impl Repository for Database {
    fn insert_clinic(&self, name: &str, location: Option<&str>) -> AppResult<Clinic> {
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO clinics (id, name, location, status, created_at) VALUES (?1, ?2, ?3, 'active', ?4)",
            params![id, name, location, now.to_rfc3339()],
        )?;
        Ok(Clinic {
            id,
            name: name.to_string(),
            location: location.map(ToString::to_string),
            status: "active".to_string(),
            created_at: now,
        })
    }

    fn insert_provider(&self, clinic_id: &str, name: &str, provider_type: Option<&str>) -> AppResult<Provider> {
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO providers (id, name, provider_type, status, clinic_id, created_at)
             VALUES (?1, ?2, ?3, 'active', ?4, ?5)",
            params![id, name.trim(), provider_type, clinic_id, now.to_rfc3339()],
        )?;
        Ok(Provider {
            id,
            name: name.trim().to_string(),
            provider_type: provider_type.map(ToString::to_string),
            status: "active".to_string(),
            clinic_id: clinic_id.to_string(),
            created_at: now,
        })
    }

    fn find_provider_by_name(&self, clinic_id: &str, name: &str) -> AppResult<Option<Provider>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, name, provider_type, status, clinic_id, created_at
             FROM providers WHERE clinic_id = ?1 AND lower(name) = lower(?2)
             ORDER BY created_at ASC LIMIT 1",
            params![clinic_id, name.trim()],
            parse_provider_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    fn save_metric_definition(&self, payload: SaveMetricDefinitionPayload) -> AppResult<MetricDefinition> {
        let now = Utc::now().to_rfc3339();
        let id = payload.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let name = payload.name.trim().to_string();
        let name_key = normalize_metric_name(&name);
        let formula_version = payload
            .calculation_formula
            .as_ref()
            .map(|_| FORMULA_GRAMMAR_VERSION);

        let conn = self.conn()?;
        let clash = conn
            .query_row(
                "SELECT id FROM metric_definitions WHERE name_key = ?1 AND id != ?2",
                params![name_key, id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        if clash.is_some() {
            return Err(AppError::Configuration(format!(
                "metric name '{}' is already in use",
                name
            )));
        }

        conn.execute(
            "INSERT INTO metric_definitions (id, name, name_key, description, data_type, calculation_formula,
               formula_version, category, is_composite, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
             ON CONFLICT(id) DO UPDATE SET
               name = excluded.name, name_key = excluded.name_key, description = excluded.description,
               data_type = excluded.data_type, calculation_formula = excluded.calculation_formula,
               formula_version = excluded.formula_version, category = excluded.category,
               is_composite = excluded.is_composite, updated_at = excluded.updated_at",
            params![
                id,
                name,
                name_key,
                payload.description,
                payload.data_type.as_str(),
                payload.calculation_formula,
                formula_version,
                payload.category,
                payload.is_composite as i32,
                now,
            ],
        )?;

        conn.query_row(
            &format!("SELECT {} FROM metric_definitions WHERE id = ?1", METRIC_DEFINITION_COLUMNS),
            [id.as_str()],
            parse_metric_definition_row,
        )
        .map_err(AppError::from)
    }

    fn get_metric_definition(&self, id: &str) -> AppResult<Option<MetricDefinition>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM metric_definitions WHERE id = ?1", METRIC_DEFINITION_COLUMNS),
            [id],
            parse_metric_definition_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    fn list_metric_definitions(&self) -> AppResult<Vec<MetricDefinition>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM metric_definitions ORDER BY name_key ASC",
            METRIC_DEFINITION_COLUMNS
        ))?;
        let rows = stmt.query_map([], parse_metric_definition_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    fn save_data_source(&self, payload: SaveDataSourcePayload) -> AppResult<DataSource> {
        let now = Utc::now().to_rfc3339();
        let id = payload.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let date_column = payload
            .date_column
            .map(|column| column.trim().to_string())
            .filter(|column| !column.is_empty())
            .unwrap_or_else(|| "Date".to_string());
        let sync_frequency = payload.sync_frequency.unwrap_or(SyncFrequency::Manual);

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO data_sources (id, name, spreadsheet_id, sheet_name, clinic_id, date_column, key_column,
               provider_column, sync_frequency, connection_status, app_script_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'idle', ?10, ?11)
             ON CONFLICT(id) DO UPDATE SET
               name = excluded.name, spreadsheet_id = excluded.spreadsheet_id, sheet_name = excluded.sheet_name,
               clinic_id = excluded.clinic_id, date_column = excluded.date_column,
               key_column = excluded.key_column, provider_column = excluded.provider_column,
               sync_frequency = excluded.sync_frequency, app_script_id = excluded.app_script_id",
            params![
                id,
                payload.name.trim(),
                payload.spreadsheet_id.trim(),
                payload.sheet_name,
                payload.clinic_id,
                date_column,
                payload.key_column,
                payload.provider_column,
                sync_frequency.as_str(),
                payload.app_script_id,
                now,
            ],
        )?;

        conn.query_row(
            &format!("SELECT {} FROM data_sources WHERE id = ?1", DATA_SOURCE_COLUMNS),
            [id.as_str()],
            parse_data_source_row,
        )
        .map_err(AppError::from)
    }

    fn get_data_source(&self, id: &str) -> AppResult<Option<DataSource>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM data_sources WHERE id = ?1", DATA_SOURCE_COLUMNS),
            [id],
            parse_data_source_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    fn list_data_sources(&self) -> AppResult<Vec<DataSource>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM data_sources ORDER BY created_at ASC, id ASC",
            DATA_SOURCE_COLUMNS
        ))?;
        let rows = stmt.query_map([], parse_data_source_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    fn try_begin_sync(&self, data_source_id: &str, now: DateTime<Utc>) -> AppResult<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE data_sources SET connection_status = 'syncing', sync_started_at = ?1
             WHERE id = ?2 AND connection_status != 'syncing'",
            params![now.to_rfc3339(), data_source_id],
        )?;
        if changed == 1 {
            return Ok(());
        }

        let exists = conn.query_row(
            "SELECT COUNT(1) FROM data_sources WHERE id = ?1",
            [data_source_id],
            |row| row.get::<_, i64>(0),
        )? > 0;
        if exists {
            Err(AppError::Conflict(format!(
                "data source {} is already syncing",
                data_source_id
            )))
        } else {
            Err(AppError::NotFound(format!("data source {}", data_source_id)))
        }
    }

    fn finish_sync(
        &self,
        data_source_id: &str,
        status: ConnectionStatus,
        synced_at: Option<DateTime<Utc>>,
        error: Option<&str>,
    ) -> AppResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE data_sources
             SET connection_status = ?1, last_synced_at = COALESCE(?2, last_synced_at),
                 last_error = ?3, sync_started_at = NULL
             WHERE id = ?4 AND connection_status = 'syncing'",
            params![
                status.as_str(),
                synced_at.map(|value| value.to_rfc3339()),
                error,
                data_source_id,
            ],
        )?;
        Ok(())
    }

    fn mark_orphan_syncs_failed(&self) -> AppResult<u64> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE data_sources
             SET connection_status = 'error', last_error = 'sync interrupted', sync_started_at = NULL
             WHERE connection_status = 'syncing'",
            [],
        )?;
        Ok(changed as u64)
    }

    fn save_column_mapping(&self, payload: SaveColumnMappingPayload) -> AppResult<ColumnMapping> {
        let now = Utc::now().to_rfc3339();
        let id = payload.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let column_name = payload.column_name.trim().to_string();
        let column_key = column_name.to_lowercase();
        let rule_json = payload
            .transformation_rule
            .map(|rule| {
                serde_json::to_string(&StoredRule {
                    version: TRANSFORMATION_RULE_VERSION,
                    rule,
                })
            })
            .transpose()?;

        let conn = self.conn()?;
        let clash = conn
            .query_row(
                "SELECT id FROM column_mappings WHERE data_source_id = ?1 AND column_key = ?2 AND id != ?3",
                params![payload.data_source_id, column_key, id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        if clash.is_some() {
            return Err(AppError::Configuration(format!(
                "column '{}' is already mapped for data source {}",
                column_name, payload.data_source_id
            )));
        }

        conn.execute(
            "INSERT INTO column_mappings (id, data_source_id, column_name, column_key, metric_definition_id,
               transformation_rule_json, is_active, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
               data_source_id = excluded.data_source_id, column_name = excluded.column_name,
               column_key = excluded.column_key, metric_definition_id = excluded.metric_definition_id,
               transformation_rule_json = excluded.transformation_rule_json, is_active = excluded.is_active",
            params![
                id,
                payload.data_source_id,
                column_name,
                column_key,
                payload.metric_definition_id,
                rule_json,
                payload.is_active.unwrap_or(true) as i32,
                now,
            ],
        )?;

        conn.query_row(
            "SELECT id, data_source_id, column_name, metric_definition_id, transformation_rule_json,
             is_active, created_at FROM column_mappings WHERE id = ?1",
            [id.as_str()],
            parse_column_mapping_row,
        )
        .map_err(AppError::from)
    }

    fn list_column_mappings(&self, data_source_id: &str) -> AppResult<Vec<ColumnMapping>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, data_source_id, column_name, metric_definition_id, transformation_rule_json,
             is_active, created_at FROM column_mappings WHERE data_source_id = ?1
             ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map([data_source_id], parse_column_mapping_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    fn upsert_imported_row(&self, values: &[ImportedValue]) -> AppResult<Vec<ImportedUpsert>> {
        let now = Utc::now().to_rfc3339();
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut outcomes = Vec::with_capacity(values.len());

        for value in values {
            let date = value.date.format(DATE_FORMAT).to_string();
            let existing = tx
                .query_row(
                    "SELECT id, value, date, source_sheet, clinic_id, provider_id FROM metric_values
                     WHERE source_type = 'imported' AND metric_definition_id = ?1
                       AND data_source_id = ?2 AND external_id = ?3",
                    params![value.metric_definition_id, value.data_source_id, value.external_id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, Option<String>>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, Option<String>>(3)?,
                            row.get::<_, Option<String>>(4)?,
                            row.get::<_, Option<String>>(5)?,
                        ))
                    },
                )
                .optional()?;

            let outcome = match existing {
                Some((_, stored_value, stored_date, stored_sheet, stored_clinic, stored_provider))
                    if stored_value.as_deref() == Some(value.value.as_str())
                        && stored_date == date
                        && stored_sheet.as_deref() == Some(value.source_sheet.as_str())
                        && stored_clinic == value.clinic_id
                        && stored_provider == value.provider_id =>
                {
                    ImportedUpsert::unchanged()
                }
                Some((id, _, stored_date, _, stored_clinic, stored_provider)) => {
                    let previous = PreviousPlacement {
                        date: parse_date(&stored_date)?,
                        clinic_id: stored_clinic,
                        provider_id: stored_provider,
                    };
                    tx.execute(
                        "UPDATE metric_values SET value = ?1, date = ?2, source_sheet = ?3, clinic_id = ?4,
                           provider_id = ?5, updated_at = ?6
                         WHERE id = ?7",
                        params![
                            value.value,
                            date,
                            value.source_sheet,
                            value.clinic_id,
                            value.provider_id,
                            now,
                            id,
                        ],
                    )?;
                    ImportedUpsert {
                        outcome: UpsertOutcome::Updated,
                        previous: Some(previous),
                    }
                }
                None => {
                    tx.execute(
                        "INSERT INTO metric_values (id, date, value, source_type, source_sheet, external_id,
                           metric_definition_id, clinic_id, provider_id, data_source_id, created_at, updated_at)
                         VALUES (?1, ?2, ?3, 'imported', ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
                        params![
                            Uuid::new_v4().to_string(),
                            date,
                            value.value,
                            value.source_sheet,
                            value.external_id,
                            value.metric_definition_id,
                            value.clinic_id,
                            value.provider_id,
                            value.data_source_id,
                            now,
                        ],
                    )?;
                    ImportedUpsert::inserted()
                }
            };
            outcomes.push(outcome);
        }

        tx.commit()?;
        Ok(outcomes)
    }

    fn upsert_calculated_value(&self, value: &CalculatedValue) -> AppResult<UpsertOutcome> {
        let now = Utc::now().to_rfc3339();
        let date = value.date.format(DATE_FORMAT).to_string();
        let conn = self.conn()?;
        let existing = conn
            .query_row(
                "SELECT id, value FROM metric_values
                 WHERE source_type = 'calculated' AND metric_definition_id = ?1 AND date = ?2
                   AND clinic_id IS ?3 AND provider_id IS ?4",
                params![value.metric_definition_id, date, value.clinic_id, value.provider_id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?)),
            )
            .optional()?;

        match existing {
            Some((_, stored)) if stored == value.value => Ok(UpsertOutcome::Unchanged),
            Some((id, _)) => {
                conn.execute(
                    "UPDATE metric_values SET value = ?1, updated_at = ?2 WHERE id = ?3",
                    params![value.value, now, id],
                )?;
                Ok(UpsertOutcome::Updated)
            }
            None => {
                conn.execute(
                    "INSERT INTO metric_values (id, date, value, source_type, metric_definition_id, clinic_id,
                       provider_id, created_at, updated_at)
                     VALUES (?1, ?2, ?3, 'calculated', ?4, ?5, ?6, ?7, ?7)",
                    params![
                        Uuid::new_v4().to_string(),
                        date,
                        value.value,
                        value.metric_definition_id,
                        value.clinic_id,
                        value.provider_id,
                        now,
                    ],
                )?;
                Ok(UpsertOutcome::Inserted)
            }
        }
    }

    fn delete_calculated_value(
        &self,
        metric_definition_id: &str,
        date: NaiveDate,
        clinic_id: Option<&str>,
        provider_id: Option<&str>,
    ) -> AppResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "DELETE FROM metric_values
             WHERE source_type = 'calculated' AND metric_definition_id = ?1 AND date = ?2
               AND clinic_id IS ?3 AND provider_id IS ?4",
            params![
                metric_definition_id,
                date.format(DATE_FORMAT).to_string(),
                clinic_id,
                provider_id
            ],
        )?;
        Ok(changed > 0)
    }

    fn insert_manual_value(&self, payload: &RecordManualValuePayload) -> AppResult<MetricValue> {
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO metric_values (id, date, value, source_type, metric_definition_id, clinic_id,
               provider_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'manual', ?4, ?5, ?6, ?7, ?7)",
            params![
                id,
                payload.date.format(DATE_FORMAT).to_string(),
                payload.value,
                payload.metric_definition_id,
                payload.clinic_id,
                payload.provider_id,
                now.to_rfc3339(),
            ],
        )?;
        Ok(MetricValue {
            id,
            date: payload.date,
            value: Some(payload.value.clone()),
            source_type: SourceType::Manual,
            source_sheet: None,
            external_id: None,
            metric_definition_id: payload.metric_definition_id.clone(),
            clinic_id: payload.clinic_id.clone(),
            provider_id: payload.provider_id.clone(),
            data_source_id: None,
            created_at: now,
            updated_at: now,
        })
    }

    fn query_metric_values(&self, query: &MetricValueQuery) -> AppResult<Vec<MetricValue>> {
        let conn = self.conn()?;
        let mut sql = format!("SELECT {} FROM metric_values WHERE 1 = 1", METRIC_VALUE_COLUMNS);
        let mut params_vec: Vec<String> = Vec::new();

        if !query.metric_definition_ids.is_empty() {
            let placeholders = vec!["?"; query.metric_definition_ids.len()].join(", ");
            sql.push_str(&format!(" AND metric_definition_id IN ({})", placeholders));
            params_vec.extend(query.metric_definition_ids.iter().cloned());
        }
        if let Some(start_date) = query.start_date {
            sql.push_str(" AND date >= ?");
            params_vec.push(start_date.format(DATE_FORMAT).to_string());
        }
        if let Some(end_date) = query.end_date {
            sql.push_str(" AND date < ?");
            params_vec.push(end_date.format(DATE_FORMAT).to_string());
        }
        if let Some(clinic_id) = &query.clinic_id {
            sql.push_str(" AND clinic_id = ?");
            params_vec.push(clinic_id.clone());
        }
        if let Some(provider_id) = &query.provider_id {
            sql.push_str(" AND provider_id = ?");
            params_vec.push(provider_id.clone());
        }
        if let Some(source_type) = query.source_type {
            sql.push_str(" AND source_type = ?");
            params_vec.push(source_type.as_str().to_string());
        }
        if let Some(data_source_id) = &query.data_source_id {
            sql.push_str(" AND data_source_id = ?");
            params_vec.push(data_source_id.clone());
        }
        sql.push_str(" ORDER BY date ASC, metric_definition_id ASC, created_at ASC, id ASC");

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params_vec.iter()), parse_metric_value_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    fn save_goal(&self, payload: SaveGoalPayload) -> AppResult<Goal> {
        let now = Utc::now().to_rfc3339();
        let id = payload.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO goals (id, time_period, start_date, end_date, target_value, metric_definition_id,
               clinic_id, provider_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
               time_period = excluded.time_period, start_date = excluded.start_date,
               end_date = excluded.end_date, target_value = excluded.target_value,
               metric_definition_id = excluded.metric_definition_id, clinic_id = excluded.clinic_id,
               provider_id = excluded.provider_id",
            params![
                id,
                payload.time_period.as_str(),
                payload.start_date.format(DATE_FORMAT).to_string(),
                payload.end_date.format(DATE_FORMAT).to_string(),
                payload.target_value,
                payload.metric_definition_id,
                payload.clinic_id,
                payload.provider_id,
                now,
            ],
        )?;

        conn.query_row(
            &format!("SELECT {} FROM goals WHERE id = ?1", GOAL_COLUMNS),
            [id.as_str()],
            parse_goal_row,
        )
        .map_err(AppError::from)
    }

    fn get_goal(&self, id: &str) -> AppResult<Option<Goal>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM goals WHERE id = ?1", GOAL_COLUMNS),
            [id],
            parse_goal_row,
        )
        .optional()
        .map_err(AppError::from)
    }
}

fn parse_provider_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Provider> {
    Ok(Provider {
        id: row.get(0)?,
        name: row.get(1)?,
        provider_type: row.get(2)?,
        status: row.get(3)?,
        clinic_id: row.get(4)?,
        created_at: parse_time(&row.get::<_, String>(5)?)?,
    })
}

fn parse_metric_definition_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MetricDefinition> {
    Ok(MetricDefinition {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        data_type: parse_data_type(&row.get::<_, String>(3)?)?,
        calculation_formula: row.get(4)?,
        category: row.get(5)?,
        is_composite: row.get::<_, i32>(6)? != 0,
        created_at: parse_time(&row.get::<_, String>(7)?)?,
        updated_at: parse_time(&row.get::<_, String>(8)?)?,
    })
}

fn parse_data_source_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DataSource> {
    Ok(DataSource {
        id: row.get(0)?,
        name: row.get(1)?,
        spreadsheet_id: row.get(2)?,
        sheet_name: row.get(3)?,
        clinic_id: row.get(4)?,
        date_column: row.get(5)?,
        key_column: row.get(6)?,
        provider_column: row.get(7)?,
        sync_frequency: parse_sync_frequency(&row.get::<_, String>(8)?),
        connection_status: parse_connection_status(&row.get::<_, String>(9)?),
        last_synced_at: row
            .get::<_, Option<String>>(10)?
            .map(|raw| parse_time(&raw))
            .transpose()?,
        sync_started_at: row
            .get::<_, Option<String>>(11)?
            .map(|raw| parse_time(&raw))
            .transpose()?,
        last_error: row.get(12)?,
        app_script_id: row.get(13)?,
        created_at: parse_time(&row.get::<_, String>(14)?)?,
    })
}

fn parse_column_mapping_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ColumnMapping> {
    let transformation_rule = row
        .get::<_, Option<String>>(4)?
        .map(|raw| parse_stored_rule(&raw))
        .transpose()?;
    Ok(ColumnMapping {
        id: row.get(0)?,
        data_source_id: row.get(1)?,
        column_name: row.get(2)?,
        metric_definition_id: row.get(3)?,
        transformation_rule,
        is_active: row.get::<_, i32>(5)? != 0,
        created_at: parse_time(&row.get::<_, String>(6)?)?,
    })
}

fn parse_metric_value_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MetricValue> {
    Ok(MetricValue {
        id: row.get(0)?,
        date: parse_date(&row.get::<_, String>(1)?)?,
        value: row.get(2)?,
        source_type: parse_source_type(&row.get::<_, String>(3)?)?,
        source_sheet: row.get(4)?,
        external_id: row.get(5)?,
        metric_definition_id: row.get(6)?,
        clinic_id: row.get(7)?,
        provider_id: row.get(8)?,
        data_source_id: row.get(9)?,
        created_at: parse_time(&row.get::<_, String>(10)?)?,
        updated_at: parse_time(&row.get::<_, String>(11)?)?,
    })
}

fn parse_goal_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Goal> {
    Ok(Goal {
        id: row.get(0)?,
        time_period: parse_time_period(&row.get::<_, String>(1)?)?,
        start_date: parse_date(&row.get::<_, String>(2)?)?,
        end_date: parse_date(&row.get::<_, String>(3)?)?,
        target_value: row.get(4)?,
        metric_definition_id: row.get(5)?,
        clinic_id: row.get(6)?,
        provider_id: row.get(7)?,
        created_at: parse_time(&row.get::<_, String>(8)?)?,
    })
}

fn parse_stored_rule(raw: &str) -> rusqlite::Result<TransformationRule> {
    let stored: StoredRule = serde_json::from_str(raw).map_err(|error| conversion_error(error.to_string()))?;
    if stored.version > TRANSFORMATION_RULE_VERSION {
        return Err(conversion_error(format!(
            "transformation rule version {} is newer than supported version {}",
            stored.version, TRANSFORMATION_RULE_VERSION
        )));
    }
    Ok(stored.rule)
}

fn parse_data_type(raw: &str) -> rusqlite::Result<MetricDataType> {
    match raw {
        "numeric" => Ok(MetricDataType::Numeric),
        "currency" => Ok(MetricDataType::Currency),
        "percentage" => Ok(MetricDataType::Percentage),
        "text" => Ok(MetricDataType::Text),
        other => Err(conversion_error(format!("Unknown metric data type '{}'", other))),
    }
}

fn parse_source_type(raw: &str) -> rusqlite::Result<SourceType> {
    match raw {
        "manual" => Ok(SourceType::Manual),
        "imported" => Ok(SourceType::Imported),
        "calculated" => Ok(SourceType::Calculated),
        other => Err(conversion_error(format!("Unknown source type '{}'", other))),
    }
}

fn parse_time_period(raw: &str) -> rusqlite::Result<TimePeriod> {
    match raw {
        "daily" => Ok(TimePeriod::Daily),
        "weekly" => Ok(TimePeriod::Weekly),
        "monthly" => Ok(TimePeriod::Monthly),
        "quarterly" => Ok(TimePeriod::Quarterly),
        "annual" => Ok(TimePeriod::Annual),
        other => Err(conversion_error(format!("Unknown time period '{}'", other))),
    }
}

fn parse_sync_frequency(raw: &str) -> SyncFrequency {
    match raw {
        "hourly" => SyncFrequency::Hourly,
        "daily" => SyncFrequency::Daily,
        "weekly" => SyncFrequency::Weekly,
        _ => SyncFrequency::Manual,
    }
}

fn parse_connection_status(raw: &str) -> ConnectionStatus {
    match raw {
        "idle" => ConnectionStatus::Idle,
        "syncing" => ConnectionStatus::Syncing,
        "connected" => ConnectionStatus::Connected,
        _ => ConnectionStatus::Error,
    }
}

fn parse_date(raw: &str) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, DATE_FORMAT).map_err(|error| conversion_error(error.to_string()))
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| conversion_error(error.to_string()))
}

fn conversion_error(message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

#[cfg(test)]
mod tests {
    use super::Database;
    use crate::errors::AppError;
    use crate::models::{
        CalculatedValue, ConnectionStatus, ImportedUpsert, ImportedValue, MetricDataType, MetricValueQuery,
        PreviousPlacement, SaveColumnMappingPayload, SaveDataSourcePayload, SaveMetricDefinitionPayload, SourceType,
        TransformationRule, UpsertOutcome,
    };
    use crate::repository::Repository;
    use chrono::{NaiveDate, Utc};

    fn open(dir: &tempfile::TempDir) -> Database {
        Database::new(&dir.path().join("test.db")).expect("db")
    }

    fn metric(db: &Database, name: &str) -> String {
        db.save_metric_definition(SaveMetricDefinitionPayload {
            id: None,
            name: name.to_string(),
            description: None,
            data_type: MetricDataType::Numeric,
            calculation_formula: None,
            category: None,
            is_composite: false,
        })
        .expect("save metric")
        .id
    }

    fn source(db: &Database, clinic_id: Option<String>) -> String {
        db.save_data_source(SaveDataSourcePayload {
            id: None,
            name: "Daily log".to_string(),
            spreadsheet_id: "sheet-1".to_string(),
            sheet_name: "Log".to_string(),
            clinic_id,
            date_column: None,
            key_column: None,
            provider_column: None,
            sync_frequency: None,
            app_script_id: None,
        })
        .expect("save source")
        .id
    }

    fn date(raw: &str) -> NaiveDate {
        NaiveDate::parse_from_str(raw, "%Y-%m-%d").expect("date")
    }

    #[test]
    fn begin_sync_is_a_compare_and_set() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open(&dir);
        let source_id = source(&db, None);

        db.try_begin_sync(&source_id, Utc::now()).expect("first begin");
        let second = db.try_begin_sync(&source_id, Utc::now());
        assert!(matches!(second, Err(AppError::Conflict(_))));
        assert!(matches!(
            db.try_begin_sync("missing", Utc::now()),
            Err(AppError::NotFound(_))
        ));

        db.finish_sync(&source_id, ConnectionStatus::Connected, Some(Utc::now()), None)
            .expect("finish");
        let loaded = db.get_data_source(&source_id).expect("get").expect("exists");
        assert_eq!(loaded.connection_status, ConnectionStatus::Connected);
        assert!(loaded.last_synced_at.is_some());
        assert!(loaded.sync_started_at.is_none());
        db.try_begin_sync(&source_id, Utc::now()).expect("begin again");
    }

    #[test]
    fn orphaned_syncs_are_moved_to_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open(&dir);
        let source_id = source(&db, None);
        db.try_begin_sync(&source_id, Utc::now()).expect("begin");

        assert_eq!(db.mark_orphan_syncs_failed().expect("recover"), 1);
        let loaded = db.get_data_source(&source_id).expect("get").expect("exists");
        assert_eq!(loaded.connection_status, ConnectionStatus::Error);
        assert_eq!(loaded.last_error.as_deref(), Some("sync interrupted"));
    }

    #[test]
    fn imported_upsert_reports_outcome_and_previous_placement() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open(&dir);
        let metric_id = metric(&db, "Patient Visits");
        let source_id = source(&db, None);

        let mut value = ImportedValue {
            metric_definition_id: metric_id.clone(),
            data_source_id: source_id.clone(),
            external_id: "abc".to_string(),
            date: date("2024-01-02"),
            value: "12".to_string(),
            source_sheet: "Log".to_string(),
            clinic_id: None,
            provider_id: None,
        };
        assert_eq!(
            db.upsert_imported_row(std::slice::from_ref(&value)).expect("insert"),
            vec![ImportedUpsert::inserted()]
        );
        assert_eq!(
            db.upsert_imported_row(std::slice::from_ref(&value)).expect("again"),
            vec![ImportedUpsert::unchanged()]
        );
        value.value = "15".to_string();
        value.date = date("2024-01-05");
        let updated = db.upsert_imported_row(std::slice::from_ref(&value)).expect("update");
        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0].outcome, UpsertOutcome::Updated);
        assert_eq!(
            updated[0].previous,
            Some(PreviousPlacement {
                date: date("2024-01-02"),
                clinic_id: None,
                provider_id: None,
            })
        );

        let stored = db
            .query_metric_values(&MetricValueQuery {
                metric_definition_ids: vec![metric_id],
                ..MetricValueQuery::default()
            })
            .expect("query");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].value.as_deref(), Some("15"));
        assert_eq!(stored[0].date, date("2024-01-05"));
        assert_eq!(stored[0].source_type, SourceType::Imported);
    }

    #[test]
    fn calculated_key_treats_missing_scope_as_a_value() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open(&dir);
        let metric_id = metric(&db, "Revenue per Visit");

        let mut value = CalculatedValue {
            metric_definition_id: metric_id.clone(),
            date: date("2024-01-02"),
            clinic_id: None,
            provider_id: None,
            value: Some("25".to_string()),
        };
        assert_eq!(db.upsert_calculated_value(&value).expect("insert"), UpsertOutcome::Inserted);
        value.value = None;
        assert_eq!(db.upsert_calculated_value(&value).expect("update"), UpsertOutcome::Updated);

        let stored = db
            .query_metric_values(&MetricValueQuery {
                metric_definition_ids: vec![metric_id.clone()],
                source_type: Some(SourceType::Calculated),
                ..MetricValueQuery::default()
            })
            .expect("query");
        assert_eq!(stored.len(), 1);
        assert!(stored[0].value.is_none());

        assert!(db
            .delete_calculated_value(&metric_id, date("2024-01-02"), None, None)
            .expect("delete"));
    }

    #[test]
    fn query_range_is_half_open() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open(&dir);
        let metric_id = metric(&db, "Visits");
        for day in ["2024-01-01", "2024-01-02", "2024-01-03"] {
            db.upsert_calculated_value(&CalculatedValue {
                metric_definition_id: metric_id.clone(),
                date: date(day),
                clinic_id: None,
                provider_id: None,
                value: Some("1".to_string()),
            })
            .expect("write");
        }
        let stored = db
            .query_metric_values(&MetricValueQuery {
                metric_definition_ids: vec![metric_id],
                start_date: Some(date("2024-01-01")),
                end_date: Some(date("2024-01-03")),
                ..MetricValueQuery::default()
            })
            .expect("query");
        assert_eq!(stored.len(), 2);
    }

    #[test]
    fn metric_names_are_unique_ignoring_case() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open(&dir);
        metric(&db, "Patient Visits");
        let duplicate = db.save_metric_definition(SaveMetricDefinitionPayload {
            id: None,
            name: "patient visits".to_string(),
            description: None,
            data_type: MetricDataType::Numeric,
            calculation_formula: None,
            category: None,
            is_composite: false,
        });
        assert!(matches!(duplicate, Err(AppError::Configuration(_))));
    }

    #[test]
    fn column_mapping_rule_round_trips_and_columns_are_unique() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open(&dir);
        let metric_id = metric(&db, "Patient Visits");
        let source_id = source(&db, None);

        let saved = db
            .save_column_mapping(SaveColumnMappingPayload {
                id: None,
                data_source_id: source_id.clone(),
                column_name: " Visits ".to_string(),
                metric_definition_id: metric_id.clone(),
                transformation_rule: Some(TransformationRule::ParseNumber { decimal_separator: ',' }),
                is_active: None,
            })
            .expect("save mapping");
        assert_eq!(saved.column_name, "Visits");
        assert!(saved.is_active);

        let listed = db.list_column_mappings(&source_id).expect("list");
        assert_eq!(
            listed[0].transformation_rule,
            Some(TransformationRule::ParseNumber { decimal_separator: ',' })
        );

        let duplicate = db.save_column_mapping(SaveColumnMappingPayload {
            id: None,
            data_source_id: source_id,
            column_name: "VISITS".to_string(),
            metric_definition_id: metric_id,
            transformation_rule: None,
            is_active: None,
        });
        assert!(matches!(duplicate, Err(AppError::Configuration(_))));
    }

    #[test]
    fn providers_are_found_by_name_within_clinic() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open(&dir);
        let clinic = db.insert_clinic("North", None).expect("clinic");
        let other = db.insert_clinic("South", None).expect("clinic");
        let provider = db.insert_provider(&clinic.id, "Dr. Lee", Some("dentist")).expect("provider");

        let found = db
            .find_provider_by_name(&clinic.id, " dr. lee ")
            .expect("lookup")
            .expect("exists");
        assert_eq!(found.id, provider.id);
        assert!(db.find_provider_by_name(&other.id, "Dr. Lee").expect("lookup").is_none());
    }
}

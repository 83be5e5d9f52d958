use chrono::NaiveDate;
use practice_metrics_lib::connector::{Credentials, MemoryConnector, SheetRows, StaticCredentials};
use practice_metrics_lib::models::{
    Achievement, ConnectionStatus, DataSource, MetricDataType, MetricDefinition, MetricValue, MetricValueQuery,
    RecomputeScope, RecordManualValuePayload, Role, SaveColumnMappingPayload, SaveDataSourcePayload, SaveGoalPayload,
    SaveMetricDefinitionPayload, SourceType, TimePeriod, TransformationRule,
};
use practice_metrics_lib::{AppError, AppSettings, Database, MetricsRunner, Repository, SessionContext};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct Fixture {
    _dir: TempDir,
    db: Arc<Database>,
    connector: Arc<MemoryConnector>,
    runner: Arc<MetricsRunner>,
    ctx: SessionContext,
    clinic_id: String,
    visits: MetricDefinition,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Arc::new(Database::new(&dir.path().join("metrics.db")).expect("db"));
        let connector = Arc::new(MemoryConnector::new());
        let runner = MetricsRunner::new(
            db.clone(),
            connector.clone(),
            Arc::new(StaticCredentials::new(Credentials::bearer("ya29.test-token"))),
            AppSettings::default(),
        );
        let ctx = SessionContext::system();
        let clinic = db.insert_clinic("North", Some("Springfield")).expect("clinic");
        let visits = runner
            .save_metric_definition(&ctx, metric("Patient Visits", MetricDataType::Numeric, None))
            .expect("visits");
        Self {
            _dir: dir,
            db,
            connector,
            runner,
            ctx,
            clinic_id: clinic.id,
            visits,
        }
    }

    fn source(&self, spreadsheet_id: &str, key_column: Option<&str>) -> DataSource {
        self.runner
            .save_data_source(&self.ctx, self.source_payload(spreadsheet_id, key_column))
            .expect("data source")
    }

    fn source_payload(&self, spreadsheet_id: &str, key_column: Option<&str>) -> SaveDataSourcePayload {
        SaveDataSourcePayload {
            id: None,
            name: format!("{} log", spreadsheet_id),
            spreadsheet_id: spreadsheet_id.to_string(),
            sheet_name: "Daily".to_string(),
            clinic_id: Some(self.clinic_id.clone()),
            date_column: Some("Date".to_string()),
            key_column: key_column.map(ToString::to_string),
            provider_column: None,
            sync_frequency: None,
            app_script_id: None,
        }
    }

    fn doubled_visits(&self) -> MetricDefinition {
        self.runner
            .save_metric_definition(
                &self.ctx,
                metric("Double Visits", MetricDataType::Numeric, Some("[Patient Visits] * 2")),
            )
            .expect("composite")
    }

    fn map(&self, source: &DataSource, column: &str, metric_id: &str) {
        self.runner
            .save_column_mapping(
                &self.ctx,
                SaveColumnMappingPayload {
                    id: None,
                    data_source_id: source.id.clone(),
                    column_name: column.to_string(),
                    metric_definition_id: metric_id.to_string(),
                    transformation_rule: Some(TransformationRule::ParseNumber { decimal_separator: '.' }),
                    is_active: None,
                },
            )
            .expect("mapping");
    }

    fn sheet(&self, source: &DataSource, rows: &[&[&str]]) {
        let grid = rows
            .iter()
            .map(|row| row.iter().map(ToString::to_string).collect())
            .collect();
        self.connector
            .set_sheet(&source.spreadsheet_id, &source.sheet_name, SheetRows::from_grid(grid))
            .expect("sheet");
    }

    fn values(&self, metric_id: &str, source_type: SourceType) -> Vec<MetricValue> {
        self.runner
            .list_metric_values(
                &self.ctx,
                MetricValueQuery {
                    metric_definition_ids: vec![metric_id.to_string()],
                    source_type: Some(source_type),
                    ..MetricValueQuery::default()
                },
            )
            .expect("values")
    }
}

fn metric(name: &str, data_type: MetricDataType, formula: Option<&str>) -> SaveMetricDefinitionPayload {
    SaveMetricDefinitionPayload {
        id: None,
        name: name.to_string(),
        description: None,
        data_type,
        calculation_formula: formula.map(ToString::to_string),
        category: None,
        is_composite: formula.is_some(),
    }
}

fn date(raw: &str) -> NaiveDate {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").expect("date")
}

#[tokio::test]
async fn first_sync_imports_each_row_once() {
    let fx = Fixture::new();
    let source = fx.source("sheet-1", None);
    fx.map(&source, "Visits", &fx.visits.id);
    fx.sheet(
        &source,
        &[&["Date", "Visits"], &["2024-01-01", "10"], &["2024-01-02", "12"], &["2024-01-03", "8"]],
    );

    let summary = fx.runner.sync_data_source(&fx.ctx, &source.id, None).await.expect("sync");
    assert_eq!(summary.connection_status, ConnectionStatus::Connected);
    assert_eq!(summary.values_inserted, 3);
    assert_eq!(summary.rows_processed, 3);

    let values = fx.values(&fx.visits.id, SourceType::Imported);
    assert_eq!(values.len(), 3);
    let mut external_ids: Vec<_> = values.iter().filter_map(|value| value.external_id.clone()).collect();
    external_ids.sort();
    external_ids.dedup();
    assert_eq!(external_ids.len(), 3);
    assert!(values.iter().all(|value| value.clinic_id.as_deref() == Some(fx.clinic_id.as_str())));

    let stored = fx.db.get_data_source(&source.id).expect("read").expect("source");
    assert_eq!(stored.connection_status, ConnectionStatus::Connected);
    assert!(stored.last_synced_at.is_some());
}

#[tokio::test]
async fn resync_updates_changed_cell_and_is_idempotent() {
    let fx = Fixture::new();
    let source = fx.source("sheet-1", None);
    fx.map(&source, "Visits", &fx.visits.id);
    fx.sheet(
        &source,
        &[&["Date", "Visits"], &["2024-01-01", "10"], &["2024-01-02", "12"], &["2024-01-03", "8"]],
    );
    fx.runner.sync_data_source(&fx.ctx, &source.id, None).await.expect("first sync");

    fx.sheet(
        &source,
        &[&["Date", "Visits"], &["2024-01-01", "10"], &["2024-01-02", "15"], &["2024-01-03", "8"]],
    );
    let changed = fx.runner.sync_data_source(&fx.ctx, &source.id, None).await.expect("second sync");
    assert_eq!(changed.values_updated, 1);
    assert_eq!(changed.values_unchanged, 2);
    assert_eq!(changed.values_inserted, 0);

    let values = fx.values(&fx.visits.id, SourceType::Imported);
    assert_eq!(values.len(), 3);
    let second_day = values.iter().find(|value| value.date == date("2024-01-02")).expect("row 2");
    assert_eq!(second_day.value.as_deref(), Some("15"));

    let again = fx.runner.sync_data_source(&fx.ctx, &source.id, None).await.expect("third sync");
    assert_eq!(again.values_inserted + again.values_updated, 0);
    assert_eq!(again.values_unchanged, 3);
}

#[tokio::test]
async fn malformed_cell_skips_the_row_only() {
    let fx = Fixture::new();
    let source = fx.source("sheet-1", None);
    fx.map(&source, "Visits", &fx.visits.id);
    fx.sheet(
        &source,
        &[&["Date", "Visits"], &["2024-01-01", "10"], &["2024-01-02", "N/A"], &["2024-01-03", "8"], &["", ""]],
    );

    let summary = fx.runner.sync_data_source(&fx.ctx, &source.id, None).await.expect("sync");
    assert_eq!(summary.connection_status, ConnectionStatus::Connected);
    assert_eq!(summary.values_inserted, 2);
    assert_eq!(summary.rows_skipped, 1);
    assert_eq!(summary.rows_blank, 1);
    assert_eq!(summary.skip_reasons.get("unparseable number"), Some(&1));
    assert_eq!(summary.issues[0].raw.as_deref(), Some("N/A"));
    assert_eq!(fx.values(&fx.visits.id, SourceType::Imported).len(), 2);
}

#[tokio::test]
async fn key_column_identity_survives_row_reordering() {
    let fx = Fixture::new();
    let source = fx.source("sheet-keyed", Some("Invoice"));
    fx.map(&source, "Visits", &fx.visits.id);
    fx.sheet(
        &source,
        &[
            &["Invoice", "Date", "Visits"],
            &["INV-1", "2024-01-01", "10"],
            &["INV-2", "2024-01-02", "12"],
        ],
    );
    fx.runner.sync_data_source(&fx.ctx, &source.id, None).await.expect("first sync");

    fx.sheet(
        &source,
        &[
            &["Visits", "Invoice", "Date"],
            &["12", "INV-2", "2024-01-02"],
            &["10", "INV-1", "2024-01-01"],
        ],
    );
    let summary = fx.runner.sync_data_source(&fx.ctx, &source.id, None).await.expect("second sync");
    assert_eq!(summary.values_inserted, 0);
    assert_eq!(summary.values_unchanged, 2);
    assert_eq!(fx.values(&fx.visits.id, SourceType::Imported).len(), 2);
}

#[tokio::test]
async fn concurrent_sync_is_rejected() {
    let fx = Fixture::new();
    let source = fx.source("sheet-1", None);
    fx.map(&source, "Visits", &fx.visits.id);
    fx.sheet(&source, &[&["Date", "Visits"], &["2024-01-01", "10"]]);
    fx.connector.set_delay(Some(Duration::from_millis(100))).expect("delay");

    let (first, second) = tokio::join!(
        fx.runner.sync_data_source(&fx.ctx, &source.id, None),
        fx.runner.sync_data_source(&fx.ctx, &source.id, None),
    );
    assert_eq!(first.expect("first sync").connection_status, ConnectionStatus::Connected);
    assert!(matches!(second, Err(AppError::Conflict(_))));
    assert_eq!(fx.connector.fetch_count(), 1);
}

#[tokio::test]
async fn transport_failure_records_a_redacted_error() {
    let fx = Fixture::new();
    let source = fx.source("sheet-1", None);
    fx.map(&source, "Visits", &fx.visits.id);
    fx.connector
        .fail_with(Some("401 from sheets api (Authorization: Bearer ya29.leaked-token)"))
        .expect("failure");

    let summary = fx.runner.sync_data_source(&fx.ctx, &source.id, None).await.expect("sync");
    assert_eq!(summary.connection_status, ConnectionStatus::Error);

    let stored = fx.db.get_data_source(&source.id).expect("read").expect("source");
    assert_eq!(stored.connection_status, ConnectionStatus::Error);
    assert!(stored.last_synced_at.is_none());
    let last_error = stored.last_error.expect("last error");
    assert!(last_error.contains("[REDACTED]"));
    assert!(!last_error.contains("ya29"));
}

#[tokio::test]
async fn deadline_overrun_ends_in_error_not_syncing() {
    let fx = Fixture::new();
    let source = fx.source("sheet-1", None);
    fx.map(&source, "Visits", &fx.visits.id);
    fx.sheet(&source, &[&["Date", "Visits"], &["2024-01-01", "10"]]);
    fx.connector.set_delay(Some(Duration::from_millis(300))).expect("delay");

    let summary = fx
        .runner
        .sync_data_source(&fx.ctx, &source.id, Some(Duration::from_millis(20)))
        .await
        .expect("sync");
    assert_eq!(summary.connection_status, ConnectionStatus::Error);
    assert_eq!(summary.error.as_deref(), Some("sync timed out"));

    let stored = fx.db.get_data_source(&source.id).expect("read").expect("source");
    assert_eq!(stored.connection_status, ConnectionStatus::Error);
    assert_eq!(stored.last_error.as_deref(), Some("sync timed out"));
}

#[tokio::test]
async fn missing_date_column_is_reported_as_configuration_error() {
    let fx = Fixture::new();
    let source = fx.source("sheet-1", None);
    fx.map(&source, "Visits", &fx.visits.id);
    fx.sheet(&source, &[&["Day", "Visits"], &["2024-01-01", "10"]]);

    let summary = fx.runner.sync_data_source(&fx.ctx, &source.id, None).await.expect("sync");
    assert_eq!(summary.connection_status, ConnectionStatus::Error);
    assert_eq!(summary.configuration_errors.len(), 1);
    assert!(summary.configuration_errors[0].contains("date column"));
}

#[tokio::test]
async fn viewers_cannot_sync_and_other_clinics_cannot_see_the_source() {
    let fx = Fixture::new();
    let source = fx.source("sheet-1", None);

    let viewer = SessionContext::clinic_user(&fx.clinic_id, Role::Viewer);
    assert!(matches!(
        fx.runner.sync_data_source(&viewer, &source.id, None).await,
        Err(AppError::Forbidden(_))
    ));

    let outsider = SessionContext::clinic_user("some-other-clinic", Role::Admin);
    assert!(matches!(
        fx.runner.sync_data_source(&outsider, &source.id, None).await,
        Err(AppError::Forbidden(_))
    ));

    let stored = fx.db.get_data_source(&source.id).expect("read").expect("source");
    assert_eq!(stored.connection_status, ConnectionStatus::Idle);
}

#[tokio::test]
async fn sync_recomputes_dependent_composites_with_null_for_missing_inputs() {
    let fx = Fixture::new();
    let revenue = fx
        .runner
        .save_metric_definition(&fx.ctx, metric("Revenue", MetricDataType::Currency, None))
        .expect("revenue");
    let per_visit = fx
        .runner
        .save_metric_definition(
            &fx.ctx,
            metric("Revenue per Visit", MetricDataType::Currency, Some("[Revenue] / [Patient Visits]")),
        )
        .expect("composite");

    let source = fx.source("sheet-1", None);
    fx.map(&source, "Visits", &fx.visits.id);
    fx.map(&source, "Revenue", &revenue.id);
    fx.sheet(
        &source,
        &[
            &["Date", "Visits", "Revenue"],
            &["2024-01-01", "10", "$500"],
            &["2024-01-02", "20", ""],
        ],
    );

    let summary = fx.runner.sync_data_source(&fx.ctx, &source.id, None).await.expect("sync");
    assert_eq!(summary.composites_recomputed, 1);

    let calculated = fx.values(&per_visit.id, SourceType::Calculated);
    assert_eq!(calculated.len(), 2);
    let first = calculated.iter().find(|value| value.date == date("2024-01-01")).expect("day 1");
    assert_eq!(first.value.as_deref(), Some("50"));
    assert!(first.external_id.is_none());
    let second = calculated.iter().find(|value| value.date == date("2024-01-02")).expect("day 2");
    assert_eq!(second.value, None);

    fx.sheet(
        &source,
        &[
            &["Date", "Visits", "Revenue"],
            &["2024-01-01", "10", "$500"],
            &["2024-01-02", "20", "$400"],
        ],
    );
    fx.runner.sync_data_source(&fx.ctx, &source.id, None).await.expect("resync");
    let calculated = fx.values(&per_visit.id, SourceType::Calculated);
    assert_eq!(calculated.len(), 2);
    let second = calculated.iter().find(|value| value.date == date("2024-01-02")).expect("day 2");
    assert_eq!(second.value.as_deref(), Some("20"));
}

#[tokio::test]
async fn cycles_are_rejected_at_save_and_nothing_is_computed() {
    let fx = Fixture::new();
    let b = fx
        .runner
        .save_metric_definition(&fx.ctx, metric("B", MetricDataType::Numeric, None))
        .expect("b");
    fx.runner
        .save_metric_definition(&fx.ctx, metric("A", MetricDataType::Numeric, Some("[B] + 1")))
        .expect("a");

    let mut closing = metric("B", MetricDataType::Numeric, Some("[A] * 2"));
    closing.id = Some(b.id.clone());
    match fx.runner.save_metric_definition(&fx.ctx, closing) {
        Err(AppError::Cycle(members)) => {
            assert!(members.iter().any(|name| name == "A"));
            assert!(members.iter().any(|name| name == "B"));
        }
        other => panic!("expected cycle, got {:?}", other.map(|definition| definition.name)),
    }

    let stored = fx.db.get_metric_definition(&b.id).expect("read").expect("b");
    assert!(!stored.is_composite);

    let summary = fx
        .runner
        .recompute_composites(
            &fx.ctx,
            RecomputeScope {
                clinic_id: None,
                start_date: date("2024-01-01"),
                end_date: date("2024-01-31"),
                changed_metric_ids: Vec::new(),
                dates: None,
            },
        )
        .expect("recompute");
    assert_eq!(summary.values_written, 0);
}

#[tokio::test]
async fn goal_progress_end_to_end() {
    let fx = Fixture::new();
    let source = fx.source("sheet-1", None);
    fx.map(&source, "Visits", &fx.visits.id);
    fx.sheet(
        &source,
        &[
            &["Date", "Visits"],
            &["2024-01-01", "10"],
            &["2024-01-02", "20"],
            &["2024-01-04", "15"],
            &["2024-01-09", "99"],
        ],
    );
    fx.runner.sync_data_source(&fx.ctx, &source.id, None).await.expect("sync");

    let goal = fx
        .runner
        .save_goal(
            &fx.ctx,
            SaveGoalPayload {
                id: None,
                time_period: TimePeriod::Daily,
                start_date: date("2024-01-01"),
                end_date: date("2024-01-05"),
                target_value: 50.0,
                metric_definition_id: fx.visits.id.clone(),
                clinic_id: Some(fx.clinic_id.clone()),
                provider_id: None,
            },
        )
        .expect("goal");

    let viewer = SessionContext::clinic_user(&fx.clinic_id, Role::Viewer);
    let progress = fx.runner.evaluate_goal(&viewer, &goal.id).expect("progress");
    assert_eq!(progress.actual, Some(45.0));
    assert_eq!(progress.achievement, Achievement::Measured { ratio: 0.9 });
    assert_eq!(progress.days_with_data, 3);

    let outsider = SessionContext::clinic_user("some-other-clinic", Role::Admin);
    assert!(matches!(
        fx.runner.evaluate_goal(&outsider, &goal.id),
        Err(AppError::Forbidden(_))
    ));
}

#[tokio::test]
async fn goals_on_text_metrics_or_misaligned_windows_are_rejected() {
    let fx = Fixture::new();
    let notes = fx
        .runner
        .save_metric_definition(&fx.ctx, metric("Notes", MetricDataType::Text, None))
        .expect("notes");
    let payload = SaveGoalPayload {
        id: None,
        time_period: TimePeriod::Monthly,
        start_date: date("2024-01-01"),
        end_date: date("2024-02-01"),
        target_value: 10.0,
        metric_definition_id: notes.id.clone(),
        clinic_id: Some(fx.clinic_id.clone()),
        provider_id: None,
    };
    assert!(matches!(
        fx.runner.save_goal(&fx.ctx, payload.clone()),
        Err(AppError::Configuration(_))
    ));

    let misaligned = SaveGoalPayload {
        metric_definition_id: fx.visits.id.clone(),
        start_date: date("2024-01-15"),
        ..payload
    };
    assert!(matches!(
        fx.runner.save_goal(&fx.ctx, misaligned),
        Err(AppError::Configuration(_))
    ));
}

#[tokio::test]
async fn moved_row_leaves_no_composite_behind_at_its_old_date() {
    let fx = Fixture::new();
    let doubled = fx.doubled_visits();
    let source = fx.source("sheet-keyed", Some("Invoice"));
    fx.map(&source, "Visits", &fx.visits.id);
    fx.sheet(&source, &[&["Invoice", "Date", "Visits"], &["INV-1", "2024-01-01", "10"]]);
    fx.runner.sync_data_source(&fx.ctx, &source.id, None).await.expect("first sync");

    fx.sheet(&source, &[&["Invoice", "Date", "Visits"], &["INV-1", "2024-01-02", "10"]]);
    let summary = fx.runner.sync_data_source(&fx.ctx, &source.id, None).await.expect("second sync");
    assert_eq!(summary.values_updated, 1);

    let calculated = fx.values(&doubled.id, SourceType::Calculated);
    assert_eq!(calculated.len(), 1);
    assert_eq!(calculated[0].date, date("2024-01-02"));
    assert_eq!(calculated[0].value.as_deref(), Some("20"));

    let goal = fx
        .runner
        .save_goal(
            &fx.ctx,
            SaveGoalPayload {
                id: None,
                time_period: TimePeriod::Monthly,
                start_date: date("2024-01-01"),
                end_date: date("2024-02-01"),
                target_value: 20.0,
                metric_definition_id: doubled.id.clone(),
                clinic_id: Some(fx.clinic_id.clone()),
                provider_id: None,
            },
        )
        .expect("goal");
    let progress = fx.runner.evaluate_goal(&fx.ctx, &goal.id).expect("progress");
    assert_eq!(progress.actual, Some(20.0));
    assert_eq!(progress.achievement, Achievement::Measured { ratio: 1.0 });
}

#[tokio::test]
async fn source_moved_to_another_clinic_takes_its_composites_along() {
    let fx = Fixture::new();
    let doubled = fx.doubled_visits();
    let south = fx.db.insert_clinic("South", None).expect("clinic");
    let source = fx.source("sheet-1", None);
    fx.map(&source, "Visits", &fx.visits.id);
    fx.sheet(&source, &[&["Date", "Visits"], &["2024-01-01", "10"]]);
    fx.runner.sync_data_source(&fx.ctx, &source.id, None).await.expect("first sync");

    fx.runner
        .save_data_source(
            &fx.ctx,
            SaveDataSourcePayload {
                id: Some(source.id.clone()),
                clinic_id: Some(south.id.clone()),
                ..fx.source_payload("sheet-1", None)
            },
        )
        .expect("move source");
    fx.runner.sync_data_source(&fx.ctx, &source.id, None).await.expect("second sync");

    let calculated = fx.values(&doubled.id, SourceType::Calculated);
    assert_eq!(calculated.len(), 1);
    assert_eq!(calculated[0].clinic_id.as_deref(), Some(south.id.as_str()));
    assert_eq!(calculated[0].value.as_deref(), Some("20"));
}

#[tokio::test]
async fn provider_column_scopes_values_and_composites_per_provider() {
    let fx = Fixture::new();
    let doubled = fx.doubled_visits();
    let smith = fx.db.insert_provider(&fx.clinic_id, "Dr. Smith", Some("dentist")).expect("provider");
    let source = fx
        .runner
        .save_data_source(
            &fx.ctx,
            SaveDataSourcePayload {
                provider_column: Some("Provider".to_string()),
                ..fx.source_payload("sheet-providers", None)
            },
        )
        .expect("data source");
    fx.map(&source, "Visits", &fx.visits.id);
    fx.sheet(
        &source,
        &[
            &["Date", "Provider", "Visits"],
            &["2024-01-01", "dr. smith", "10"],
            &["2024-01-01", "Dr. Nobody", "5"],
            &["2024-01-01", "", "4"],
        ],
    );

    let summary = fx.runner.sync_data_source(&fx.ctx, &source.id, None).await.expect("sync");
    assert_eq!(summary.connection_status, ConnectionStatus::Connected);
    assert_eq!(summary.values_inserted, 2);
    assert_eq!(summary.rows_failed, 1);
    assert_eq!(summary.skip_reasons.get("unknown provider"), Some(&1));
    let unknown = summary
        .issues
        .iter()
        .find(|issue| issue.reason == "unknown provider")
        .expect("issue");
    assert_eq!(unknown.raw.as_deref(), Some("Dr. Nobody"));
    assert_eq!(unknown.column.as_deref(), Some("Provider"));

    let imported = fx.values(&fx.visits.id, SourceType::Imported);
    assert_eq!(imported.len(), 2);
    let by_smith = imported
        .iter()
        .find(|value| value.provider_id.as_deref() == Some(smith.id.as_str()))
        .expect("smith's visits");
    assert_eq!(by_smith.value.as_deref(), Some("10"));
    let unassigned = imported.iter().find(|value| value.provider_id.is_none()).expect("clinic visits");
    assert_eq!(unassigned.value.as_deref(), Some("4"));

    let calculated = fx.values(&doubled.id, SourceType::Calculated);
    assert_eq!(calculated.len(), 2);
    let smith_doubled = calculated
        .iter()
        .find(|value| value.provider_id.as_deref() == Some(smith.id.as_str()))
        .expect("smith's composite");
    assert_eq!(smith_doubled.value.as_deref(), Some("20"));
    let clinic_doubled = calculated.iter().find(|value| value.provider_id.is_none()).expect("clinic composite");
    assert_eq!(clinic_doubled.value.as_deref(), Some("8"));
}

#[tokio::test]
async fn manual_values_feed_composites_at_their_scope() {
    let fx = Fixture::new();
    let doubled = fx.doubled_visits();
    let entry = RecordManualValuePayload {
        metric_definition_id: fx.visits.id.clone(),
        date: date("2024-03-05"),
        value: "7".to_string(),
        clinic_id: Some(fx.clinic_id.clone()),
        provider_id: None,
    };

    let stored = fx.runner.record_manual_value(&fx.ctx, entry.clone()).expect("manual value");
    assert_eq!(stored.source_type, SourceType::Manual);
    let calculated = fx.values(&doubled.id, SourceType::Calculated);
    assert_eq!(calculated.len(), 1);
    assert_eq!(calculated[0].date, date("2024-03-05"));
    assert_eq!(calculated[0].clinic_id.as_deref(), Some(fx.clinic_id.as_str()));
    assert_eq!(calculated[0].value.as_deref(), Some("14"));

    fx.runner
        .record_manual_value(
            &fx.ctx,
            RecordManualValuePayload {
                value: "5".to_string(),
                ..entry.clone()
            },
        )
        .expect("second entry");
    let calculated = fx.values(&doubled.id, SourceType::Calculated);
    assert_eq!(calculated.len(), 1);
    assert_eq!(calculated[0].value.as_deref(), Some("24"));

    let viewer = SessionContext::clinic_user(&fx.clinic_id, Role::Viewer);
    assert!(matches!(
        fx.runner.record_manual_value(&viewer, entry.clone()),
        Err(AppError::Forbidden(_))
    ));
    assert!(matches!(
        fx.runner.record_manual_value(
            &fx.ctx,
            RecordManualValuePayload {
                metric_definition_id: doubled.id.clone(),
                ..entry
            },
        ),
        Err(AppError::Configuration(_))
    ));
}

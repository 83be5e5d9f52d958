use super::{Connector, Credentials, FetchFuture, SheetRows};
use crate::errors::{AppError, AppResult};
use serde::Deserialize;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

/// Sheets API `ValueRange` payload.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

/// Reads `ValueRange` exports laid out as `<root>/<spreadsheetId>/<sheetName>.json`.
#[derive(Debug, Clone)]
pub struct ValuesFileConnector {
    root: PathBuf,
}

impl ValuesFileConnector {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn sheet_path(&self, spreadsheet_id: &str, sheet_name: &str) -> AppResult<PathBuf> {
        for part in [spreadsheet_id, sheet_name] {
            let mut components = Path::new(part).components();
            let single_normal = matches!(components.next(), Some(Component::Normal(_))) && components.next().is_none();
            if !single_normal {
                return Err(AppError::Configuration(format!(
                    "'{}' is not a valid spreadsheet or sheet name",
                    part
                )));
            }
        }
        Ok(self.root.join(spreadsheet_id).join(format!("{}.json", sheet_name)))
    }

    async fn read_sheet(&self, spreadsheet_id: &str, sheet_name: &str) -> AppResult<SheetRows> {
        let path = self.sheet_path(spreadsheet_id, sheet_name)?;
        let raw = tokio::fs::read_to_string(&path).await.map_err(|error| match error.kind() {
            ErrorKind::NotFound => AppError::Transport(format!(
                "sheet '{}' of spreadsheet {} was not found",
                sheet_name, spreadsheet_id
            )),
            _ => AppError::Transport(format!("{}: {}", path.display(), error)),
        })?;
        let range: ValueRange = serde_json::from_str(&raw)
            .map_err(|error| AppError::Transport(format!("malformed value range: {}", error)))?;
        let grid = range
            .values
            .into_iter()
            .map(|row| row.into_iter().map(cell_text).collect())
            .collect();
        Ok(SheetRows::from_grid(grid))
    }
}

impl Connector for ValuesFileConnector {
    fn fetch_rows<'a>(
        &'a self,
        spreadsheet_id: &'a str,
        sheet_name: &'a str,
        _credentials: &'a Credentials,
    ) -> FetchFuture<'a> {
        Box::pin(self.read_sheet(spreadsheet_id, sheet_name))
    }
}

fn cell_text(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(text) => text,
        serde_json::Value::Bool(flag) => (if flag { "TRUE" } else { "FALSE" }).to_string(),
        other => other.to_string(),
    }
}

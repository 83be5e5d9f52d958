use super::{Connector, Credentials, FetchFuture, SheetRows};
use crate::errors::{AppError, AppResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Default)]
struct MemoryState {
    sheets: HashMap<(String, String), SheetRows>,
    failure: Option<String>,
    delay: Option<Duration>,
}

/// In-process connector used by tests and dry runs. Sheets, a forced
/// transport failure and an artificial latency can be set at any time.
#[derive(Debug, Default)]
pub struct MemoryConnector {
    state: Mutex<MemoryState>,
    fetches: AtomicUsize,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_sheet(&self, spreadsheet_id: &str, sheet_name: &str, rows: SheetRows) -> AppResult<()> {
        self.state()?
            .sheets
            .insert((spreadsheet_id.to_string(), sheet_name.to_string()), rows);
        Ok(())
    }

    pub fn fail_with(&self, message: Option<&str>) -> AppResult<()> {
        self.state()?.failure = message.map(ToString::to_string);
        Ok(())
    }

    pub fn set_delay(&self, delay: Option<Duration>) -> AppResult<()> {
        self.state()?.delay = delay;
        Ok(())
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn state(&self) -> AppResult<std::sync::MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| AppError::Internal("memory connector mutex poisoned".to_string()))
    }

    async fn read(&self, spreadsheet_id: &str, sheet_name: &str) -> AppResult<SheetRows> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let (delay, outcome) = {
            let state = self.state()?;
            let outcome = match &state.failure {
                Some(message) => Err(AppError::Transport(message.clone())),
                None => state
                    .sheets
                    .get(&(spreadsheet_id.to_string(), sheet_name.to_string()))
                    .cloned()
                    .ok_or_else(|| {
                        AppError::Transport(format!(
                            "sheet '{}' of spreadsheet {} was not found",
                            sheet_name, spreadsheet_id
                        ))
                    }),
            };
            (state.delay, outcome)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        outcome
    }
}

impl Connector for MemoryConnector {
    fn fetch_rows<'a>(
        &'a self,
        spreadsheet_id: &'a str,
        sheet_name: &'a str,
        _credentials: &'a Credentials,
    ) -> FetchFuture<'a> {
        Box::pin(self.read(spreadsheet_id, sheet_name))
    }
}

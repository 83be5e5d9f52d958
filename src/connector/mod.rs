pub mod memory;
pub mod values_file;

use crate::errors::{AppError, AppResult};
use crate::models::DataSource;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

pub use memory::MemoryConnector;
pub use values_file::ValuesFileConnector;

pub const KEYRING_SERVICE: &str = "practice-metrics";

/// Header row plus data rows exactly as the sheet returned them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SheetRows {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl SheetRows {
    /// Splits a value grid whose first row is the header.
    pub fn from_grid(mut grid: Vec<Vec<String>>) -> Self {
        if grid.is_empty() {
            return Self::default();
        }
        let header = grid.remove(0);
        Self { header, rows: grid }
    }
}

#[derive(Clone, Default)]
pub struct Credentials {
    pub token: Option<String>,
}

impl Credentials {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

pub type FetchFuture<'a> = Pin<Box<dyn Future<Output = AppResult<SheetRows>> + Send + 'a>>;

/// Spreadsheet transport. Failures are reported as `AppError::Transport`.
pub trait Connector: Send + Sync {
    fn fetch_rows<'a>(
        &'a self,
        spreadsheet_id: &'a str,
        sheet_name: &'a str,
        credentials: &'a Credentials,
    ) -> FetchFuture<'a>;
}

pub trait CredentialProvider: Send + Sync {
    fn credentials_for(&self, data_source: &DataSource) -> AppResult<Credentials>;
}

/// Tokens stored in the OS keyring, one entry per data source id.
#[derive(Debug, Clone)]
pub struct KeyringCredentials {
    service: String,
}

impl Default for KeyringCredentials {
    fn default() -> Self {
        Self {
            service: KEYRING_SERVICE.to_string(),
        }
    }
}

impl KeyringCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, data_source_id: &str, token: &str) -> AppResult<()> {
        let entry = keyring::Entry::new(&self.service, data_source_id)
            .map_err(|error| AppError::Io(error.to_string()))?;
        entry
            .set_password(token)
            .map_err(|error| AppError::Io(error.to_string()))
    }

    pub fn clear(&self, data_source_id: &str) -> AppResult<bool> {
        let entry = keyring::Entry::new(&self.service, data_source_id)
            .map_err(|error| AppError::Io(error.to_string()))?;
        match entry.delete_credential() {
            Ok(_) => Ok(true),
            Err(keyring::Error::NoEntry) => Ok(false),
            Err(error) => Err(AppError::Io(error.to_string())),
        }
    }
}

impl CredentialProvider for KeyringCredentials {
    fn credentials_for(&self, data_source: &DataSource) -> AppResult<Credentials> {
        let entry = keyring::Entry::new(&self.service, &data_source.id)
            .map_err(|error| AppError::Io(error.to_string()))?;
        match entry.get_password() {
            Ok(token) if !token.is_empty() => Ok(Credentials::bearer(token)),
            Ok(_) | Err(keyring::Error::NoEntry) => Ok(Credentials::anonymous()),
            Err(error) => Err(AppError::Io(error.to_string())),
        }
    }
}

/// Hands out the same credentials for every source.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    credentials: Credentials,
}

impl StaticCredentials {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

impl CredentialProvider for StaticCredentials {
    fn credentials_for(&self, _data_source: &DataSource) -> AppResult<Credentials> {
        Ok(self.credentials.clone())
    }
}

use crate::errors::{AppError, AppResult};
use crate::models::Role;
use serde::{Deserialize, Serialize};

/// Caller identity handed in by the session provider. Every entry point takes
/// one explicitly; nothing in the crate reads tenant scope from ambient state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionContext {
    pub clinic_id: Option<String>,
    pub role: Role,
    pub is_system_admin: bool,
}

impl SessionContext {
    pub fn system() -> Self {
        Self {
            clinic_id: None,
            role: Role::Admin,
            is_system_admin: true,
        }
    }

    pub fn clinic_user(clinic_id: &str, role: Role) -> Self {
        Self {
            clinic_id: Some(clinic_id.to_string()),
            role,
            is_system_admin: false,
        }
    }

    /// Checks that a record owned by `clinic_id` is visible to this caller.
    /// Records without a clinic are network-wide and only visible to system admins.
    pub fn ensure_clinic_access(&self, clinic_id: Option<&str>) -> AppResult<()> {
        if self.is_system_admin {
            return Ok(());
        }
        match (self.clinic_id.as_deref(), clinic_id) {
            (Some(own), Some(target)) if own == target => Ok(()),
            (_, None) => Err(AppError::Forbidden(
                "network-wide records require a system administrator".to_string(),
            )),
            _ => Err(AppError::Forbidden(format!(
                "clinic {} is outside the caller's scope",
                clinic_id.unwrap_or_default()
            ))),
        }
    }

    pub fn ensure_can_write(&self) -> AppResult<()> {
        if self.is_system_admin || matches!(self.role, Role::Admin | Role::Manager) {
            Ok(())
        } else {
            Err(AppError::Forbidden("viewers cannot modify metric data".to_string()))
        }
    }

    /// Narrows a requested clinic filter to what the caller may see.
    pub fn effective_clinic(&self, requested: Option<&str>) -> AppResult<Option<String>> {
        if self.is_system_admin {
            return Ok(requested.map(ToString::to_string));
        }
        let Some(own) = self.clinic_id.as_deref() else {
            return Err(AppError::Forbidden("caller has no clinic scope".to_string()));
        };
        match requested {
            Some(requested) if requested != own => Err(AppError::Forbidden(format!(
                "clinic {} is outside the caller's scope",
                requested
            ))),
            _ => Ok(Some(own.to_string())),
        }
    }
}

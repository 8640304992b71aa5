//! Spreadsheet and user-store schemas on top of [`MergeableStore`].
//!
//! A spreadsheet store (`spreadsheetStore-<id>`) holds:
//! - values: `id`, `name`, `description`, `createdBy`, `createdAt`, `updatedAt`
//! - table `cells`, keyed by cell id, fields `rowId`, `columnId`, `value`,
//!   `createdAt`, `updatedAt`, `createdBy`
//! - table `collaborators`, keyed by user id, field `role`
//!
//! A user store (`userStore-<userId>`) holds table `spreadsheets`, keyed by
//! spreadsheet id, field `id`.
//!
//! Timestamps are milliseconds since the Unix epoch stored as numbers.

use std::fmt;
use std::time::SystemTime;
use uuid::Uuid;

use crate::cell_id::CellId;
use crate::error::CoreError;
use crate::patch::Patch;
use crate::store::MergeableStore;
use crate::value::CellValue;

pub const SPREADSHEET_STORE_PREFIX: &str = "spreadsheetStore-";
pub const USER_STORE_PREFIX: &str = "userStore-";

pub const CELLS_TABLE: &str = "cells";
pub const COLLABORATORS_TABLE: &str = "collaborators";
pub const SPREADSHEETS_TABLE: &str = "spreadsheets";

/// Field names used by the spreadsheet tables.
pub mod field {
    pub const ROW_ID: &str = "rowId";
    pub const COLUMN_ID: &str = "columnId";
    pub const VALUE: &str = "value";
    pub const CREATED_AT: &str = "createdAt";
    pub const UPDATED_AT: &str = "updatedAt";
    pub const CREATED_BY: &str = "createdBy";
    pub const ROLE: &str = "role";
    pub const ID: &str = "id";
}

/// Top-level value keys of a spreadsheet store.
pub mod value_key {
    pub const ID: &str = "id";
    pub const NAME: &str = "name";
    pub const DESCRIPTION: &str = "description";
    pub const CREATED_BY: &str = "createdBy";
    pub const CREATED_AT: &str = "createdAt";
    pub const UPDATED_AT: &str = "updatedAt";
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Parsed store id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StoreId {
    Spreadsheet(String),
    User(String),
}

impl StoreId {
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        if let Some(id) = s.strip_prefix(SPREADSHEET_STORE_PREFIX) {
            if !id.is_empty() {
                return Ok(StoreId::Spreadsheet(id.to_string()));
            }
        }
        if let Some(id) = s.strip_prefix(USER_STORE_PREFIX) {
            if !id.is_empty() {
                return Ok(StoreId::User(id.to_string()));
            }
        }
        Err(CoreError::InvalidStoreId(s.to_string()))
    }

    pub fn entity_id(&self) -> &str {
        match self {
            StoreId::Spreadsheet(id) | StoreId::User(id) => id,
        }
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreId::Spreadsheet(id) => write!(f, "{SPREADSHEET_STORE_PREFIX}{id}"),
            StoreId::User(id) => write!(f, "{USER_STORE_PREFIX}{id}"),
        }
    }
}

/// Collaborator role. Drives UI affordances only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollaboratorRole {
    Owner,
    Editor,
    Viewer,
}

impl CollaboratorRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            CollaboratorRole::Owner => "owner",
            CollaboratorRole::Editor => "editor",
            CollaboratorRole::Viewer => "viewer",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "owner" => Some(CollaboratorRole::Owner),
            "editor" => Some(CollaboratorRole::Editor),
            "viewer" => Some(CollaboratorRole::Viewer),
            _ => None,
        }
    }

    pub fn can_edit(&self) -> bool {
        !matches!(self, CollaboratorRole::Viewer)
    }
}

/// Spreadsheet summary values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpreadsheetSummary {
    pub id: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub created_by: Option<String>,
    pub created_at: Option<u64>,
    pub updated_at: Option<u64>,
}

/// Flat cell record handed to the native grid.
#[derive(Debug, Clone, PartialEq)]
pub struct CellRecord {
    pub row_id: String,
    pub column_id: String,
    pub value: Option<CellValue>,
    pub created_at: Option<u64>,
    pub updated_at: Option<u64>,
    pub created_by: Option<String>,
}

/// Edit event emitted by the native grid.
#[derive(Debug, Clone, PartialEq)]
pub struct CellEdited {
    pub cell_id: String,
    pub value: CellValue,
}

fn text(v: Option<&CellValue>) -> Option<String> {
    v.and_then(|v| v.as_str()).map(str::to_string)
}

fn millis(v: Option<&CellValue>) -> Option<u64> {
    v.and_then(|v| v.as_f64()).map(|n| n as u64)
}

/// Spreadsheet operations on a spreadsheet store.
pub trait SpreadsheetExt {
    /// Initialize summary values for a freshly created spreadsheet.
    fn create_spreadsheet(
        &mut self,
        id: &str,
        name: &str,
        description: &str,
        created_by: &str,
        now: u64,
    ) -> Patch;
    fn summary(&self) -> SpreadsheetSummary;
    fn rename(&mut self, name: &str, now: u64) -> Patch;
    fn set_description(&mut self, description: &str, now: u64) -> Patch;

    /// Write a cell value together with its bookkeeping fields.
    fn write_cell(
        &mut self,
        cell_id: &CellId,
        value: CellValue,
        user_id: &str,
        now: u64,
    ) -> Patch;
    fn clear_cell(&mut self, cell_id: &CellId) -> Patch;
    fn cell_record(&self, cell_id: &CellId) -> Option<CellRecord>;
    fn cell_records(&self) -> Vec<CellRecord>;
    /// Cell ids ordered by `rowId`, paged by `offset`/`limit`.
    fn sorted_cell_ids(&self, descending: bool, offset: usize, limit: Option<usize>) -> Vec<String>;
    fn apply_cell_edit(&mut self, edit: &CellEdited, user_id: &str, now: u64)
        -> Result<Patch, CoreError>;

    fn add_collaborator(&mut self, user_id: &str, role: CollaboratorRole) -> Patch;
    /// Register `user_id` with `role` unless it already has a role.
    fn ensure_collaborator(&mut self, user_id: &str, role: CollaboratorRole) -> Patch;
    fn remove_collaborator(&mut self, user_id: &str) -> Patch;
    fn collaborator_role(&self, user_id: &str) -> Option<CollaboratorRole>;
    fn collaborators(&self) -> Vec<(String, CollaboratorRole)>;
}

impl SpreadsheetExt for MergeableStore {
    fn create_spreadsheet(
        &mut self,
        id: &str,
        name: &str,
        description: &str,
        created_by: &str,
        now: u64,
    ) -> Patch {
        let mut patch = self.set_value(value_key::ID, id);
        patch.extend(self.set_value(value_key::NAME, name));
        patch.extend(self.set_value(value_key::DESCRIPTION, description));
        patch.extend(self.set_value(value_key::CREATED_BY, created_by));
        patch.extend(self.set_value(value_key::CREATED_AT, now as f64));
        patch.extend(self.set_value(value_key::UPDATED_AT, now as f64));
        patch.extend(self.add_collaborator(created_by, CollaboratorRole::Owner));
        patch
    }

    fn summary(&self) -> SpreadsheetSummary {
        SpreadsheetSummary {
            id: text(self.get_value(value_key::ID)),
            name: text(self.get_value(value_key::NAME)),
            description: text(self.get_value(value_key::DESCRIPTION)),
            created_by: text(self.get_value(value_key::CREATED_BY)),
            created_at: millis(self.get_value(value_key::CREATED_AT)),
            updated_at: millis(self.get_value(value_key::UPDATED_AT)),
        }
    }

    fn rename(&mut self, name: &str, now: u64) -> Patch {
        let mut patch = self.set_value(value_key::NAME, name);
        patch.extend(self.set_value(value_key::UPDATED_AT, now as f64));
        patch
    }

    fn set_description(&mut self, description: &str, now: u64) -> Patch {
        let mut patch = self.set_value(value_key::DESCRIPTION, description);
        patch.extend(self.set_value(value_key::UPDATED_AT, now as f64));
        patch
    }

    fn write_cell(
        &mut self,
        cell_id: &CellId,
        value: CellValue,
        user_id: &str,
        now: u64,
    ) -> Patch {
        let row_id = cell_id.to_string();
        let mut fields: Vec<(&str, CellValue)> = vec![
            (field::ROW_ID, CellValue::from(cell_id.row_id())),
            (field::COLUMN_ID, CellValue::from(cell_id.column_id())),
            (field::VALUE, value),
            (field::UPDATED_AT, CellValue::from(now as f64)),
        ];
        if self.get_cell(CELLS_TABLE, &row_id, field::CREATED_AT).is_none() {
            fields.push((field::CREATED_AT, CellValue::from(now as f64)));
        }
        if self.get_cell(CELLS_TABLE, &row_id, field::CREATED_BY).is_none() {
            fields.push((field::CREATED_BY, CellValue::from(user_id)));
        }
        self.set_row(CELLS_TABLE, &row_id, fields)
    }

    fn clear_cell(&mut self, cell_id: &CellId) -> Patch {
        self.del_row(CELLS_TABLE, &cell_id.to_string())
    }

    fn cell_record(&self, cell_id: &CellId) -> Option<CellRecord> {
        let row_id = cell_id.to_string();
        let row = self.get_row(CELLS_TABLE, &row_id)?;
        Some(CellRecord {
            row_id: cell_id.row_id().to_string(),
            column_id: cell_id.column_id().to_string(),
            value: row.get(field::VALUE).cloned(),
            created_at: millis(row.get(field::CREATED_AT)),
            updated_at: millis(row.get(field::UPDATED_AT)),
            created_by: text(row.get(field::CREATED_BY)),
        })
    }

    fn cell_records(&self) -> Vec<CellRecord> {
        self.row_ids(CELLS_TABLE)
            .iter()
            .filter_map(|id| match CellId::parse(id) {
                Ok(cell_id) => self.cell_record(&cell_id),
                Err(e) => {
                    log::warn!("store {}: skipping malformed cell row: {e}", self.id());
                    None
                }
            })
            .collect()
    }

    fn sorted_cell_ids(&self, descending: bool, offset: usize, limit: Option<usize>) -> Vec<String> {
        self.sorted_row_ids(CELLS_TABLE, field::ROW_ID, descending, offset, limit)
    }

    fn apply_cell_edit(
        &mut self,
        edit: &CellEdited,
        user_id: &str,
        now: u64,
    ) -> Result<Patch, CoreError> {
        let cell_id = CellId::parse(&edit.cell_id)?;
        Ok(self.write_cell(&cell_id, edit.value.clone(), user_id, now))
    }

    fn add_collaborator(&mut self, user_id: &str, role: CollaboratorRole) -> Patch {
        self.set_cell(COLLABORATORS_TABLE, user_id, field::ROLE, role.as_str())
    }

    fn ensure_collaborator(&mut self, user_id: &str, role: CollaboratorRole) -> Patch {
        if self.collaborator_role(user_id).is_some() {
            return Patch::new();
        }
        self.add_collaborator(user_id, role)
    }

    fn remove_collaborator(&mut self, user_id: &str) -> Patch {
        self.del_row(COLLABORATORS_TABLE, user_id)
    }

    fn collaborator_role(&self, user_id: &str) -> Option<CollaboratorRole> {
        self.get_cell(COLLABORATORS_TABLE, user_id, field::ROLE)
            .and_then(|v| v.as_str())
            .and_then(CollaboratorRole::parse)
    }

    fn collaborators(&self) -> Vec<(String, CollaboratorRole)> {
        self.row_ids(COLLABORATORS_TABLE)
            .into_iter()
            .filter_map(|id| self.collaborator_role(&id).map(|role| (id, role)))
            .collect()
    }
}

/// Operations on a per-user store listing spreadsheets.
pub trait UserStoreExt {
    /// Register a brand-new spreadsheet and return its id.
    fn add_spreadsheet(&mut self) -> (String, Patch);
    fn join_spreadsheet(&mut self, id: &str) -> Patch;
    fn remove_spreadsheet(&mut self, id: &str) -> Patch;
    fn spreadsheet_ids(&self) -> Vec<String>;
}

impl UserStoreExt for MergeableStore {
    fn add_spreadsheet(&mut self) -> (String, Patch) {
        let id = Uuid::new_v4().simple().to_string();
        let patch = self.join_spreadsheet(&id);
        (id, patch)
    }

    fn join_spreadsheet(&mut self, id: &str) -> Patch {
        self.set_cell(SPREADSHEETS_TABLE, id, field::ID, id)
    }

    fn remove_spreadsheet(&mut self, id: &str) -> Patch {
        self.del_row(SPREADSHEETS_TABLE, id)
    }

    fn spreadsheet_ids(&self) -> Vec<String> {
        self.row_ids(SPREADSHEETS_TABLE)
    }
}

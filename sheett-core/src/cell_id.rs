//! Composite spreadsheet cell ids (`<rowId>-<columnId>`).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

pub const CELL_ID_SEPARATOR: char = '-';

/// Row/column pair identifying a spreadsheet cell.
///
/// Neither component may be empty or contain the separator, so
/// `parse(id.to_string()) == id` always holds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellId {
    row_id: String,
    column_id: String,
}

impl CellId {
    pub fn new(row_id: impl Into<String>, column_id: impl Into<String>) -> Result<Self, CoreError> {
        let row_id = row_id.into();
        let column_id = column_id.into();
        if !Self::valid_part(&row_id) || !Self::valid_part(&column_id) {
            return Err(CoreError::InvalidCellId(format!(
                "{row_id}{CELL_ID_SEPARATOR}{column_id}"
            )));
        }
        Ok(Self { row_id, column_id })
    }

    /// Parse `<rowId>-<columnId>`.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s.split_once(CELL_ID_SEPARATOR) {
            Some((row, column)) if Self::valid_part(row) && Self::valid_part(column) => Ok(Self {
                row_id: row.to_string(),
                column_id: column.to_string(),
            }),
            _ => Err(CoreError::InvalidCellId(s.to_string())),
        }
    }

    pub fn row_id(&self) -> &str {
        &self.row_id
    }

    pub fn column_id(&self) -> &str {
        &self.column_id
    }

    fn valid_part(part: &str) -> bool {
        !part.is_empty() && !part.contains(CELL_ID_SEPARATOR)
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.row_id, CELL_ID_SEPARATOR, self.column_id)
    }
}

impl FromStr for CellId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CellId::parse(s)
    }
}

/// Spreadsheet column label for a zero-based index: 0 → A, 25 → Z, 26 → AA.
pub fn column_label(index: usize) -> String {
    let mut n = index;
    let mut label = Vec::new();
    loop {
        label.push(b'A' + (n % 26) as u8);
        if n < 26 {
            break;
        }
        n = n / 26 - 1;
    }
    label.reverse();
    String::from_utf8(label).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_and_parse() {
        let id = CellId::new("12", "3").unwrap();
        assert_eq!(id.to_string(), "12-3");

        let parsed: CellId = "12-3".parse().unwrap();
        assert_eq!(parsed, id);
        assert_eq!(parsed.row_id(), "12");
        assert_eq!(parsed.column_id(), "3");
    }

    #[test]
    fn test_parse_rejects_empty_parts() {
        for bad in ["", "-", "0-", "-0", "00", "0-1-2"] {
            assert_eq!(
                CellId::parse(bad),
                Err(CoreError::InvalidCellId(bad.to_string())),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_new_rejects_separator() {
        assert!(CellId::new("a-b", "c").is_err());
        assert!(CellId::new("", "c").is_err());
        assert!(CellId::new("r", "").is_err());
    }

    #[test]
    fn test_column_labels() {
        assert_eq!(column_label(0), "A");
        assert_eq!(column_label(25), "Z");
        assert_eq!(column_label(26), "AA");
        assert_eq!(column_label(27), "AB");
        assert_eq!(column_label(701), "ZZ");
        assert_eq!(column_label(702), "AAA");
    }

    #[test]
    fn test_column_label_largest_index() {
        let label = column_label(usize::MAX);
        assert!(!label.is_empty());
        assert!(label.bytes().all(|b| b.is_ascii_uppercase()));
        assert_ne!(label, column_label(usize::MAX - 1));
    }
}

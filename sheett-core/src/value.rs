//! Tagged field values.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Value stored in a single field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CellValue {
    Text(String),
    Number(f64),
    Bool(bool),
}

impl CellValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            CellValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CellValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            CellValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    fn type_rank(&self) -> u8 {
        match self {
            CellValue::Bool(_) => 0,
            CellValue::Number(_) => 1,
            CellValue::Text(_) => 2,
        }
    }

    /// Total order used for sorting rows by a field.
    ///
    /// Values of different types are grouped by type (bools, numbers, text).
    pub fn sort_cmp(&self, other: &CellValue) -> Ordering {
        match (self, other) {
            (CellValue::Text(a), CellValue::Text(b)) => a.cmp(b),
            (CellValue::Number(a), CellValue::Number(b)) => a.total_cmp(b),
            (CellValue::Bool(a), CellValue::Bool(b)) => a.cmp(b),
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Text(s) => f.write_str(s),
            CellValue::Number(n) => write!(f, "{n}"),
            CellValue::Bool(b) => write!(f, "{b}"),
        }
    }
}

impl From<&str> for CellValue {
    fn from(s: &str) -> Self {
        CellValue::Text(s.to_string())
    }
}

impl From<String> for CellValue {
    fn from(s: String) -> Self {
        CellValue::Text(s)
    }
}

impl From<f64> for CellValue {
    fn from(n: f64) -> Self {
        CellValue::Number(n)
    }
}

impl From<i64> for CellValue {
    fn from(n: i64) -> Self {
        CellValue::Number(n as f64)
    }
}

impl From<bool> for CellValue {
    fn from(b: bool) -> Self {
        CellValue::Bool(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accessors() {
        assert_eq!(CellValue::from("x").as_str(), Some("x"));
        assert_eq!(CellValue::from(2.5).as_f64(), Some(2.5));
        assert_eq!(CellValue::from(true).as_bool(), Some(true));
        assert_eq!(CellValue::from(7i64).as_str(), None);
    }

    #[test]
    fn test_sort_cmp_mixed_types() {
        let mut values = vec![
            CellValue::from("b"),
            CellValue::from(10.0),
            CellValue::from("a"),
            CellValue::from(false),
            CellValue::from(-1.0),
        ];
        values.sort_by(|a, b| a.sort_cmp(b));
        assert_eq!(
            values,
            vec![
                CellValue::from(false),
                CellValue::from(-1.0),
                CellValue::from(10.0),
                CellValue::from("a"),
                CellValue::from("b"),
            ]
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(CellValue::from("hello").to_string(), "hello");
        assert_eq!(CellValue::from(3.0).to_string(), "3");
        assert_eq!(CellValue::from(false).to_string(), "false");
    }
}

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::data::parse_typed_value;

pub const DEFAULT_SAMPLE_ROWS: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    String,
    Integer,
    Float,
    Boolean,
    Date,
    DateTime,
    Guid,
}

impl ColumnType {
    pub fn is_numeric(&self) -> bool {
        matches!(self, ColumnType::Integer | ColumnType::Float)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::String => "string",
            ColumnType::Integer => "integer",
            ColumnType::Float => "float",
            ColumnType::Boolean => "boolean",
            ColumnType::Date => "date",
            ColumnType::DateTime => "datetime",
            ColumnType::Guid => "guid",
        }
    }

    /// Widest type able to hold values of both `self` and `other`.
    pub fn unify(self, other: ColumnType) -> ColumnType {
        match (self, other) {
            (a, b) if a == b => a,
            (ColumnType::Integer, ColumnType::Float) | (ColumnType::Float, ColumnType::Integer) => {
                ColumnType::Float
            }
            _ => ColumnType::String,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const INFERENCE_ORDER: &[ColumnType] = &[
    ColumnType::Integer,
    ColumnType::Float,
    ColumnType::Boolean,
    ColumnType::Date,
    ColumnType::DateTime,
    ColumnType::Guid,
];

pub fn infer_column_type<'a, I>(samples: I) -> ColumnType
where
    I: IntoIterator<Item = &'a str>,
{
    let values = samples
        .into_iter()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .collect::<Vec<_>>();
    if values.is_empty() {
        return ColumnType::String;
    }
    INFERENCE_ORDER
        .iter()
        .copied()
        .find(|candidate| {
            values
                .iter()
                .all(|value| parse_typed_value(value, candidate).is_ok())
        })
        .unwrap_or(ColumnType::String)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infers_most_specific_type() {
        assert_eq!(infer_column_type(["1", "2", ""]), ColumnType::Integer);
        assert_eq!(infer_column_type(["1", "2.5"]), ColumnType::Float);
        assert_eq!(infer_column_type(["yes", "no"]), ColumnType::Boolean);
        assert_eq!(
            infer_column_type(["2024-01-01", "2024-02-03"]),
            ColumnType::Date
        );
        assert_eq!(infer_column_type(["Acme", "1"]), ColumnType::String);
        assert_eq!(infer_column_type(Vec::<&str>::new()), ColumnType::String);
    }

    #[test]
    fn unify_widens_numeric_and_falls_back_to_string() {
        assert_eq!(
            ColumnType::Integer.unify(ColumnType::Float),
            ColumnType::Float
        );
        assert_eq!(
            ColumnType::Date.unify(ColumnType::Integer),
            ColumnType::String
        );
    }
}

use std::path::Path;

use anyhow::{Result, ensure};
use rust_decimal::prelude::ToPrimitive;
use serde::Serialize;

use crate::{
    data::{Value, parse_amount},
    dataset::Dataset,
    io_utils,
};

pub use super::payload::ChartKind;

/// Self-contained chart description. Values are copied out of the dataset
/// at declaration time, so later transformations do not change a chart.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Chart {
    pub kind: ChartKind,
    pub title: String,
    pub dataset: String,
    pub x_column: String,
    pub y_column: String,
    pub x: Vec<Option<String>>,
    pub y: Vec<Option<f64>>,
}

fn numeric(value: &Value) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| parse_amount(&value.as_display()).and_then(|d| d.to_f64()))
}

impl Chart {
    pub fn from_dataset(
        kind: ChartKind,
        dataset: &Dataset,
        x_column: &str,
        y_column: &str,
        title: Option<&str>,
    ) -> Result<Self> {
        let x_idx = dataset.require_column(x_column)?;
        let y_idx = dataset.require_column(y_column)?;
        let x = dataset
            .rows()
            .iter()
            .map(|row| row[x_idx].as_ref().map(Value::as_display))
            .collect::<Vec<_>>();
        let y = dataset
            .rows()
            .iter()
            .map(|row| row[y_idx].as_ref().and_then(numeric))
            .collect::<Vec<_>>();
        ensure!(
            y.is_empty() || y.iter().any(Option::is_some),
            "Column '{y_column}' of '{}' has no numeric values to plot",
            dataset.name()
        );
        let columns = dataset.columns();
        Ok(Chart {
            kind,
            title: title.map_or_else(
                || format!("{} by {}", columns[y_idx].name, columns[x_idx].name),
                str::to_string,
            ),
            dataset: dataset.name().to_string(),
            x_column: columns[x_idx].name.clone(),
            y_column: columns[y_idx].name.clone(),
            x,
            y,
        })
    }
}

pub fn write_charts(path: &Path, charts: &[Chart]) -> Result<()> {
    io_utils::write_json(path, &charts)
}

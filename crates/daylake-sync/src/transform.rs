//! Staged JSON to date-partitioned Parquet conversion.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow_array::{ArrayRef, BooleanArray, Float64Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{ArrowError, DataType, Field as ArrowField, Schema};
use chrono::NaiveDate;
use daylake_core::{date_partition_dir, BatchResult, CONVERTED_FILE_NAME};
use parquet::arrow::ArrowWriter;
use parquet::errors::ParquetError;
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{error, info};

/// Column used for scalar elements of a top-level array payload.
pub const SCALAR_COLUMN: &str = "value";

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("{action} {}: {source}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("payload has no columns")]
    Empty,
    #[error("building record batch: {0}")]
    Arrow(#[from] ArrowError),
    #[error("writing parquet: {0}")]
    Parquet(#[from] ParquetError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransformSummary {
    pub converted: BTreeMap<NaiveDate, PathBuf>,
    pub failed: Vec<NaiveDate>,
}

/// Convert every staged file on the blocking pool. Per-file failures are
/// logged and listed in the summary, never returned.
pub async fn transform_to_parquet(staged: &BatchResult, processed_dir: &Path) -> TransformSummary {
    let mut tasks = JoinSet::new();
    for (date, json_path) in staged {
        let date = *date;
        let json_path = json_path.clone();
        let processed_dir = processed_dir.to_path_buf();
        tasks.spawn_blocking(move || {
            let converted = convert_file(date, &json_path, &processed_dir);
            (date, json_path, converted)
        });
    }

    let mut summary = TransformSummary::default();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((date, _, Ok(parquet_path))) => {
                info!(%date, path = %parquet_path.display(), "converted JSON to Parquet");
                summary.converted.insert(date, parquet_path);
            }
            Ok((date, json_path, Err(err))) => {
                error!(%date, input = %json_path.display(), error = %err, "conversion failed");
                summary.failed.push(date);
            }
            Err(err) => error!(error = %err, "conversion task aborted"),
        }
    }
    summary.failed.sort();
    summary
}

/// Read one staged JSON file and write `{processed_root}/year=Y/month=M/day=D/file.parquet`.
/// The input file is left untouched.
pub fn convert_file(
    date: NaiveDate,
    json_path: &Path,
    processed_root: &Path,
) -> Result<PathBuf, TransformError> {
    let bytes = std::fs::read(json_path).map_err(|source| TransformError::Io {
        action: "reading",
        path: json_path.to_path_buf(),
        source,
    })?;
    let payload: JsonValue =
        serde_json::from_slice(&bytes).map_err(|source| TransformError::Parse {
            path: json_path.to_path_buf(),
            source,
        })?;
    let batch = payload_to_record_batch(&payload)?;

    let dir = date_partition_dir(processed_root, date);
    std::fs::create_dir_all(&dir).map_err(|source| TransformError::Io {
        action: "creating",
        path: dir.clone(),
        source,
    })?;
    let parquet_path = dir.join(CONVERTED_FILE_NAME);
    write_parquet(&parquet_path, batch)?;
    Ok(parquet_path)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    Boolean,
    Int64,
    Float64,
    Utf8,
}

impl ColumnKind {
    fn infer(values: &[Option<&JsonValue>]) -> Self {
        let present = values.iter().flatten().collect::<Vec<_>>();
        if present.is_empty() {
            ColumnKind::Utf8
        } else if present.iter().all(|v| v.is_boolean()) {
            ColumnKind::Boolean
        } else if present.iter().all(|v| v.is_i64()) {
            ColumnKind::Int64
        } else if present.iter().all(|v| v.is_number()) {
            ColumnKind::Float64
        } else {
            ColumnKind::Utf8
        }
    }

    fn data_type(self) -> DataType {
        match self {
            ColumnKind::Boolean => DataType::Boolean,
            ColumnKind::Int64 => DataType::Int64,
            ColumnKind::Float64 => DataType::Float64,
            ColumnKind::Utf8 => DataType::Utf8,
        }
    }

    fn build(self, values: &[Option<&JsonValue>]) -> ArrayRef {
        match self {
            ColumnKind::Boolean => Arc::new(BooleanArray::from(
                values
                    .iter()
                    .copied()
                    .map(|v| v.and_then(JsonValue::as_bool))
                    .collect::<Vec<_>>(),
            )),
            ColumnKind::Int64 => Arc::new(Int64Array::from(
                values
                    .iter()
                    .copied()
                    .map(|v| v.and_then(JsonValue::as_i64))
                    .collect::<Vec<_>>(),
            )),
            ColumnKind::Float64 => Arc::new(Float64Array::from(
                values
                    .iter()
                    .copied()
                    .map(|v| v.and_then(JsonValue::as_f64))
                    .collect::<Vec<_>>(),
            )),
            // Nested objects and arrays are kept as compact JSON text.
            ColumnKind::Utf8 => Arc::new(StringArray::from(
                values
                    .iter()
                    .copied()
                    .map(|v| {
                        v.map(|value| match value {
                            JsonValue::String(text) => text.clone(),
                            other => other.to_string(),
                        })
                    })
                    .collect::<Vec<_>>(),
            )),
        }
    }
}

fn payload_rows(payload: &JsonValue) -> Vec<BTreeMap<&str, &JsonValue>> {
    match payload {
        JsonValue::Array(items) => items.iter().map(row_of).collect(),
        other => vec![row_of(other)],
    }
}

fn row_of(value: &JsonValue) -> BTreeMap<&str, &JsonValue> {
    match value {
        JsonValue::Object(map) => map.iter().map(|(k, v)| (k.as_str(), v)).collect(),
        scalar => BTreeMap::from([(SCALAR_COLUMN, scalar)]),
    }
}

/// Tabulate a payload: an object is one row, an array is one row per element.
/// Columns are the union of keys in lexicographic order, all nullable.
pub fn payload_to_record_batch(payload: &JsonValue) -> Result<RecordBatch, TransformError> {
    let rows = payload_rows(payload);
    let columns = rows
        .iter()
        .flat_map(|row| row.keys().copied())
        .collect::<BTreeSet<_>>();
    if columns.is_empty() {
        return Err(TransformError::Empty);
    }

    let mut fields = Vec::with_capacity(columns.len());
    let mut arrays = Vec::with_capacity(columns.len());
    for column in columns {
        let values = rows
            .iter()
            .map(|row| row.get(column).copied().filter(|v| !v.is_null()))
            .collect::<Vec<_>>();
        let kind = ColumnKind::infer(&values);
        fields.push(ArrowField::new(column, kind.data_type(), true));
        arrays.push(kind.build(&values));
    }

    Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)?)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<(), TransformError> {
    let file = File::create(path).map_err(|source| TransformError::Io {
        action: "creating",
        path: path.to_path_buf(),
        source,
    })?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(())
}

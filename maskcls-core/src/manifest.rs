use crate::error::{Error, Result};
use csv::StringRecord;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Column holding the image file names of an inference manifest.
pub const IMAGE_ID_COLUMN: &str = "ImageID";

/// One subject of the training manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestRecord {
    pub id: String,
    pub gender: String,
    pub age: i64,
    pub folder: String,
}

/// Positions of the training manifest columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestLayout {
    pub gender: usize,
    pub age: usize,
    /// Counted from the end of the row, `1` being the last column.
    pub folder_from_end: usize,
}

impl Default for ManifestLayout {
    fn default() -> Self {
        Self {
            gender: 1,
            age: 3,
            folder_from_end: 4,
        }
    }
}

impl ManifestLayout {
    fn record(&self, path: &Path, row: &StringRecord) -> Result<ManifestRecord> {
        let malformed = |reason: String| Error::Manifest {
            path: path.to_path_buf(),
            reason,
        };
        let len = row.len();
        if self.folder_from_end == 0 || self.folder_from_end > len {
            return Err(malformed(format!(
                "row {row:?} has {len} columns, the folder column is {} from the end",
                self.folder_from_end
            )));
        }
        let field = |index: usize| {
            row.get(index)
                .ok_or_else(|| malformed(format!("row {row:?} has no column {index}")))
        };
        let age = field(self.age)?;
        Ok(ManifestRecord {
            id: field(0)?.to_string(),
            gender: field(self.gender)?.to_string(),
            age: age
                .trim()
                .parse()
                .map_err(|_| malformed(format!("age {age:?} is not an integer")))?,
            folder: field(len - self.folder_from_end)?.to_string(),
        })
    }
}

/// Reads every subject of a training manifest.
pub fn read_records(path: &Path, layout: ManifestLayout) -> Result<Vec<ManifestRecord>> {
    let mut reader = csv::Reader::from_path(path)?;
    reader
        .records()
        .map(|row| layout.record(path, &row?))
        .collect()
}

/// Reads the [`IMAGE_ID_COLUMN`] of an inference manifest, in row order.
pub fn read_image_ids(path: &Path) -> Result<Vec<String>> {
    let table = ManifestTable::read(path)?;
    let column = table.column_index(IMAGE_ID_COLUMN).ok_or_else(|| Error::Manifest {
        path: path.to_path_buf(),
        reason: format!("missing column {IMAGE_ID_COLUMN:?}"),
    })?;
    Ok(table
        .rows
        .iter()
        .map(|row| row.get(column).unwrap_or_default().to_string())
        .collect())
}

/// A whole CSV table kept verbatim, used to write predictions next to the input columns.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestTable {
    path: PathBuf,
    headers: StringRecord,
    rows: Vec<StringRecord>,
}

impl ManifestTable {
    pub fn read(path: &Path) -> Result<Self> {
        let mut reader = csv::Reader::from_path(path)?;
        let headers = reader.headers()?.clone();
        let rows = reader.records().collect::<csv::Result<Vec<_>>>()?;
        Ok(Self {
            path: path.to_path_buf(),
            headers,
            rows,
        })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn headers(&self) -> impl Iterator<Item = &str> {
        self.headers.iter()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    pub fn column(&self, name: &str) -> Option<Vec<&str>> {
        let index = self.column_index(name)?;
        Some(
            self.rows
                .iter()
                .map(|row| row.get(index).unwrap_or_default())
                .collect(),
        )
    }

    /// Returns a copy with `name` set to `values`, replacing the column if it already exists.
    pub fn with_column<T: ToString>(&self, name: &str, values: &[T]) -> Result<Self> {
        if values.len() != self.rows.len() {
            return Err(Error::Config(format!(
                "{} values for column {name:?} of a table with {} rows",
                values.len(),
                self.rows.len()
            )));
        }
        let existing = self.column_index(name);
        let replace = |record: &StringRecord, value: String| match existing {
            Some(index) => record
                .iter()
                .enumerate()
                .map(|(i, field)| if i == index { value.clone() } else { field.to_string() })
                .collect::<StringRecord>(),
            None => {
                let mut record = record.clone();
                record.push_field(&value);
                record
            }
        };
        Ok(Self {
            path: self.path.clone(),
            headers: replace(&self.headers, name.to_string()),
            rows: self
                .rows
                .iter()
                .zip(values)
                .map(|(row, value)| replace(row, value.to_string()))
                .collect(),
        })
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(&self.headers)?;
        for row in &self.rows {
            writer.write_record(row)?;
        }
        writer.flush()?;
        Ok(())
    }
}

//! A named collection of equal-length columns: the shape handed to the
//! realism layer (joint dropout), the validator, and the exporters.

use ndarray::Array1;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("column '{name}' has {found} rows but the dataset holds {expected}")]
    LengthMismatch {
        name: String,
        expected: usize,
        found: usize,
    },
    #[error("a column named '{0}' already exists")]
    DuplicateColumn(String),
    #[error("no column named '{0}'")]
    UnknownColumn(String),
    #[error("row mask has {found} entries but the dataset holds {expected} rows")]
    MaskLengthMismatch { expected: usize, found: usize },
}

/// One variable's worth of observations.
#[derive(Debug, Clone)]
pub enum Column {
    /// Continuous or perturbed values; `NaN` is the missing sentinel.
    Numeric(Array1<f64>),
    /// Binary flags, ordinal levels, counts, group indices.
    Integer(Array1<i64>),
    /// Free-form labels (subject identifiers).
    Text(Vec<String>),
}

impl Column {
    pub fn len(&self) -> usize {
        match self {
            Column::Numeric(values) => values.len(),
            Column::Integer(values) => values.len(),
            Column::Text(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_numeric(&self) -> Option<&Array1<f64>> {
        match self {
            Column::Numeric(values) => Some(values),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<&Array1<i64>> {
        match self {
            Column::Integer(values) => Some(values),
            _ => None,
        }
    }

    /// A numeric view regardless of storage: integers are widened.
    /// `None` for text columns.
    pub fn to_numeric(&self) -> Option<Array1<f64>> {
        match self {
            Column::Numeric(values) => Some(values.clone()),
            Column::Integer(values) => Some(values.mapv(|v| v as f64)),
            Column::Text(_) => None,
        }
    }

    fn filtered(&self, keep: &Array1<bool>) -> Column {
        match self {
            Column::Numeric(values) => Column::Numeric(
                values
                    .iter()
                    .zip(keep.iter())
                    .filter(|(_, &k)| k)
                    .map(|(&v, _)| v)
                    .collect(),
            ),
            Column::Integer(values) => Column::Integer(
                values
                    .iter()
                    .zip(keep.iter())
                    .filter(|(_, &k)| k)
                    .map(|(&v, _)| v)
                    .collect(),
            ),
            Column::Text(values) => Column::Text(
                values
                    .iter()
                    .zip(keep.iter())
                    .filter(|(_, &k)| k)
                    .map(|(v, _)| v.clone())
                    .collect(),
            ),
        }
    }
}

/// Ordered name -> column map with a single row count.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    names: Vec<String>,
    columns: Vec<Column>,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn n_rows(&self) -> usize {
        self.columns.first().map_or(0, Column::len)
    }

    pub fn n_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn push(&mut self, name: impl Into<String>, column: Column) -> Result<(), DatasetError> {
        let name = name.into();
        if self.names.iter().any(|existing| *existing == name) {
            return Err(DatasetError::DuplicateColumn(name));
        }
        if !self.columns.is_empty() && column.len() != self.n_rows() {
            return Err(DatasetError::LengthMismatch {
                name,
                expected: self.n_rows(),
                found: column.len(),
            });
        }
        self.names.push(name);
        self.columns.push(column);
        Ok(())
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.names
            .iter()
            .position(|existing| existing == name)
            .map(|index| &self.columns[index])
    }

    /// Replace an existing column, keeping its position. The new column
    /// must match the dataset's row count.
    pub fn replace(&mut self, name: &str, column: Column) -> Result<(), DatasetError> {
        if column.len() != self.n_rows() {
            return Err(DatasetError::LengthMismatch {
                name: name.to_string(),
                expected: self.n_rows(),
                found: column.len(),
            });
        }
        let index = self
            .names
            .iter()
            .position(|existing| existing == name)
            .ok_or_else(|| DatasetError::UnknownColumn(name.to_string()))?;
        self.columns[index] = column;
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Column)> {
        self.names
            .iter()
            .map(String::as_str)
            .zip(self.columns.iter())
    }

    /// A new dataset holding only the rows where `keep` is true, the
    /// same mask applied to every column.
    pub fn filter_rows(&self, keep: &Array1<bool>) -> Result<Dataset, DatasetError> {
        if keep.len() != self.n_rows() {
            return Err(DatasetError::MaskLengthMismatch {
                expected: self.n_rows(),
                found: keep.len(),
            });
        }
        Ok(Dataset {
            names: self.names.clone(),
            columns: self.columns.iter().map(|c| c.filtered(keep)).collect(),
        })
    }
}

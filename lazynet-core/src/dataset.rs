use crate::{Error, HostTensor, Result};

/// One logical row: the model inputs and the expected outputs.
pub type Row = (Vec<HostTensor>, Vec<HostTensor>);

/// Index-addressable rows, possibly generated on demand.
pub trait DataSet: Send + Sync {
    fn count(&self) -> usize;

    fn get_row(&self, index: usize) -> Result<Row>;

    /// Tensors per row on the input side, read from the first row.
    fn input_count(&self) -> Result<usize> {
        Ok(self.get_row(0)?.0.len())
    }

    /// Tensors per row on the expected-output side, read from the first row.
    fn output_count(&self) -> Result<usize> {
        Ok(self.get_row(0)?.1.len())
    }

    /// `size` rows starting at `start`, wrapping around the end so every
    /// batch is full.
    fn get_batch(&self, start: usize, size: usize) -> Result<Vec<Row>> {
        let count = self.count();
        if count == 0 {
            return Err(Error::config("data set is empty"));
        }
        (0..size).map(|i| self.get_row((start + i) % count)).collect()
    }
}

/// Rows held in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDataSet {
    rows: Vec<Row>,
}

impl InMemoryDataSet {
    pub fn new(rows: Vec<Row>) -> Self {
        Self { rows }
    }

    /// Rows with inputs only, for inference.
    pub fn from_inputs(inputs: Vec<Vec<HostTensor>>) -> Self {
        Self {
            rows: inputs.into_iter().map(|i| (i, Vec::new())).collect(),
        }
    }

    pub fn push(&mut self, inputs: Vec<HostTensor>, outputs: Vec<HostTensor>) {
        self.rows.push((inputs, outputs));
    }
}

impl DataSet for InMemoryDataSet {
    fn count(&self) -> usize {
        self.rows.len()
    }

    fn get_row(&self, index: usize) -> Result<Row> {
        self.rows
            .get(index)
            .cloned()
            .ok_or_else(|| Error::msg(format!("row {index} out of range ({})", self.rows.len())))
    }

    fn input_count(&self) -> Result<usize> {
        Ok(self.rows.first().map_or(0, |r| r.0.len()))
    }

    fn output_count(&self) -> Result<usize> {
        Ok(self.rows.first().map_or(0, |r| r.1.len()))
    }
}

/// Rows produced by a closure.
pub struct GeneratedDataSet<F> {
    count: usize,
    generate: F,
}

impl<F> GeneratedDataSet<F>
where
    F: Fn(usize) -> Result<Row> + Send + Sync,
{
    pub fn new(count: usize, generate: F) -> Self {
        Self { count, generate }
    }
}

impl<F> DataSet for GeneratedDataSet<F>
where
    F: Fn(usize) -> Result<Row> + Send + Sync,
{
    fn count(&self) -> usize {
        self.count
    }

    fn get_row(&self, index: usize) -> Result<Row> {
        (self.generate)(index)
    }
}

/// A single row.
#[derive(Debug, Clone)]
pub struct SingleDataSet {
    row: Row,
}

impl SingleDataSet {
    pub fn new(inputs: Vec<HostTensor>, outputs: Vec<HostTensor>) -> Self {
        Self {
            row: (inputs, outputs),
        }
    }

    /// A row with no inputs and no outputs, for input-free graphs.
    pub fn empty() -> Self {
        Self::new(Vec::new(), Vec::new())
    }
}

impl DataSet for SingleDataSet {
    fn count(&self) -> usize {
        1
    }

    fn input_count(&self) -> Result<usize> {
        Ok(self.row.0.len())
    }

    fn output_count(&self) -> Result<usize> {
        Ok(self.row.1.len())
    }

    fn get_row(&self, _index: usize) -> Result<Row> {
        Ok(self.row.clone())
    }
}

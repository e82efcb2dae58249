use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::{Error, HostTensor, Result};

/// Per-row results of one batch for one exported tensor. Can be released
/// early to drop the memory; reading after release fails.
#[derive(Debug, Clone)]
pub struct ResultBuffer {
    label: String,
    rows: Arc<Mutex<Option<Vec<HostTensor>>>>,
}

impl ResultBuffer {
    pub(crate) fn new(label: impl Into<String>, rows: Vec<HostTensor>) -> Self {
        Self {
            label: label.into(),
            rows: Arc::new(Mutex::new(Some(rows))),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// One tensor per batch row.
    pub fn rows(&self) -> Result<Vec<HostTensor>> {
        let rows = self
            .rows
            .lock()
            .map_err(|_| Error::resource(format!("`{}` lock poisoned", self.label)))?;
        rows.clone()
            .ok_or_else(|| Error::resource(format!("`{}` was already released", self.label)))
    }

    pub fn row(&self, index: usize) -> Result<HostTensor> {
        self.rows()?.into_iter().nth(index).ok_or_else(|| {
            Error::msg(format!("`{}` has no row {index}", self.label))
        })
    }

    pub fn release(&self) {
        if let Ok(mut rows) = self.rows.lock() {
            *rows = None;
        }
    }

    pub fn is_released(&self) -> bool {
        self.rows.lock().map(|r| r.is_none()).unwrap_or(true)
    }
}

/// The outcome of one batch.
#[derive(Debug, Clone)]
pub struct BatchHistory {
    /// Submission index of the batch within its run.
    pub batch_index: usize,
    /// One buffer per model output.
    pub results: Vec<ResultBuffer>,
    /// Batch-mean value of every loss, keyed by loss label.
    pub losses: BTreeMap<String, f32>,
    /// Other exported tensors, keyed by label.
    pub intermediates: BTreeMap<String, ResultBuffer>,
}

impl BatchHistory {
    /// Sum of every loss of the batch.
    pub fn loss(&self) -> f32 {
        self.losses.values().sum()
    }

    /// Drop every result buffer of this batch.
    pub fn release(&self) {
        for r in self.results.iter().chain(self.intermediates.values()) {
            r.release();
        }
    }
}

/// Every batch of a run, in completion order.
#[derive(Debug, Clone, Default)]
pub struct TrainingHistory {
    pub batches: Vec<BatchHistory>,
    /// Submission indices of batches whose device work failed.
    pub failed_batches: Vec<usize>,
}

impl TrainingHistory {
    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// The batches sorted by submission index.
    pub fn in_submission_order(&self) -> Vec<&BatchHistory> {
        let mut ordered = self.batches.iter().collect::<Vec<_>>();
        ordered.sort_by_key(|b| b.batch_index);
        ordered
    }

    /// Total loss per batch, in submission order.
    pub fn loss_curve(&self) -> Vec<f32> {
        self.in_submission_order()
            .into_iter()
            .map(|b| b.loss())
            .collect()
    }

    pub fn release(&self) {
        for b in &self.batches {
            b.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn released_buffers_fail_to_read() {
        let buffer = ResultBuffer::new("out", vec![HostTensor::scalar(1.0)]);
        assert_eq!(buffer.row(0).unwrap().data(), &[1.0]);
        buffer.release();
        assert!(buffer.is_released());
        assert!(buffer.rows().unwrap_err().is_resource());
    }

    #[test]
    fn submission_order() {
        let batch = |i| BatchHistory {
            batch_index: i,
            results: Vec::new(),
            losses: BTreeMap::from([("loss".to_string(), i as f32)]),
            intermediates: BTreeMap::new(),
        };
        let history = TrainingHistory {
            batches: vec![batch(1), batch(0), batch(2)],
            failed_batches: Vec::new(),
        };
        assert_eq!(history.loss_curve(), vec![0.0, 1.0, 2.0]);
    }
}

//! Dataset collaborator interface.
//!
//! File-format adapters live outside this crate; `InMemoryDataset` is the
//! reference implementation used by callers that already hold their samples.

use crate::model::{Sample, SampleType};
use std::sync::Arc;

pub type SampleStream = Box<dyn Iterator<Item = Sample> + Send>;

pub trait Dataset: Send + Sync {
    /// A fresh, lazy, finite stream. Each call starts from the beginning.
    fn stream(&self) -> anyhow::Result<SampleStream>;

    fn sample_type(&self) -> SampleType;

    /// Number of samples if known up front.
    fn count(&self) -> Option<usize>;
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryDataset {
    samples: Arc<Vec<Sample>>,
    sample_type: SampleType,
}

impl InMemoryDataset {
    pub fn new(samples: Vec<Sample>) -> Self {
        let sample_type = samples
            .first()
            .map(|s| s.sample_type)
            .unwrap_or_default();
        Self {
            samples: Arc::new(samples),
            sample_type,
        }
    }
}

impl Dataset for InMemoryDataset {
    fn stream(&self) -> anyhow::Result<SampleStream> {
        let samples = self.samples.clone();
        Ok(Box::new((0..samples.len()).map(move |i| samples[i].clone())))
    }

    fn sample_type(&self) -> SampleType {
        self.sample_type
    }

    fn count(&self) -> Option<usize> {
        Some(self.samples.len())
    }
}

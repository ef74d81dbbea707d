//! Bounded history of latency samples.

use std::collections::{vec_deque, VecDeque};

/// A FIFO window holding the most recent `capacity` samples (oldest first).
///
/// Derived statistics are recomputed from the full contents on every call.
#[derive(Clone, Debug)]
pub struct Window {
    capacity: usize,
    samples: VecDeque<f64>,
}

impl Window {
    /// Create an empty window retaining at most `capacity` samples.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity),
        }
    }

    /// Append a sample, evicting the oldest one if the window overflows.
    ///
    /// Returns the evicted sample, if any.
    pub fn push(&mut self, sample: f64) -> Option<f64> {
        self.samples.push_back(sample);
        if self.samples.len() > self.capacity {
            return self.samples.pop_front();
        }
        None
    }

    /// Arithmetic mean of the current contents (0 if empty).
    pub fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    /// Population standard deviation around the freshly computed [Window::mean] (0 if empty).
    pub fn stdev(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let mean = self.mean();
        let sum = self
            .samples
            .iter()
            .map(|sample| (sample - mean) * (sample - mean))
            .sum::<f64>();
        (sum / self.samples.len() as f64).sqrt()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Whether the window holds `capacity` samples.
    pub fn is_full(&self) -> bool {
        self.samples.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Iterate over samples, oldest first.
    pub fn iter(&self) -> vec_deque::Iter<'_, f64> {
        self.samples.iter()
    }
}

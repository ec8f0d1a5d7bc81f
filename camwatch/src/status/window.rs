use std::collections::VecDeque;

/// Success/failure history over the last `capacity` probes.
#[derive(Debug, Clone)]
pub struct UptimeWindow {
    capacity: usize,
    samples: VecDeque<bool>,
    successes: usize,
}

impl UptimeWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity.min(1024)),
            successes: 0,
        }
    }

    pub fn push(&mut self, success: bool) {
        if self.samples.len() == self.capacity {
            self.evict();
        }
        self.samples.push_back(success);
        if success {
            self.successes += 1;
        }
    }

    /// Shrink or grow the window, dropping the oldest samples if needed.
    pub fn resize(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        while self.samples.len() > self.capacity {
            self.evict();
        }
    }

    fn evict(&mut self) {
        if self.samples.pop_front() == Some(true) {
            self.successes -= 1;
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Successes over total samples; 0 when empty.
    pub fn ratio(&self) -> f64 {
        if self.samples.is_empty() {
            0.0
        } else {
            self.successes as f64 / self.samples.len() as f64
        }
    }
}

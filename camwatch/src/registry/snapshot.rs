use std::collections::HashMap;
use std::sync::Arc;

use crate::probe::Prober;

use super::definition::StreamDefinition;

/// A stream together with the prober selected for it at load time.
pub struct RegisteredStream {
    pub definition: StreamDefinition,
    pub prober: Arc<dyn Prober>,
}

impl RegisteredStream {
    pub fn name(&self) -> &str {
        &self.definition.name
    }
}

impl std::fmt::Debug for RegisteredStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredStream")
            .field("definition", &self.definition)
            .finish_non_exhaustive()
    }
}

/// Immutable, fully validated view of the configured fleet.
#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    generation: u64,
    streams: Vec<Arc<RegisteredStream>>,
    index: HashMap<String, usize>,
}

impl RegistrySnapshot {
    pub(super) fn new(generation: u64, streams: Vec<Arc<RegisteredStream>>) -> Self {
        let index = streams
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name().to_string(), i))
            .collect();
        Self {
            generation,
            streams,
            index,
        }
    }

    /// Incremented every time the stream set changes.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Streams in configuration order.
    pub fn streams(&self) -> &[Arc<RegisteredStream>] {
        &self.streams
    }

    pub fn get(&self, name: &str) -> Option<&Arc<RegisteredStream>> {
        self.index.get(name).map(|&i| &self.streams[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

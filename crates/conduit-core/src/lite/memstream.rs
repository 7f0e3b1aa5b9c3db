use crate::{Result, ResultStream, StreamEntry};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory stand-in for the internal streams. Entry ids follow the `<seq>-0`
/// shape stream consumers expect.
#[derive(Debug, Default)]
pub struct MemStreams {
    streams: Mutex<HashMap<String, Vec<StreamEntry>>>,
}

impl MemStreams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self, stream: &str) -> Vec<StreamEntry> {
        lock(&self.streams).get(stream).cloned().unwrap_or_default()
    }

    pub fn total_entries(&self) -> usize {
        lock(&self.streams).values().map(Vec::len).sum()
    }
}

#[async_trait]
impl ResultStream for MemStreams {
    async fn append(&self, stream: &str, entry: StreamEntry) -> Result<String> {
        let mut streams = lock(&self.streams);
        let entries = streams.entry(stream.to_string()).or_default();
        entries.push(entry);
        Ok(format!("{}-0", entries.len()))
    }
}

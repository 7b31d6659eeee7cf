//! Image stream trigger index
//!
//! Reverse index from an image stream key to the builds waiting on it. A
//! build in phase `New` whose image references cannot be resolved yet
//! registers here and is woken when the stream changes.

use std::collections::HashMap;
use std::sync::Mutex;

/// Maps `namespace/name` stream keys to the build keys awaiting them.
#[derive(Debug, Default)]
pub struct TriggerIndex {
    index: Mutex<HashMap<String, Vec<String>>>,
}

impl TriggerIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `build` to be returned the next time any of `streams` is
    /// popped.
    pub fn add(&self, build: &str, streams: &[String]) {
        let mut index = self.index.lock().unwrap();
        for stream in streams {
            index
                .entry(stream.clone())
                .or_default()
                .push(build.to_string());
        }
    }

    /// Drop every registration of `build` under `streams`.
    pub fn remove(&self, build: &str, streams: &[String]) {
        let mut index = self.index.lock().unwrap();
        for stream in streams {
            if let Some(builds) = index.get_mut(stream) {
                builds.retain(|existing| existing != build);
            }
        }
    }

    /// Remove and return every build waiting on `stream`. Popping an unknown
    /// stream yields an empty list.
    pub fn pop(&self, stream: &str) -> Vec<String> {
        self.index
            .lock()
            .unwrap()
            .remove(stream)
            .unwrap_or_default()
    }
}

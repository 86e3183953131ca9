//! Helpers for tests of code built on the coordinator.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;

use crate::{error::ClientError, multiplexer::Observer, result::OperationResult};

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Next(OperationResult),
    Error(ClientError),
    Complete,
}

/// An observer keeping everything it is notified of.
#[derive(Debug, Clone, Default)]
pub struct RecordingObserver {
    events: Arc<Mutex<Vec<Event>>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.lock().clone()
    }

    pub fn results(&self) -> Vec<OperationResult> {
        self.lock()
            .iter()
            .filter_map(|event| match event {
                Event::Next(result) => Some(result.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<ClientError> {
        self.lock()
            .iter()
            .filter_map(|event| match event {
                Event::Error(error) => Some(error.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn completions(&self) -> usize {
        self.lock().iter().filter(|event| **event == Event::Complete).count()
    }

    /// The data of the last result.
    pub fn data(&self) -> Option<Value> {
        self.last().and_then(|result| result.data)
    }

    pub fn last(&self) -> Option<OperationResult> {
        self.results().pop()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Event>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Observer for RecordingObserver {
    fn on_next(&self, result: &OperationResult) {
        self.lock().push(Event::Next(result.clone()));
    }

    fn on_error(&self, error: &ClientError) {
        self.lock().push(Event::Error(error.clone()));
    }

    fn on_complete(&self) {
        self.lock().push(Event::Complete);
    }
}

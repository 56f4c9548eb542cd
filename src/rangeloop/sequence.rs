//! Round-robin composition of observers
//!
//! [`SequenceObserver`] wraps several expensive observers and runs only one of
//! them per pass. The others are not even started. Each `finish` moves the
//! sequence to the next observer, so `k` consecutive passes give each of the
//! `k` observers one full pass.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use crate::rangeloop::observer::{Observer, ObserverResult, Partial};

pub struct SequenceObserver {
    observers: Vec<Arc<dyn Observer>>,
    turn: Mutex<Turn>,
}

#[derive(Debug, Default)]
struct Turn {
    current: usize,
    /// Set by `start`, cleared by `finish`
    in_progress: bool,
}

impl SequenceObserver {
    pub fn new(observers: Vec<Arc<dyn Observer>>) -> Self {
        Self {
            observers,
            turn: Mutex::new(Turn::default()),
        }
    }

    /// Index of the observer that runs in the next or current pass
    pub fn current_index(&self) -> usize {
        self.turn().current
    }

    fn turn(&self) -> MutexGuard<'_, Turn> {
        self.turn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn current(&self) -> ObserverResult<Arc<dyn Observer>> {
        let current = self.turn().current;
        self.observers
            .get(current)
            .cloned()
            .ok_or_else(|| "sequence observer has no observers".into())
    }

    fn advance(turn: &mut Turn, len: usize) {
        if len > 0 {
            turn.current = (turn.current + 1) % len;
        }
    }
}

#[async_trait]
impl Observer for SequenceObserver {
    fn name(&self) -> String {
        match self.current() {
            Ok(observer) => observer.name(),
            Err(_) => "SequenceObserver".to_string(),
        }
    }

    async fn start(
        &self,
        cancel: &CancellationToken,
        pass_start: DateTime<Utc>,
    ) -> ObserverResult<()> {
        {
            let mut turn = self.turn();
            // the previous turn failed before finish; do not retry it forever
            if turn.in_progress {
                Self::advance(&mut turn, self.observers.len());
            }
            turn.in_progress = true;
        }
        let observer = self.current()?;
        debug!("Sequence turn {} runs {}", self.current_index(), observer.name());
        observer.start(cancel, pass_start).await
    }

    async fn fork(&self, cancel: &CancellationToken) -> ObserverResult<Box<dyn Partial>> {
        self.current()?.fork(cancel).await
    }

    async fn join(
        &self,
        cancel: &CancellationToken,
        partial: Box<dyn Partial>,
    ) -> ObserverResult<()> {
        self.current()?.join(cancel, partial).await
    }

    async fn finish(&self, cancel: &CancellationToken) -> ObserverResult<()> {
        let result = self.current()?.finish(cancel).await;
        let mut turn = self.turn();
        turn.in_progress = false;
        Self::advance(&mut turn, self.observers.len());
        result
    }
}

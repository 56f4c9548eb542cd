//! Pass orchestration
//!
//! One pass runs in five phases:
//!
//! 1. `start` every observer, sequentially
//! 2. ask the splitter for one provider per partition
//! 3. `fork` one partial per (partition, started observer)
//! 4. drive every partition on its own task, feeding each batch to that
//!    partition's live partials in observer order
//! 5. after all partitions are done, `join` and `finish` each observer that
//!    has not failed anywhere
//!
//! Observer failures are contained: they only turn that observer's result
//! into a failed [`ObserverDuration`]. A provider error or cancellation aborts
//! the whole pass.

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::rangeloop::config::LoopConfig;
use crate::rangeloop::error::{LoopError, LoopResult};
use crate::rangeloop::keyspace::KeyspaceRange;
use crate::rangeloop::metrics::{CompletedPass, PassMetricsRegistry};
use crate::rangeloop::observer::{Observer, ObserverDuration, Partial};
use crate::rangeloop::provider::{RangeSplitter, SegmentProvider};

/// State of one (partition, observer) pair during a pass
enum PartialSlot {
    /// The observer failed `start`
    Skipped,
    ForkFailed,
    Live {
        partial: Box<dyn Partial>,
        /// Time spent inside `process` for this partition
        duration: Duration,
    },
    ProcessFailed,
}

/// Drives passes of the ranged loop
pub struct Service {
    config: LoopConfig,
    splitter: Arc<dyn RangeSplitter>,
    observers: Vec<Arc<dyn Observer>>,
    metrics: Option<Arc<PassMetricsRegistry>>,
}

impl Service {
    pub fn new(
        config: LoopConfig,
        splitter: Arc<dyn RangeSplitter>,
        observers: Vec<Arc<dyn Observer>>,
    ) -> Self {
        Self {
            config,
            splitter,
            observers,
            metrics: None,
        }
    }

    /// Report every pass to `metrics`
    pub fn with_metrics(mut self, metrics: Arc<PassMetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    /// Run passes every `interval` until `cancel` fires.
    ///
    /// The first pass starts immediately. A failed pass is logged and retried
    /// on the next tick. A zero interval disables the driver and returns at
    /// once.
    pub async fn run(&self, cancel: &CancellationToken) -> LoopResult<()> {
        if !self.config.is_periodic() {
            info!("Ranged loop interval is zero, periodic passes disabled");
            return Ok(());
        }

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Ranged loop stopped");
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }

            match self.run_once(cancel).await {
                Ok(_) => {}
                Err(e) if e.is_cancelled() && cancel.is_cancelled() => {
                    info!("Ranged loop stopped during a pass");
                    return Ok(());
                }
                Err(e) => error!("Ranged loop pass failed, retrying next interval: {}", e),
            }
        }
    }

    /// Run a single pass over every segment.
    ///
    /// Returns one [`ObserverDuration`] per observer, in registration order.
    /// Fails only on infrastructure errors and cancellation.
    pub async fn run_once(&self, cancel: &CancellationToken) -> LoopResult<Vec<ObserverDuration>> {
        let pass_start = Utc::now();
        let timer = Instant::now();

        let result = self.run_pass(cancel, pass_start).await;
        let elapsed = timer.elapsed();

        match &result {
            Ok(durations) => {
                info!(
                    "Ranged loop pass finished in {:?}: {}",
                    elapsed,
                    durations
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join(", ")
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_pass(CompletedPass {
                        started_at: pass_start,
                        duration: elapsed,
                        observers: durations.clone(),
                    });
                }
            }
            Err(e) => {
                if e.is_cancelled() {
                    warn!("Ranged loop pass cancelled after {:?}", elapsed);
                } else {
                    error!("Ranged loop pass aborted after {:?}: {}", elapsed, e);
                }
                if let Some(metrics) = &self.metrics {
                    metrics.record_failure();
                }
            }
        }

        result
    }

    async fn run_pass(
        &self,
        cancel: &CancellationToken,
        pass_start: DateTime<Utc>,
    ) -> LoopResult<Vec<ObserverDuration>> {
        let started = self.start_observers(cancel, pass_start).await;
        let names: Arc<Vec<String>> = Arc::new(self.observers.iter().map(|o| o.name()).collect());

        if cancel.is_cancelled() {
            return Err(LoopError::Cancelled);
        }

        let parallelism = self.config.effective_parallelism();
        let batch_size = self.config.effective_batch_size();
        let providers = self
            .splitter
            .create_ranges(cancel, parallelism, batch_size)
            .await?;
        debug!(
            "Pass split into {} partitions (parallelism {}, batch size {})",
            providers.len(),
            parallelism,
            batch_size
        );

        let mut partitions = Vec::with_capacity(providers.len());
        for (partition, provider) in providers.into_iter().enumerate() {
            let slots = self.fork_partials(cancel, partition, &started, &names).await;
            partitions.push((provider, slots));
        }

        let arena = self
            .process_partitions(cancel, parallelism, partitions, Arc::clone(&names))
            .await?;

        if cancel.is_cancelled() {
            return Err(LoopError::Cancelled);
        }

        Ok(self.join_and_finish(cancel, &started, &names, arena).await)
    }

    async fn start_observers(
        &self,
        cancel: &CancellationToken,
        pass_start: DateTime<Utc>,
    ) -> Vec<bool> {
        let mut started = Vec::with_capacity(self.observers.len());
        for observer in &self.observers {
            match observer.start(cancel, pass_start).await {
                Ok(()) => started.push(true),
                Err(e) => {
                    error!("Observer {} failed to start: {}", observer.name(), e);
                    started.push(false);
                }
            }
        }
        started
    }

    async fn fork_partials(
        &self,
        cancel: &CancellationToken,
        partition: usize,
        started: &[bool],
        names: &[String],
    ) -> Vec<PartialSlot> {
        let mut slots = Vec::with_capacity(self.observers.len());
        for (index, observer) in self.observers.iter().enumerate() {
            if !started[index] {
                slots.push(PartialSlot::Skipped);
                continue;
            }
            match observer.fork(cancel).await {
                Ok(partial) => slots.push(PartialSlot::Live {
                    partial,
                    duration: Duration::ZERO,
                }),
                Err(e) => {
                    error!(
                        "Observer {} failed to fork partition {}: {}",
                        names[index], partition, e
                    );
                    slots.push(PartialSlot::ForkFailed);
                }
            }
        }
        slots
    }

    /// Drive all partitions to completion, at most `parallelism` at a time.
    /// Returns the partial slots indexed by partition.
    async fn process_partitions(
        &self,
        cancel: &CancellationToken,
        parallelism: usize,
        partitions: Vec<(Box<dyn SegmentProvider>, Vec<PartialSlot>)>,
        names: Arc<Vec<String>>,
    ) -> LoopResult<Vec<Vec<PartialSlot>>> {
        let semaphore = Arc::new(Semaphore::new(parallelism));
        let ranges: Vec<KeyspaceRange> = partitions.iter().map(|(p, _)| p.range()).collect();
        let mut arena: Vec<Option<Vec<PartialSlot>>> =
            (0..partitions.len()).map(|_| None).collect();

        let mut join_set = JoinSet::new();
        for (partition, (provider, slots)) in partitions.into_iter().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            let names = Arc::clone(&names);

            join_set.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => {
                        process_partition(partition, provider, slots, &cancel, &names).await
                    }
                    Err(_) => Err(LoopError::ProviderClosed {
                        reason: "partition pool closed".to_string(),
                    }),
                };
                (partition, result)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((partition, Ok(slots))) => arena[partition] = Some(slots),
                Ok((partition, Err(e))) => {
                    join_set.abort_all();
                    return Err(e.in_partition(partition, ranges[partition]));
                }
                Err(e) => {
                    join_set.abort_all();
                    return Err(e.into());
                }
            }
        }

        Ok(arena.into_iter().map(Option::unwrap_or_default).collect())
    }

    async fn join_and_finish(
        &self,
        cancel: &CancellationToken,
        started: &[bool],
        names: &[String],
        mut arena: Vec<Vec<PartialSlot>>,
    ) -> Vec<ObserverDuration> {
        let mut durations = Vec::with_capacity(self.observers.len());

        for (index, observer) in self.observers.iter().enumerate() {
            let name = &names[index];
            if !started[index] {
                durations.push(ObserverDuration::failed(name.as_str()));
                continue;
            }

            let mut partials = Vec::new();
            let mut processing = Duration::ZERO;
            let mut failed_partitions = 0;
            for slots in arena.iter_mut() {
                match std::mem::replace(&mut slots[index], PartialSlot::Skipped) {
                    PartialSlot::Live { partial, duration } => {
                        partials.push(partial);
                        processing += duration;
                    }
                    PartialSlot::ForkFailed | PartialSlot::ProcessFailed => failed_partitions += 1,
                    PartialSlot::Skipped => {}
                }
            }

            if failed_partitions > 0 {
                warn!(
                    "Observer {} failed in {} partition(s), skipping join and finish",
                    name, failed_partitions
                );
                durations.push(ObserverDuration::failed(name.as_str()));
                continue;
            }

            let mut joined = true;
            for partial in partials {
                if let Err(e) = observer.join(cancel, partial).await {
                    error!("Observer {} failed to join: {}", name, e);
                    joined = false;
                    break;
                }
            }
            if !joined {
                durations.push(ObserverDuration::failed(name.as_str()));
                continue;
            }

            match observer.finish(cancel).await {
                Ok(()) => durations.push(ObserverDuration::succeeded(name.as_str(), processing)),
                Err(e) => {
                    error!("Observer {} failed to finish: {}", name, e);
                    durations.push(ObserverDuration::failed(name.as_str()));
                }
            }
        }

        durations
    }
}

/// Feed every batch of one partition to its live partials
async fn process_partition(
    partition: usize,
    mut provider: Box<dyn SegmentProvider>,
    mut slots: Vec<PartialSlot>,
    cancel: &CancellationToken,
    names: &[String],
) -> LoopResult<Vec<PartialSlot>> {
    debug!("Partition {} started on {}", partition, provider.range());
    let mut segments = 0usize;

    loop {
        if cancel.is_cancelled() {
            return Err(LoopError::Cancelled);
        }
        let batch = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LoopError::Cancelled),
            batch = provider.next_batch(cancel) => batch?,
        };
        let Some(batch) = batch else {
            break;
        };
        segments += batch.len();

        for (index, slot) in slots.iter_mut().enumerate() {
            let failure = match slot {
                PartialSlot::Live { partial, duration } => {
                    let timer = Instant::now();
                    let result = partial.process(cancel, &batch).await;
                    *duration += timer.elapsed();
                    result.err()
                }
                _ => None,
            };
            if let Some(e) = failure {
                error!(
                    "Observer {} failed to process partition {}: {}",
                    names[index], partition, e
                );
                *slot = PartialSlot::ProcessFailed;
            }
        }
    }

    debug!("Partition {} finished after {} segments", partition, segments);
    Ok(slots)
}

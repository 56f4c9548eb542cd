use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::rangeloop::observer::{Observer, ObserverResult, Partial, downcast_partial};
use crate::rangeloop::segment::Segment;

/// Counts every segment of a pass through fork and join
#[derive(Debug, Default)]
pub struct CountObserver {
    num_segments: AtomicUsize,
}

impl CountObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Segments counted in the last pass
    pub fn num_segments(&self) -> usize {
        self.num_segments.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct CountPartial {
    num_segments: usize,
}

#[async_trait]
impl Partial for CountPartial {
    async fn process(
        &mut self,
        _cancel: &CancellationToken,
        segments: &[Segment],
    ) -> ObserverResult<()> {
        self.num_segments += segments.len();
        Ok(())
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

#[async_trait]
impl Observer for CountObserver {
    async fn start(
        &self,
        _cancel: &CancellationToken,
        _pass_start: DateTime<Utc>,
    ) -> ObserverResult<()> {
        self.num_segments.store(0, Ordering::SeqCst);
        Ok(())
    }

    async fn fork(&self, _cancel: &CancellationToken) -> ObserverResult<Box<dyn Partial>> {
        Ok(Box::new(CountPartial::default()))
    }

    async fn join(
        &self,
        _cancel: &CancellationToken,
        partial: Box<dyn Partial>,
    ) -> ObserverResult<()> {
        let partial: CountPartial = downcast_partial(partial)?;
        self.num_segments.fetch_add(partial.num_segments, Ordering::SeqCst);
        Ok(())
    }

    async fn finish(&self, _cancel: &CancellationToken) -> ObserverResult<()> {
        Ok(())
    }
}

type StartHook = Arc<dyn Fn(DateTime<Utc>) -> ObserverResult<()> + Send + Sync>;
type ProcessHook = Arc<dyn Fn(&[Segment]) -> ObserverResult<()> + Send + Sync>;
type Hook = Arc<dyn Fn() -> ObserverResult<()> + Send + Sync>;

/// Observer built from optional closures, one per lifecycle step.
///
/// Missing hooks succeed. Partials share the `on_process` hook, so it may be
/// called from several partition tasks at once. `with_process_delay` makes
/// every `process` call take at least that long.
///
/// ```rust
/// use rangeloop::testkit::CallbackObserver;
///
/// let observer = CallbackObserver::new()
///     .named("fails-on-join")
///     .on_join(|| Err("join failed".into()));
/// ```
#[derive(Clone, Default)]
pub struct CallbackObserver {
    name: Option<String>,
    on_start: Option<StartHook>,
    on_fork: Option<Hook>,
    on_process: Option<ProcessHook>,
    on_join: Option<Hook>,
    on_finish: Option<Hook>,
    process_delay: Option<Duration>,
}

impl CallbackObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn on_start(
        mut self,
        hook: impl Fn(DateTime<Utc>) -> ObserverResult<()> + Send + Sync + 'static,
    ) -> Self {
        self.on_start = Some(Arc::new(hook));
        self
    }

    pub fn on_fork(
        mut self,
        hook: impl Fn() -> ObserverResult<()> + Send + Sync + 'static,
    ) -> Self {
        self.on_fork = Some(Arc::new(hook));
        self
    }

    pub fn on_process(
        mut self,
        hook: impl Fn(&[Segment]) -> ObserverResult<()> + Send + Sync + 'static,
    ) -> Self {
        self.on_process = Some(Arc::new(hook));
        self
    }

    pub fn on_join(
        mut self,
        hook: impl Fn() -> ObserverResult<()> + Send + Sync + 'static,
    ) -> Self {
        self.on_join = Some(Arc::new(hook));
        self
    }

    pub fn on_finish(
        mut self,
        hook: impl Fn() -> ObserverResult<()> + Send + Sync + 'static,
    ) -> Self {
        self.on_finish = Some(Arc::new(hook));
        self
    }

    pub fn with_process_delay(mut self, delay: Duration) -> Self {
        self.process_delay = Some(delay);
        self
    }
}

fn call(hook: &Option<Hook>) -> ObserverResult<()> {
    match hook {
        Some(hook) => hook(),
        None => Ok(()),
    }
}

#[async_trait]
impl Observer for CallbackObserver {
    fn name(&self) -> String {
        self.name.clone().unwrap_or_else(|| "CallbackObserver".to_string())
    }

    async fn start(
        &self,
        _cancel: &CancellationToken,
        pass_start: DateTime<Utc>,
    ) -> ObserverResult<()> {
        match &self.on_start {
            Some(hook) => hook(pass_start),
            None => Ok(()),
        }
    }

    async fn fork(&self, _cancel: &CancellationToken) -> ObserverResult<Box<dyn Partial>> {
        call(&self.on_fork)?;
        Ok(Box::new(CallbackPartial {
            on_process: self.on_process.clone(),
            delay: self.process_delay,
        }))
    }

    async fn join(
        &self,
        _cancel: &CancellationToken,
        _partial: Box<dyn Partial>,
    ) -> ObserverResult<()> {
        call(&self.on_join)
    }

    async fn finish(&self, _cancel: &CancellationToken) -> ObserverResult<()> {
        call(&self.on_finish)
    }
}

struct CallbackPartial {
    on_process: Option<ProcessHook>,
    delay: Option<Duration>,
}

#[async_trait]
impl Partial for CallbackPartial {
    async fn process(
        &mut self,
        _cancel: &CancellationToken,
        segments: &[Segment],
    ) -> ObserverResult<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match &self.on_process {
            Some(hook) => hook(segments),
            None => Ok(()),
        }
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

/// Sleeps `per_segment` for every processed segment
#[derive(Debug, Clone)]
pub struct SleepObserver {
    per_segment: Duration,
}

impl SleepObserver {
    pub fn new(per_segment: Duration) -> Self {
        Self { per_segment }
    }
}

struct SleepPartial {
    per_segment: Duration,
}

#[async_trait]
impl Partial for SleepPartial {
    async fn process(
        &mut self,
        cancel: &CancellationToken,
        segments: &[Segment],
    ) -> ObserverResult<()> {
        let total = self.per_segment.saturating_mul(segments.len() as u32);
        tokio::select! {
            _ = cancel.cancelled() => Err("sleep interrupted by cancellation".into()),
            _ = tokio::time::sleep(total) => Ok(()),
        }
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

#[async_trait]
impl Observer for SleepObserver {
    async fn start(
        &self,
        _cancel: &CancellationToken,
        _pass_start: DateTime<Utc>,
    ) -> ObserverResult<()> {
        Ok(())
    }

    async fn fork(&self, _cancel: &CancellationToken) -> ObserverResult<Box<dyn Partial>> {
        Ok(Box::new(SleepPartial {
            per_segment: self.per_segment,
        }))
    }

    async fn join(
        &self,
        _cancel: &CancellationToken,
        _partial: Box<dyn Partial>,
    ) -> ObserverResult<()> {
        Ok(())
    }

    async fn finish(&self, _cancel: &CancellationToken) -> ObserverResult<()> {
        Ok(())
    }
}

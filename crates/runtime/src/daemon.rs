//! The control loop: periodic variety ticks, injected gaps, bounded
//! acquisition dispatch, and orderly shutdown.
//!
//! The loop never surfaces a failure to callers; it logs, raises an
//! advisory flag after repeated failures, and keeps ticking.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use variety::CapabilityDescriptor;

use crate::acquisition::{AcquireOptions, AcquisitionPipeline};
use crate::events::{Event, EventBus};
use crate::manager::ServerManager;
use crate::settings::Settings;
use crate::supervisor::VarietyMonitor;

/// Failed or timed-out acquisitions within the rolling window that raise
/// the advisory flag.
const ADVISORY_FAILURES: u32 = 3;

/// Rolling window over which acquisition failures are counted.
const ADVISORY_WINDOW: Duration = Duration::from_secs(60);

/// Bounded acquisition dispatch shared between the daemon and the
/// supervisor facade.
pub(crate) struct Dispatcher {
    pipeline: Arc<AcquisitionPipeline>,
    permits: Arc<Semaphore>,
    queue: Mutex<VecDeque<Vec<CapabilityDescriptor>>>,
    queue_depth: usize,
    acquire_timeout: Duration,
    advisory: Arc<AtomicBool>,
    failures: Mutex<VecDeque<Instant>>,
}

impl Dispatcher {
    pub(crate) fn new(
        pipeline: Arc<AcquisitionPipeline>,
        settings: &Settings,
        advisory: Arc<AtomicBool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            pipeline,
            permits: Arc::new(Semaphore::new(settings.max_concurrent_acquisitions)),
            queue: Mutex::new(VecDeque::new()),
            queue_depth: settings.acquisition_queue_depth,
            acquire_timeout: settings.acquire_timeout,
            advisory,
            failures: Mutex::new(VecDeque::new()),
        })
    }

    /// Run an acquisition now if a permit is free, otherwise enqueue.
    /// A full queue drops the request with a warning, not an error.
    pub(crate) fn submit(self: &Arc<Self>, descriptors: Vec<CapabilityDescriptor>) {
        match self.permits.clone().try_acquire_owned() {
            Ok(permit) => {
                let dispatcher = Arc::clone(self);
                tokio::spawn(async move {
                    dispatcher.work(descriptors).await;
                    drop(permit);
                });
            }
            Err(_) => {
                let mut queue = self.queue.lock();
                if queue.len() < self.queue_depth {
                    queue.push_back(descriptors);
                } else {
                    warn!("acquisition queue full, dropping request");
                }
            }
        }
    }

    async fn work(self: &Arc<Self>, descriptors: Vec<CapabilityDescriptor>) {
        let mut next = Some(descriptors);
        while let Some(descriptors) = next.take() {
            // The pipeline runs detached so an expired deadline cannot
            // abandon it mid-stage; only the wait is bounded.
            let pipeline = self.pipeline.clone();
            let handle =
                tokio::spawn(
                    async move { pipeline.acquire(descriptors, AcquireOptions::default()).await },
                );
            match tokio::time::timeout(self.acquire_timeout, handle).await {
                Ok(Ok(record)) if record.outcome.is_ok() => self.note_outcome(false),
                Ok(Ok(_)) => self.note_outcome(true),
                Ok(Err(e)) => {
                    warn!("acquisition task failed: {e}");
                    self.note_outcome(true);
                }
                Err(_) => {
                    warn!("acquisition exceeded its deadline; letting it finish detached");
                    self.note_outcome(true);
                }
            }
            next = self.queue.lock().pop_front();
        }
    }

    /// Record one acquisition outcome against the rolling failure window.
    /// The advisory flag tracks whether the window currently holds at
    /// least [`ADVISORY_FAILURES`] failures; a success does not erase
    /// failures still inside the window.
    fn note_outcome(&self, failed: bool) {
        let raised = {
            let mut failures = self.failures.lock();
            advisory_raised(&mut failures, failed, Instant::now())
        };
        self.advisory.store(raised, Ordering::Relaxed);
    }

    /// Wait until every permit is free again, i.e. no acquisition runs.
    async fn drain(&self, permits: usize) {
        let _ = self.permits.acquire_many(permits as u32).await;
    }
}

/// The periodic monitoring loop.
pub struct Daemon {
    monitor: Arc<VarietyMonitor>,
    manager: Arc<ServerManager>,
    dispatcher: Arc<Dispatcher>,
    bus: EventBus,
    settings: Settings,
    inject_rx: mpsc::Receiver<Vec<CapabilityDescriptor>>,
}

impl Daemon {
    pub(crate) fn new(
        monitor: Arc<VarietyMonitor>,
        manager: Arc<ServerManager>,
        dispatcher: Arc<Dispatcher>,
        bus: EventBus,
        settings: Settings,
        inject_rx: mpsc::Receiver<Vec<CapabilityDescriptor>>,
    ) -> Self {
        Self {
            monitor,
            manager,
            dispatcher,
            bus,
            settings,
            inject_rx,
        }
    }

    /// Run until `shutdown` fires, then wind down: stop ticking, give
    /// in-flight acquisitions a grace period, and stop every tool server.
    pub async fn run(self, shutdown: CancellationToken) {
        let Daemon {
            monitor,
            manager,
            dispatcher,
            bus,
            settings,
            mut inject_rx,
        } = self;

        let mut tick = tokio::time::interval(settings.tick_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tick.tick().await;

        info!(
            interval_ms = settings.tick_interval.as_millis() as u64,
            threshold = settings.variety_threshold,
            "control loop running"
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => on_tick(&monitor, &bus, &dispatcher, &settings),
                Some(descriptors) = inject_rx.recv() => on_inject(&dispatcher, descriptors),
            }
        }

        info!("control loop shutting down");
        inject_rx.close();
        let drain = dispatcher.drain(settings.max_concurrent_acquisitions);
        if tokio::time::timeout(settings.shutdown_grace, drain)
            .await
            .is_err()
        {
            warn!("in-flight acquisitions outlived the shutdown grace");
        }
        manager.stop_all().await;
    }
}

fn on_tick(
    monitor: &VarietyMonitor,
    bus: &EventBus,
    dispatcher: &Arc<Dispatcher>,
    settings: &Settings,
) {
    let report = monitor.report();
    debug!(
        ratio = report.ratio,
        gap = report.absolute_gap,
        "variety tick"
    );
    bus.publish(Event::GapReport {
        report: report.clone(),
    });

    if report.ratio >= settings.variety_threshold {
        // Healthy: the tick records metrics and nothing else.
        return;
    }

    let descriptors = variety::project(&report.critical_areas);
    if descriptors.is_empty() {
        return;
    }
    info!(
        ratio = report.ratio,
        areas = ?report.critical_areas,
        "variety gap detected, dispatching acquisition"
    );
    dispatcher.submit(descriptors);
}

/// An injected gap skips the calculator entirely.
fn on_inject(dispatcher: &Arc<Dispatcher>, descriptors: Vec<CapabilityDescriptor>) {
    if descriptors.is_empty() {
        return;
    }
    let kinds: Vec<&str> = descriptors.iter().map(|d| d.kind.as_str()).collect();
    info!(?kinds, "gap injected");
    dispatcher.submit(descriptors);
}

/// Record an outcome and report whether failures within the rolling
/// window reach the advisory threshold, pruning expired entries.
fn advisory_raised(failures: &mut VecDeque<Instant>, failed: bool, now: Instant) -> bool {
    if failed {
        failures.push_back(now);
    }
    while let Some(front) = failures.front() {
        if now.duration_since(*front) > ADVISORY_WINDOW {
            failures.pop_front();
        } else {
            break;
        }
    }
    failures.len() as u32 >= ADVISORY_FAILURES
}

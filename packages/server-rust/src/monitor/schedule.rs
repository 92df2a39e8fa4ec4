//! Periodic discovery scheduling.
//!
//! A [`Schedule`] owns one spawned task that runs a [`ScheduledJob`] on
//! every tick of an interval and whenever it is triggered by hand. Periodic
//! discovery is the job the monitor schedules.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::discovery::{DiscoverOptions, Discoverer};

/// Why a job round is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Requested through [`Schedule::trigger`].
    Manual,
    /// The interval elapsed.
    Tick,
}

/// Work driven by a [`Schedule`].
#[async_trait]
pub trait ScheduledJob: Send + 'static {
    async fn run(&mut self, trigger: Trigger);

    /// Runs once after the schedule stops.
    async fn finish(&mut self) {}
}

/// Handle to a running schedule. Dropping it stops the schedule.
pub struct Schedule {
    triggers: mpsc::Sender<Trigger>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Schedule {
    /// Spawns `job`, first ticking one `every` from now. `every` must be
    /// non-zero.
    pub fn spawn<J: ScheduledJob>(mut job: J, every: Duration) -> Self {
        let (triggers, mut manual) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let stopped = cancel.clone();

        let task = tokio::spawn(async move {
            let mut ticks = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    () = stopped.cancelled() => break,
                    trigger = manual.recv() => match trigger {
                        Some(trigger) => job.run(trigger).await,
                        None => break,
                    },
                    _ = ticks.tick() => job.run(Trigger::Tick).await,
                }
            }
            job.finish().await;
        });

        Self {
            triggers,
            cancel,
            task: Some(task),
        }
    }

    /// Asks for an extra round now.
    ///
    /// # Errors
    ///
    /// Returns an error if the schedule has stopped or already has rounds
    /// queued.
    pub fn trigger(&self) -> anyhow::Result<()> {
        self.triggers
            .try_send(Trigger::Manual)
            .map_err(|e| anyhow::anyhow!("schedule not accepting triggers: {e}"))
    }

    /// Stops the schedule and waits for the job to finish its current round.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for Schedule {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Opens a plain discovery window on every round.
///
/// Windows are detached: stopping the schedule never cuts short a window
/// already open.
pub(crate) struct PeriodicDiscovery {
    discoverer: Discoverer,
    window: Duration,
    rounds: u64,
}

impl PeriodicDiscovery {
    pub fn new(discoverer: Discoverer, window: Duration) -> Self {
        Self {
            discoverer,
            window,
            rounds: 0,
        }
    }
}

#[async_trait]
impl ScheduledJob for PeriodicDiscovery {
    async fn run(&mut self, trigger: Trigger) {
        self.rounds += 1;
        debug!(round = self.rounds, ?trigger, "periodic discovery");
        drop(
            self.discoverer
                .discover(self.window, DiscoverOptions::default()),
        );
    }

    async fn finish(&mut self) {
        debug!(rounds = self.rounds, "periodic discovery stopped");
    }
}

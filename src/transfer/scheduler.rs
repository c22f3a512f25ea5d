use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded};

use super::attempt::{AttemptCtx, Outcome};
use super::item::TransferItem;
use super::watchdog::run_with_deadline;
use crate::{AttemptError, SessionError};

/// Counts attempts currently in flight and remembers the high-water mark.
#[derive(Debug, Default)]
pub struct InFlightGauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl InFlightGauge {
    pub fn enter(&self) -> InFlightGuard<'_> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        InFlightGuard { gauge: self }
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

pub struct InFlightGuard<'a> {
    gauge: &'a InFlightGauge,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.gauge.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Outcomes of one round, in batch order.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub outcomes: Vec<(TransferItem, Outcome)>,
    pub peak_in_flight: usize,
    pub bytes: u64,
}

/// Runs batches with at most `limit` attempts in flight.
pub(crate) struct Scheduler {
    limit: usize,
    deadline: Duration,
    ctx: Arc<AttemptCtx>,
    downloaded: Arc<AtomicUsize>,
}

impl Scheduler {
    pub(crate) fn new(
        limit: usize,
        deadline: Duration,
        ctx: Arc<AttemptCtx>,
        downloaded: Arc<AtomicUsize>,
    ) -> Result<Self, SessionError> {
        if limit == 0 {
            return Err(SessionError::Config("download concurrency must be at least 1".to_string()));
        }
        Ok(Self { limit, deadline, ctx, downloaded })
    }

    /// Blocks until every item of `batch` has exactly one outcome.
    pub(crate) fn run(&self, batch: Vec<TransferItem>) -> BatchReport {
        let total = batch.len();
        if total == 0 {
            return BatchReport::default();
        }
        let workers = std::cmp::min(self.limit, total);
        // queue holds the whole batch, so the producer never blocks
        let (item_tx, item_rx) = bounded::<(usize, TransferItem)>(total);
        let (outcome_tx, outcome_rx) = unbounded::<(usize, Outcome)>();
        for (idx, item) in batch.iter().cloned().enumerate() {
            let _ = item_tx.send((idx, item));
        }
        drop(item_tx);

        let gauge = Arc::new(InFlightGauge::default());
        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let item_rx = item_rx.clone();
            let outcome_tx = outcome_tx.clone();
            let ctx = self.ctx.clone();
            let gauge = gauge.clone();
            let downloaded = self.downloaded.clone();
            let deadline = self.deadline;
            let spawned = std::thread::Builder::new()
                .name(format!("djt-worker-{}", worker_id))
                .spawn(move || {
                    while let Ok((idx, item)) = item_rx.recv() {
                        tracing::debug!("[scheduler] worker_id={} picked {}", worker_id, item.id());
                        let outcome = {
                            let _in_flight = gauge.enter();
                            catch_unwind(AssertUnwindSafe(|| {
                                run_with_deadline(ctx.clone(), item.clone(), deadline)
                            }))
                            .unwrap_or_else(|payload| {
                                Outcome::Failed(AttemptError::Panicked(crate::util::panic_message(
                                    payload.as_ref(),
                                )))
                            })
                        };
                        if outcome.is_success() {
                            downloaded.fetch_add(1, Ordering::SeqCst);
                        }
                        if outcome_tx.send((idx, outcome)).is_err() {
                            break;
                        }
                    }
                });
            match spawned {
                Ok(h) => handles.push(h),
                Err(e) => tracing::warn!("[scheduler] could not spawn worker {}: {}", worker_id, e),
            }
        }
        drop(outcome_tx);
        drop(item_rx);

        let mut slots: Vec<Option<Outcome>> = vec![None; total];
        for (idx, outcome) in outcome_rx.iter() {
            if let Some(slot) = slots.get_mut(idx) {
                *slot = Some(outcome);
            }
        }
        for h in handles {
            let _ = h.join();
        }

        let mut bytes = 0u64;
        let outcomes = batch
            .into_iter()
            .zip(slots)
            .map(|(item, slot)| {
                // no worker reported this item (all workers failed to spawn or died)
                let outcome = slot.unwrap_or_else(|| {
                    Outcome::Failed(AttemptError::Panicked("worker lost the item".to_string()))
                });
                if let Outcome::Success { bytes: n } = &outcome {
                    bytes += n;
                }
                (item, outcome)
            })
            .collect();
        BatchReport { outcomes, peak_in_flight: gauge.peak(), bytes }
    }
}

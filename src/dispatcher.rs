use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::DispatchConfig;
use crate::launcher::{Launcher, ThreadLauncher, Unit};
use crate::outcome::{AggregateOutcome, DispatchError};
use crate::policy::{available_processing_units, resolve_limit, ConcurrencyPolicy};
use crate::trace::DispatchTrace;
use crate::work::{panic_message, Failure, WorkItem};

/// A started item occupying a slot.
struct RunHandle {
    index: usize,
    /// Set by the item's own execution unit, under the table lock.
    finished: bool,
    unit: JoinHandle<Result<(), Failure>>,
}

impl RunHandle {
    fn join(self) -> (usize, Result<(), Failure>) {
        let index = self.index;
        let result = match self.unit.join() {
            Ok(result) => result,
            Err(payload) => Err(Failure::new(format!(
                "work item {index} panicked: {}",
                panic_message(payload.as_ref())
            ))),
        };
        (index, result)
    }
}

struct SlotTable {
    slots: Vec<Option<RunHandle>>,
    started: usize,
}

impl SlotTable {
    fn with_slots(limit: usize) -> Self {
        Self {
            slots: (0..limit).map(|_| None).collect(),
            started: 0,
        }
    }

    /// First slot that is empty or whose occupant has finished.
    fn free_slot(&self) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.as_ref().map_or(true, |h| h.finished))
    }
}

struct Shared {
    table: Mutex<SlotTable>,
    freed: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SlotTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Marks the unit's slot finished and wakes the dispatch loop on drop, so a
/// panicking item still frees its slot.
struct FinishSignal {
    shared: Arc<Shared>,
    slot: usize,
    index: usize,
}

impl Drop for FinishSignal {
    fn drop(&mut self) {
        {
            let mut table = self.shared.lock();
            if let Some(Some(handle)) = table.slots.get_mut(self.slot) {
                if handle.index == self.index {
                    handle.finished = true;
                }
            }
        }
        self.shared.freed.notify_all();
    }
}

/// Result of one dispatch run.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DispatchReport {
    pub items: usize,
    pub effective_limit: usize,
    pub outcome: AggregateOutcome,
}

impl DispatchReport {
    pub fn into_result(self) -> Result<(), DispatchError> {
        self.outcome.into_result()
    }
}

/// Runs a batch of work items with at most `L` of them alive at once.
pub struct Dispatcher {
    policy: ConcurrencyPolicy,
    poll_interval: Duration,
    processing_units: Option<usize>,
    launcher: Box<dyn Launcher>,
    trace: Option<Arc<DispatchTrace>>,
}

impl Dispatcher {
    pub fn new(config: &DispatchConfig) -> Self {
        Self {
            policy: config.policy(),
            poll_interval: config.poll_interval(),
            processing_units: None,
            launcher: Box::new(ThreadLauncher::new()),
            trace: None,
        }
    }

    pub fn with_launcher(mut self, launcher: impl Launcher + 'static) -> Self {
        self.launcher = Box::new(launcher);
        self
    }

    pub fn with_trace(mut self, trace: Arc<DispatchTrace>) -> Self {
        self.trace = Some(trace);
        self
    }

    /// Pin the processing-unit count instead of asking the host.
    pub fn with_processing_units(mut self, units: usize) -> Self {
        self.processing_units = Some(units);
        self
    }

    pub fn effective_limit(&self, item_count: usize) -> usize {
        let units = self
            .processing_units
            .unwrap_or_else(available_processing_units);
        resolve_limit(&self.policy, units, item_count)
    }

    /// Start every item, wait for all of them and reduce their results.
    ///
    /// Items are started in submission order, one per free slot. Failures,
    /// panics and launch errors are captured per item and only reported once
    /// every started item has finished.
    pub fn dispatch(&self, items: Vec<Box<dyn WorkItem>>) -> DispatchReport {
        let total = items.len();
        let limit = self.effective_limit(total);

        if total == 0 {
            debug!("no work items to dispatch");
            return DispatchReport {
                items: 0,
                effective_limit: limit,
                outcome: AggregateOutcome::Success,
            };
        }

        info!(items = total, limit, "dispatching work items");
        if let Some(tr) = &self.trace {
            tr.dispatch_started(total, limit);
        }

        // More slots than items could never be filled.
        let shared = Arc::new(Shared {
            table: Mutex::new(SlotTable::with_slots(limit.min(total))),
            freed: Condvar::new(),
        });
        let mut results: Vec<Result<(), Failure>> = vec![Ok(()); total];
        let mut pending = items.into_iter().enumerate();

        loop {
            let mut table = shared.lock();
            if table.started >= total {
                break;
            }

            let Some(slot) = table.free_slot() else {
                // Spurious wake-ups and timeouts both just mean "scan again".
                let _ = shared
                    .freed
                    .wait_timeout(table, self.poll_interval)
                    .unwrap_or_else(PoisonError::into_inner);
                continue;
            };

            let Some((index, item)) = pending.next() else {
                break;
            };

            let previous = table.slots[slot].take();
            match self.launch(&shared, slot, index, item) {
                Ok(unit) => {
                    table.slots[slot] = Some(RunHandle {
                        index,
                        finished: false,
                        unit,
                    });
                }
                Err(failure) => results[index] = Err(failure),
            }
            table.started += 1;
            drop(table);

            if let Some(prev) = previous {
                let (i, result) = prev.join();
                results[i] = result;
            }
        }

        // Completion barrier: the last occupant of each slot is the only one
        // not joined yet.
        let occupants: Vec<RunHandle> = shared
            .lock()
            .slots
            .iter_mut()
            .filter_map(Option::take)
            .collect();
        for handle in occupants {
            let (i, result) = handle.join();
            results[i] = result;
        }

        let outcome = AggregateOutcome::from_results(results);
        if let Some(tr) = &self.trace {
            tr.dispatch_finished(outcome.is_success());
        }
        info!(
            items = total,
            failed = outcome.failure_count(),
            "dispatch finished"
        );

        DispatchReport {
            items: total,
            effective_limit: limit,
            outcome,
        }
    }

    fn launch(
        &self,
        shared: &Arc<Shared>,
        slot: usize,
        index: usize,
        item: Box<dyn WorkItem>,
    ) -> Result<JoinHandle<Result<(), Failure>>, Failure> {
        let location = item.location();
        let label = item.label().unwrap_or("").to_string();
        debug!(index, slot, label = %label, "starting work item");
        if let Some(tr) = &self.trace {
            tr.item_started(index, slot);
        }

        let unit_shared = Arc::clone(shared);
        let trace = self.trace.clone();
        let unit: Unit = Box::new(move || {
            let _signal = FinishSignal {
                shared: unit_shared,
                slot,
                index,
            };
            let result = match panic::catch_unwind(AssertUnwindSafe(move || item.run())) {
                Ok(result) => result,
                Err(payload) => Err(Failure::new(format!(
                    "work item {index} panicked: {}",
                    panic_message(payload.as_ref())
                ))),
            };
            debug!(index, success = result.is_ok(), "work item finished");
            if let Some(tr) = &trace {
                tr.item_finished(index, result.is_ok());
            }
            result
        });

        self.launcher
            .launch(index, format!("fanout-item-{index}"), unit)
            .map_err(|err| {
                warn!(index, error = %err, "failed to launch work item");
                if let Some(tr) = &self.trace {
                    tr.launch_failed(index, &err.to_string());
                }
                let message = format!("failed to launch work item {index}: {err}");
                match location {
                    Some(loc) => Failure::at(message, loc),
                    None => Failure::new(message),
                }
            })
    }
}

/// Dispatch `items` under `config` on OS threads and collapse the outcome.
pub fn run_all(
    config: &DispatchConfig,
    items: Vec<Box<dyn WorkItem>>,
) -> Result<(), DispatchError> {
    Dispatcher::new(config).dispatch(items).into_result()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    fn config(limit: usize) -> DispatchConfig {
        DispatchConfig {
            poll_interval_ms: 20,
            ..DispatchConfig::limited(limit)
        }
    }

    fn ok_item() -> Box<dyn WorkItem> {
        Box::new(|| -> Result<(), Failure> { Ok(()) })
    }

    #[test]
    fn empty_batch_is_success_without_launching() {
        struct NeverLaunch;
        impl Launcher for NeverLaunch {
            fn launch(
                &self,
                _index: usize,
                _name: String,
                _unit: Unit,
            ) -> std::io::Result<JoinHandle<Result<(), Failure>>> {
                panic!("launcher must not be called for an empty batch");
            }
        }

        let report = Dispatcher::new(&config(2))
            .with_launcher(NeverLaunch)
            .dispatch(Vec::new());
        assert_eq!(report.items, 0);
        assert_eq!(report.effective_limit, 2);
        assert!(report.outcome.is_success());
    }

    #[test]
    fn free_slot_prefers_lowest_empty_or_finished_slot() {
        let mut table = SlotTable::with_slots(3);
        assert_eq!(table.free_slot(), Some(0));

        let busy = |index| RunHandle {
            index,
            finished: false,
            unit: std::thread::spawn(|| Ok(())),
        };
        table.slots[0] = Some(busy(0));
        table.slots[1] = Some(busy(1));
        assert_eq!(table.free_slot(), Some(2));

        table.slots[2] = Some(busy(2));
        assert_eq!(table.free_slot(), None);

        if let Some(h) = table.slots[1].as_mut() {
            h.finished = true;
        }
        assert_eq!(table.free_slot(), Some(1));

        for h in table.slots.iter_mut().filter_map(Option::take) {
            h.join().1.unwrap();
        }
    }

    #[test]
    fn dispatch_runs_every_item_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let items: Vec<Box<dyn WorkItem>> = (0..11)
            .map(|_| {
                let counter = Arc::clone(&counter);
                Box::new(move || -> Result<(), Failure> {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }) as Box<dyn WorkItem>
            })
            .collect();

        let report = Dispatcher::new(&config(4)).dispatch(items);
        assert!(report.outcome.is_success());
        assert_eq!(counter.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn huge_cap_with_small_batch_sizes_table_to_items() {
        let cfg = DispatchConfig {
            poll_interval_ms: 20,
            ..DispatchConfig::limited(usize::MAX)
        };
        let report = Dispatcher::new(&cfg).dispatch(vec![ok_item(), ok_item()]);
        assert!(report.outcome.is_success());
        assert_eq!(report.items, 2);
        assert_eq!(report.effective_limit, usize::MAX);
    }

    #[test]
    fn dispatch_respects_concurrency_limit() {
        let active = Arc::new(AtomicUsize::new(0));
        let observed_max = Arc::new(AtomicUsize::new(0));

        let items: Vec<Box<dyn WorkItem>> = (0..8)
            .map(|_| {
                let active = Arc::clone(&active);
                let observed_max = Arc::clone(&observed_max);
                Box::new(move || -> Result<(), Failure> {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    observed_max.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(30));
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }) as Box<dyn WorkItem>
            })
            .collect();

        let report = Dispatcher::new(&config(3)).dispatch(items);
        assert!(report.outcome.is_success());
        assert!(
            observed_max.load(Ordering::SeqCst) <= 3,
            "observed max parallel items exceeded bound"
        );
    }

    #[test]
    fn finishing_item_wakes_dispatch_loop_before_poll_timeout() {
        let cfg = DispatchConfig {
            poll_interval_ms: 60_000,
            ..DispatchConfig::limited(1)
        };
        let items: Vec<Box<dyn WorkItem>> = (0..4)
            .map(|_| {
                Box::new(|| -> Result<(), Failure> {
                    std::thread::sleep(Duration::from_millis(10));
                    Ok(())
                }) as Box<dyn WorkItem>
            })
            .collect();

        let started = Instant::now();
        let report = Dispatcher::new(&cfg).dispatch(items);
        assert!(report.outcome.is_success());
        assert!(
            started.elapsed() < Duration::from_secs(30),
            "dispatch waited for the poll timeout instead of the finish signal"
        );
    }

    #[test]
    fn panicking_item_becomes_a_failure() {
        let items: Vec<Box<dyn WorkItem>> = vec![
            ok_item(),
            Box::new(|| -> Result<(), Failure> { panic!("simulated panic") }),
            ok_item(),
        ];

        let report = Dispatcher::new(&config(1)).dispatch(items);
        match report.outcome {
            AggregateOutcome::SingleFailure(f) => {
                assert!(f.message.contains("work item 1 panicked"), "{f}");
                assert!(f.message.contains("simulated panic"), "{f}");
            }
            other => panic!("expected SingleFailure, got {other:?}"),
        }
    }

    #[test]
    fn effective_limit_uses_pinned_processing_units() {
        let cfg = DispatchConfig {
            concurrency_limit: Some(1),
            per_unit_multiplier: Some(2),
            ..DispatchConfig::default()
        };
        let d = Dispatcher::new(&cfg).with_processing_units(4);
        assert_eq!(d.effective_limit(100), 8);
    }

    #[test]
    fn run_all_surfaces_the_single_failure_unchanged() {
        let items: Vec<Box<dyn WorkItem>> = vec![
            ok_item(),
            Box::new(|| -> Result<(), Failure> { Err(Failure::new("boom")) }),
        ];
        let err = run_all(&config(2), items).unwrap_err();
        assert_eq!(err, DispatchError::Item(Failure::new("boom")));
    }
}

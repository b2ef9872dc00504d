use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind")]
pub enum TraceEvent {
    DispatchStarted {
        ts_ms: u128,
        items: usize,
        limit: usize,
    },
    ItemStarted {
        ts_ms: u128,
        index: usize,
        slot: usize,
    },
    LaunchFailed {
        ts_ms: u128,
        index: usize,
        message: String,
    },
    ItemFinished {
        ts_ms: u128,
        index: usize,
        success: bool,
        elapsed_ms: u128,
    },
    DispatchFinished {
        ts_ms: u128,
        success: bool,
        elapsed_ms: u128,
    },
}

impl TraceEvent {
    pub fn summarize(&self) -> String {
        match self {
            TraceEvent::DispatchStarted {
                ts_ms,
                items,
                limit,
            } => format!("{ts_ms} DispatchStarted items={items} limit={limit}"),
            TraceEvent::ItemStarted { ts_ms, index, slot } => {
                format!("{ts_ms} ItemStarted item={index} slot={slot}")
            }
            TraceEvent::LaunchFailed {
                ts_ms,
                index,
                message,
            } => format!("{ts_ms} LaunchFailed item={index} message={message}"),
            TraceEvent::ItemFinished {
                ts_ms,
                index,
                success,
                elapsed_ms,
            } => format!(
                "{ts_ms} ItemFinished item={index} success={success} elapsed={}",
                format_elapsed_ms(*elapsed_ms)
            ),
            TraceEvent::DispatchFinished {
                ts_ms,
                success,
                elapsed_ms,
            } => format!(
                "{ts_ms} DispatchFinished success={success} elapsed_ms={elapsed_ms} elapsed={}",
                format_elapsed_ms(*elapsed_ms)
            ),
        }
    }
}

#[derive(Debug, Default)]
struct TraceState {
    events: Vec<TraceEvent>,
    run_started_ms: u128,
    item_started_ms: HashMap<usize, u128>,
}

/// Lifecycle recorder for one dispatch run.
///
/// Shared by `Arc` between the dispatch loop and the execution units; events
/// are appended in the order they happen.
#[derive(Debug)]
pub struct DispatchTrace {
    pub run_id: String,
    state: Mutex<TraceState>,
}

impl DispatchTrace {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            state: Mutex::new(TraceState::default()),
        }
    }

    fn now_ms() -> u128 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0)
    }

    fn state(&self) -> MutexGuard<'_, TraceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn dispatch_started(&self, items: usize, limit: usize) {
        let ts_ms = Self::now_ms();
        let mut st = self.state();
        st.run_started_ms = ts_ms;
        st.events.push(TraceEvent::DispatchStarted {
            ts_ms,
            items,
            limit,
        });
    }

    pub fn item_started(&self, index: usize, slot: usize) {
        let ts_ms = Self::now_ms();
        let mut st = self.state();
        st.item_started_ms.insert(index, ts_ms);
        st.events.push(TraceEvent::ItemStarted { ts_ms, index, slot });
    }

    pub fn launch_failed(&self, index: usize, message: &str) {
        let mut st = self.state();
        st.item_started_ms.remove(&index);
        st.events.push(TraceEvent::LaunchFailed {
            ts_ms: Self::now_ms(),
            index,
            message: message.to_string(),
        });
    }

    pub fn item_finished(&self, index: usize, success: bool) {
        let ts_ms = Self::now_ms();
        let mut st = self.state();
        let elapsed_ms = st
            .item_started_ms
            .remove(&index)
            .map(|started| ts_ms.saturating_sub(started))
            .unwrap_or(0);
        st.events.push(TraceEvent::ItemFinished {
            ts_ms,
            index,
            success,
            elapsed_ms,
        });
    }

    pub fn dispatch_finished(&self, success: bool) {
        let ts_ms = Self::now_ms();
        let mut st = self.state();
        let elapsed_ms = ts_ms.saturating_sub(st.run_started_ms);
        st.events.push(TraceEvent::DispatchFinished {
            ts_ms,
            success,
            elapsed_ms,
        });
    }

    /// Snapshot of everything recorded so far.
    pub fn events(&self) -> Vec<TraceEvent> {
        self.state().events.clone()
    }

    /// Largest number of items alive at once according to the event order.
    pub fn max_alive(&self) -> usize {
        let mut alive = 0usize;
        let mut max = 0usize;
        for ev in self.state().events.iter() {
            match ev {
                TraceEvent::ItemStarted { .. } => {
                    alive += 1;
                    max = max.max(alive);
                }
                TraceEvent::LaunchFailed { .. } | TraceEvent::ItemFinished { .. } => {
                    alive = alive.saturating_sub(1);
                }
                _ => {}
            }
        }
        max
    }
}

/// Print a human-readable trace to stdout (stable + diff-friendly).
pub fn print_trace(tr: &DispatchTrace) {
    println!("TRACE run_id={}", tr.run_id);
    for ev in tr.events() {
        println!("{}", ev.summarize());
    }
}

fn format_elapsed_ms(elapsed_ms: u128) -> String {
    let secs = elapsed_ms as f64 / 1000.0;
    format!("{secs:.2}s")
}

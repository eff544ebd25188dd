//! Control registry.
//!
//! The scheduler maps control codes to executors. Its table lock is only held
//! for bookkeeping: opening a source and joining a stopping executor both
//! happen with the lock released, so a slow camera never blocks other
//! controls from being added, queried or removed.

use crate::config::Control;
use crate::error::AnalyzerError;
use crate::executor::{
    ControlExecutor, ExecutorContext, ExecutorParams, ExecutorState, ExecutorStats,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use tracing::info;

/// Point-in-time view of one control.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlStatus {
    pub code: String,
    pub state: ExecutorState,
    pub stats: ExecutorStats,
    pub failure: Option<String>,
}

#[derive(Default)]
struct ControlTable {
    executors: HashMap<String, ControlExecutor>,
    /// Codes reserved by an `add` that is still opening its source
    starting: HashSet<String>,
    /// Set by `shutdown`; no executor is published afterwards
    closed: bool,
}

pub struct Scheduler {
    context: ExecutorContext,
    table: Mutex<ControlTable>,
}

impl Scheduler {
    pub fn new(context: ExecutorContext) -> Self {
        Self {
            context,
            table: Mutex::new(ControlTable::default()),
        }
    }

    /// Start monitoring a control.
    ///
    /// Fails with [`AnalyzerError::DuplicateControl`] while the code is
    /// running or starting. An executor that already stopped on its own is
    /// replaced. Once [`shutdown`](Self::shutdown) has begun every add fails
    /// with [`AnalyzerError::ShuttingDown`], including one whose source was
    /// still opening; its executor is stopped before returning.
    pub fn add(&self, control: Control) -> Result<(), AnalyzerError> {
        control.validate()?;
        let code = control.code.clone();

        let reaped = {
            let mut table = self.table.lock();
            if table.closed {
                return Err(AnalyzerError::ShuttingDown(code));
            }
            if table.starting.contains(&code) {
                return Err(AnalyzerError::DuplicateControl(code));
            }

            let reaped = match table.executors.get(&code).map(|e| e.state()) {
                Some(ExecutorState::Stopped) => table.executors.remove(&code),
                Some(_) => return Err(AnalyzerError::DuplicateControl(code)),
                None => None,
            };
            table.starting.insert(code.clone());
            reaped
        };

        if let Some(mut stopped) = reaped {
            stopped.join();
            info!(control = %code, failure = ?stopped.failure(), "Replacing stopped control");
        }

        let mut executor = ControlExecutor::new(ExecutorParams {
            control,
            context: self.context.clone(),
        });
        let result = executor.start();

        let mut table = self.table.lock();
        table.starting.remove(&code);
        result?;
        if !table.closed {
            table.executors.insert(code, executor);
            return Ok(());
        }
        drop(table);

        executor.stop();
        info!(control = %code, "Scheduler shut down while control was starting");
        Err(AnalyzerError::ShuttingDown(code))
    }

    /// Stop a control and wait for its threads.
    pub fn remove(&self, code: &str) -> Result<(), AnalyzerError> {
        let mut executor = {
            let mut table = self.table.lock();
            if table.starting.contains(code) {
                return Err(AnalyzerError::ControlStarting(code.to_string()));
            }
            table
                .executors
                .remove(code)
                .ok_or_else(|| AnalyzerError::UnknownControl(code.to_string()))?
        };

        executor.stop();
        info!(control = %code, stats = ?executor.stats(), "Control removed");
        Ok(())
    }

    pub fn query(&self, code: &str) -> Option<ExecutorState> {
        let table = self.table.lock();
        if table.starting.contains(code) {
            return Some(ExecutorState::Starting);
        }
        table.executors.get(code).map(|e| e.state())
    }

    pub fn is_running(&self, code: &str) -> bool {
        self.query(code) == Some(ExecutorState::Running)
    }

    /// Status of every registered control, ordered by code.
    pub fn list(&self) -> Vec<ControlStatus> {
        let table = self.table.lock();
        let mut statuses: Vec<ControlStatus> = table
            .executors
            .values()
            .map(|e| ControlStatus {
                code: e.code().to_string(),
                state: e.state(),
                stats: e.stats(),
                failure: e.failure(),
            })
            .collect();
        statuses.sort_by(|a, b| a.code.cmp(&b.code));
        statuses
    }

    pub fn len(&self) -> usize {
        self.table.lock().executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop every control and refuse further adds. Returns their final status.
    pub fn shutdown(&self) -> Vec<ControlStatus> {
        let executors: Vec<ControlExecutor> = {
            let mut table = self.table.lock();
            table.closed = true;
            table.executors.drain().map(|(_, e)| e).collect()
        };

        // Signal everyone first so controls wind down in parallel
        for executor in &executors {
            executor.request_stop();
        }

        let mut statuses: Vec<ControlStatus> = executors
            .into_iter()
            .map(|mut executor| {
                executor.join();
                ControlStatus {
                    code: executor.code().to_string(),
                    state: executor.state(),
                    stats: executor.stats(),
                    failure: executor.failure(),
                }
            })
            .collect();
        statuses.sort_by(|a, b| a.code.cmp(&b.code));

        info!(controls = statuses.len(), "Scheduler shut down");
        statuses
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EncodeMode;
    use crate::testing::{wait_until, Harness, MuxerScript, ScriptedTransport, SourceScript};
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(10);

    fn harness(triggers: Vec<u64>) -> Harness {
        Harness::new(
            ScriptedTransport::new(SourceScript::default()),
            triggers,
            MuxerScript::default(),
        )
    }

    fn scheduler(harness: &Harness) -> Scheduler {
        Scheduler::new(harness.context(EncodeMode::Inline))
    }

    fn control(code: &str) -> Control {
        Control::new(code, format!("test://{}", code))
    }

    #[test]
    fn test_add_query_remove() {
        let harness = harness(vec![]);
        let scheduler = scheduler(&harness);

        scheduler.add(control("cam-1")).unwrap();
        assert!(scheduler.is_running("cam-1"));
        assert_eq!(scheduler.query("cam-1"), Some(ExecutorState::Running));
        assert_eq!(scheduler.len(), 1);

        scheduler.remove("cam-1").unwrap();
        assert_eq!(scheduler.query("cam-1"), None);
        assert!(!scheduler.is_running("cam-1"));
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_duplicate_add_keeps_first() {
        let harness = harness(vec![]);
        let scheduler = scheduler(&harness);

        scheduler.add(control("cam-1")).unwrap();
        let result = scheduler.add(control("cam-1"));

        assert!(matches!(result, Err(AnalyzerError::DuplicateControl(code)) if code == "cam-1"));
        assert!(scheduler.is_running("cam-1"));
        assert_eq!(harness.transport.ledger.opens.load(Ordering::SeqCst), 1);

        let before = scheduler.list()[0].stats.frames_read;
        assert!(wait_until(WAIT, || scheduler.list()[0].stats.frames_read > before));
        scheduler.shutdown();
    }

    #[test]
    fn test_remove_unknown() {
        let harness = harness(vec![]);
        let scheduler = scheduler(&harness);
        assert!(matches!(
            scheduler.remove("missing"),
            Err(AnalyzerError::UnknownControl(_))
        ));
    }

    #[test]
    fn test_failed_start_is_not_registered() {
        let harness = Harness::new(
            ScriptedTransport::new(SourceScript {
                failing_opens: u32::MAX,
                ..SourceScript::default()
            }),
            vec![],
            MuxerScript::default(),
        );
        let scheduler = scheduler(&harness);

        assert!(matches!(
            scheduler.add(control("cam-1")),
            Err(AnalyzerError::SourceUnavailable { .. })
        ));
        assert_eq!(scheduler.query("cam-1"), None);
    }

    #[test]
    fn test_invalid_control_rejected() {
        let harness = harness(vec![]);
        let scheduler = scheduler(&harness);
        assert!(matches!(
            scheduler.add(Control::new("cam-1", "no-scheme")),
            Err(AnalyzerError::InvalidControl(_))
        ));
        assert_eq!(harness.transport.ledger.opens.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_read_failure_stops_only_that_control() {
        let transport = ScriptedTransport::new(SourceScript::default()).with_control(
            "cam-bad",
            SourceScript {
                fail_after: Some(2),
                ..SourceScript::default()
            },
        );
        let harness = Harness::new(transport, vec![], MuxerScript::default());
        let scheduler = scheduler(&harness);

        scheduler.add(control("cam-good")).unwrap();
        scheduler.add(control("cam-bad")).unwrap();

        assert!(wait_until(WAIT, || {
            scheduler.query("cam-bad") == Some(ExecutorState::Stopped)
        }));
        assert!(scheduler.is_running("cam-good"));

        let statuses = scheduler.list();
        assert_eq!(statuses[0].code, "cam-bad");
        assert!(statuses[0].failure.is_some());
        assert!(statuses[1].failure.is_none());
        scheduler.shutdown();
    }

    #[test]
    fn test_stopped_control_is_replaced() {
        let transport = ScriptedTransport::new(SourceScript {
            fail_after: Some(1),
            ..SourceScript::default()
        });
        let harness = Harness::new(transport, vec![], MuxerScript::default());
        let scheduler = scheduler(&harness);

        scheduler.add(control("cam-1")).unwrap();
        assert!(wait_until(WAIT, || {
            scheduler.query("cam-1") == Some(ExecutorState::Stopped)
        }));

        scheduler.add(control("cam-1")).unwrap();
        assert_eq!(harness.transport.ledger.opens.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.len(), 1);
        scheduler.shutdown();
    }

    #[test]
    fn test_slow_source_does_not_delay_other_adds() {
        let transport = ScriptedTransport::new(SourceScript::default()).with_control(
            "cam-slow",
            SourceScript {
                open_delay: Duration::from_millis(500),
                ..SourceScript::default()
            },
        );
        let harness = Harness::new(transport, vec![], MuxerScript::default());
        let scheduler = Arc::new(scheduler(&harness));

        let slow = std::thread::spawn({
            let scheduler = scheduler.clone();
            move || scheduler.add(control("cam-slow"))
        });
        assert!(wait_until(WAIT, || {
            scheduler.query("cam-slow") == Some(ExecutorState::Starting)
        }));

        scheduler.add(control("cam-fast")).unwrap();
        assert!(scheduler.is_running("cam-fast"));
        assert_eq!(scheduler.query("cam-slow"), Some(ExecutorState::Starting));

        slow.join().unwrap().unwrap();
        assert!(scheduler.is_running("cam-slow"));
        scheduler.shutdown();
    }

    #[test]
    fn test_shutdown_rejects_control_still_starting() {
        let transport = ScriptedTransport::new(SourceScript {
            open_delay: Duration::from_millis(300),
            ..SourceScript::default()
        });
        let harness = Harness::new(transport, vec![], MuxerScript::default());
        let scheduler = Arc::new(scheduler(&harness));

        let adding = std::thread::spawn({
            let scheduler = scheduler.clone();
            move || scheduler.add(control("cam-slow"))
        });
        assert!(wait_until(WAIT, || {
            scheduler.query("cam-slow") == Some(ExecutorState::Starting)
        }));

        assert!(scheduler.shutdown().is_empty());
        let result = adding.join().unwrap();

        assert!(matches!(result, Err(AnalyzerError::ShuttingDown(code)) if code == "cam-slow"));
        assert!(scheduler.is_empty());
        assert_eq!(scheduler.query("cam-slow"), None);
        assert_eq!(
            harness.transport.ledger.sources_closed.load(Ordering::SeqCst),
            1
        );
    }

    #[test]
    fn test_add_after_shutdown_is_rejected() {
        let harness = Harness::new(
            ScriptedTransport::new(SourceScript::default()),
            vec![],
            MuxerScript::default(),
        );
        let scheduler = scheduler(&harness);
        scheduler.shutdown();

        assert!(matches!(
            scheduler.add(control("cam-1")),
            Err(AnalyzerError::ShuttingDown(_))
        ));
        assert_eq!(harness.transport.ledger.opens.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_shutdown_stops_everything() {
        let harness = harness(vec![]);
        let scheduler = scheduler(&harness);

        for code in ["cam-1", "cam-2", "cam-3"] {
            scheduler.add(control(code)).unwrap();
        }

        let statuses = scheduler.shutdown();
        assert_eq!(statuses.len(), 3);
        assert!(statuses.iter().all(|s| s.state == ExecutorState::Stopped));
        assert!(scheduler.is_empty());
        assert_eq!(
            harness.transport.ledger.sources_closed.load(Ordering::SeqCst),
            3
        );
    }
}

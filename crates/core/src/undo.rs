//! Compensating actions for partially applied topology changes.
//!
//! Each step of an operation that changes something pushes the action that
//! takes it back. On failure the actions run newest first; on success the
//! stack is cancelled. Actions close over accessors (shared cells, resolver
//! closures) rather than values, so they see the topology as it is when they
//! run, not as it was when they were registered.

use tracing::{debug, warn};

use crate::context::Console;
use crate::error::Result;
use crate::metadata::{EditLog, Metadata};

type Compensation<'a> = Box<dyn FnOnce() -> Result<()> + 'a>;
type Resolver<'a> = Box<dyn Fn() -> Result<Metadata> + 'a>;

enum Action<'a> {
    Run(Compensation<'a>),
    /// Replay the inverses of a committed metadata transaction on whatever
    /// store the resolver returns at undo time.
    Metadata { log: EditLog, resolve: Resolver<'a> },
}

struct Entry<'a> {
    label: String,
    action: Action<'a>,
}

/// Outcome of [`UndoTracker::execute`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UndoReport {
    pub reverted: Vec<String>,
    pub failed: Vec<String>,
}

impl UndoReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Default)]
pub struct UndoTracker<'a> {
    entries: Vec<Entry<'a>>,
}

impl<'a> UndoTracker<'a> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, label: impl Into<String>, compensation: impl FnOnce() -> Result<()> + 'a) {
        let label = label.into();
        debug!(%label, "undo step registered");
        self.entries.push(Entry {
            label,
            action: Action::Run(Box::new(compensation)),
        });
    }

    pub fn add_metadata(
        &mut self,
        label: impl Into<String>,
        log: EditLog,
        resolve: impl Fn() -> Result<Metadata> + 'a,
    ) {
        if log.is_empty() {
            return;
        }
        let label = label.into();
        debug!(%label, edits = log.len(), "metadata undo step registered");
        self.entries.push(Entry {
            label,
            action: Action::Metadata {
                log,
                resolve: Box::new(resolve),
            },
        });
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.label.as_str())
    }

    /// Forget every entry without running it.
    pub fn cancel(&mut self) {
        debug!(entries = self.entries.len(), "undo cancelled");
        self.entries.clear();
    }

    /// Run every entry, newest first. A failing entry is reported and the
    /// remaining ones still run.
    pub fn execute(&mut self, console: &dyn Console) -> UndoReport {
        let mut report = UndoReport::default();
        while let Some(Entry { label, action }) = self.entries.pop() {
            debug!(%label, "reverting");
            let result = match action {
                Action::Run(compensation) => compensation(),
                Action::Metadata { log, resolve } => resolve().and_then(|metadata| metadata.revert(&log)),
            };
            match result {
                Ok(()) => report.reverted.push(label),
                Err(err) => {
                    warn!(%label, %err, "undo step failed");
                    console.warn(&format!("Could not revert '{label}': {err}"));
                    report.failed.push(label);
                }
            }
        }
        report
    }
}

impl Drop for UndoTracker<'_> {
    fn drop(&mut self) {
        if !self.entries.is_empty() {
            warn!(
                entries = self.entries.len(),
                "undo tracker dropped with pending entries that were neither run nor cancelled"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::Arc;

    use super::*;
    use crate::error::{Error, ErrorCode};
    use crate::metadata::tests::MemoryStore;
    use crate::metadata::Value;

    #[derive(Default)]
    struct Quiet(std::sync::Mutex<Vec<String>>);

    impl Console for Quiet {
        fn info(&self, _: &str) {}

        fn warn(&self, message: &str) {
            self.0.lock().unwrap().push(message.into());
        }

        fn success(&self, _: &str) {}
    }

    #[test]
    fn runs_in_reverse_and_survives_failures() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let console = Quiet::default();
        let mut undo = UndoTracker::new();
        for step in ["one", "two", "three"] {
            let order = order.clone();
            undo.add(step, move || {
                order.borrow_mut().push(step);
                if step == "two" {
                    Err(Error::new(ErrorCode::InvalidOption, "broken"))
                } else {
                    Ok(())
                }
            });
        }
        let report = undo.execute(&console);
        assert_eq!(*order.borrow(), ["three", "two", "one"]);
        assert_eq!(report.reverted, ["three", "one"]);
        assert_eq!(report.failed, ["two"]);
        assert_eq!(console.0.lock().unwrap().len(), 1);
        assert!(undo.is_empty());
    }

    #[test]
    fn cancel_discards_everything() {
        let ran = Rc::new(RefCell::new(false));
        let mut undo = UndoTracker::new();
        let flag = ran.clone();
        undo.add("step", move || {
            *flag.borrow_mut() = true;
            Ok(())
        });
        undo.cancel();
        let report = undo.execute(&Quiet::default());
        assert!(report.reverted.is_empty());
        assert!(!*ran.borrow());
    }

    #[test]
    fn compensation_sees_state_at_undo_time() {
        let target = Rc::new(RefCell::new("old"));
        let seen = Rc::new(RefCell::new(""));
        let mut undo = UndoTracker::new();
        {
            let target = target.clone();
            let seen = seen.clone();
            undo.add("read target", move || {
                *seen.borrow_mut() = *target.borrow();
                Ok(())
            });
        }
        *target.borrow_mut() = "new";
        undo.execute(&Quiet::default());
        assert_eq!(*seen.borrow(), "new");
    }

    #[test]
    fn metadata_entries_revert_through_resolver() {
        let store = Arc::new(MemoryStore::default());
        let metadata = Metadata::new(store);
        let mut txn = metadata.transaction().unwrap();
        txn.put_cluster(crate::metadata::ClusterRecord {
            id: "c1".into(),
            name: "one".into(),
            group_name: "g".into(),
            view_change_uuid: None,
            instances: Vec::new(),
            attributes: crate::metadata::Attributes::new(),
            routing_options: crate::metadata::Attributes::new(),
        })
        .unwrap();
        txn.commit().unwrap();
        let before = metadata.snapshot().unwrap();

        let mut txn = metadata.transaction().unwrap();
        txn.set_cluster_attribute("c1", "k", Some(Value::Int(7))).unwrap();
        let log = txn.commit().unwrap();

        let mut undo = UndoTracker::new();
        let resolver = metadata.clone();
        undo.add_metadata("attribute", log, move || Ok(resolver.clone()));
        let report = undo.execute(&Quiet::default());
        assert!(report.is_clean());
        assert_eq!(metadata.snapshot().unwrap(), before);
    }
}

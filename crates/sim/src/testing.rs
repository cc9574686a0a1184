//! Test doubles for the [`OperationContext`](clusterset_core::OperationContext) seams.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use clusterset_core::{Console, FailurePoints, Notifier, Result, ServerError};

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Level {
    Info,
    Warn,
    Success,
}

/// A console that keeps every line.
#[derive(Debug, Default)]
pub struct RecordingConsole {
    lines: Mutex<Vec<(Level, String)>>,
}

impl RecordingConsole {
    #[must_use]
    pub fn lines(&self) -> Vec<(Level, String)> {
        locked(&self.lines).clone()
    }

    #[must_use]
    pub fn at(&self, level: Level) -> Vec<String> {
        locked(&self.lines)
            .iter()
            .filter(|(l, _)| *l == level)
            .map(|(_, line)| line.clone())
            .collect()
    }

    #[must_use]
    pub fn contains(&self, needle: &str) -> bool {
        locked(&self.lines).iter().any(|(_, line)| line.contains(needle))
    }

    fn push(&self, level: Level, message: &str) {
        locked(&self.lines).push((level, message.to_string()));
    }
}

impl Console for RecordingConsole {
    fn info(&self, message: &str) {
        self.push(Level::Info, message);
    }

    fn warn(&self, message: &str) {
        self.push(Level::Warn, message);
    }

    fn success(&self, message: &str) {
        self.push(Level::Success, message);
    }
}

/// Fails with a lost connection every time `point` is reached.
#[derive(Debug)]
pub struct FailAt {
    point: String,
    hits: AtomicUsize,
}

impl FailAt {
    #[must_use]
    pub fn new(point: &str) -> Self {
        Self {
            point: point.to_string(),
            hits: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

impl FailurePoints for FailAt {
    fn check(&self, point: &str) -> Result<()> {
        if point != self.point {
            return Ok(());
        }
        self.hits.fetch_add(1, Ordering::SeqCst);
        Err(ServerError::new(
            ServerError::SERVER_LOST,
            format!("Lost connection to MySQL server (injected at {point})"),
        )
        .into())
    }
}

/// Never fails, remembers which points were passed.
#[derive(Debug, Default)]
pub struct TracePoints {
    seen: Mutex<Vec<String>>,
}

impl TracePoints {
    #[must_use]
    pub fn seen(&self) -> Vec<String> {
        locked(&self.seen).clone()
    }
}

impl FailurePoints for TracePoints {
    fn check(&self, point: &str) -> Result<()> {
        locked(&self.seen).push(point.to_string());
        Ok(())
    }
}

/// Counts primary changes per ClusterSet.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    changes: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    #[must_use]
    pub fn changes(&self) -> Vec<String> {
        locked(&self.changes).clone()
    }
}

impl Notifier for RecordingNotifier {
    fn primary_changed(&self, cluster_set_id: &str) {
        locked(&self.changes).push(cluster_set_id.to_string());
    }
}

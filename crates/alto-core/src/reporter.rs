//! Console reporting, serialized so concurrent writers never interleave.
//!
//! Two independent concerns in the engine write to the same terminal: the
//! pipeline's stderr-draining threads (one per subprocess) and whatever
//! top-level progress a caller wants to show. Both must share a single
//! mutex-guarded sink or their output interleaves mid-line.

use std::sync::{Arc, Mutex};

pub trait Reporter {
    fn info(&mut self, msg: &str);
    fn warn(&mut self, msg: &str);
    fn error(&mut self, msg: &str);
}

/// Thread-safe handle to a `Reporter`, cloneable and shareable across
/// the stderr-logger threads and the task scheduler's worker threads.
#[derive(Clone)]
pub struct SharedReporter(Arc<Mutex<dyn Reporter + Send>>);

impl SharedReporter {
    pub fn new(inner: impl Reporter + Send + 'static) -> Self {
        Self(Arc::new(Mutex::new(inner)))
    }

    pub fn info(&self, msg: &str) {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).info(msg);
    }

    pub fn warn(&self, msg: &str) {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).warn(msg);
    }

    pub fn error(&self, msg: &str) {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).error(msg);
    }
}

/// Default reporter: prints to stderr with a level prefix.
pub struct ConsoleReporter;

impl Reporter for ConsoleReporter {
    fn info(&mut self, msg: &str) {
        eprintln!("[info] {msg}");
    }

    fn warn(&mut self, msg: &str) {
        eprintln!("[warn] {msg}");
    }

    fn error(&mut self, msg: &str) {
        eprintln!("[error] {msg}");
    }
}

/// A reporter that records messages instead of printing them, for tests.
#[cfg(test)]
#[derive(Default)]
pub struct RecordingReporter {
    pub lines: Vec<String>,
}

#[cfg(test)]
impl Reporter for RecordingReporter {
    fn info(&mut self, msg: &str) {
        self.lines.push(format!("info: {msg}"));
    }

    fn warn(&mut self, msg: &str) {
        self.lines.push(format!("warn: {msg}"));
    }

    fn error(&mut self, msg: &str) {
        self.lines.push(format!("error: {msg}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn shared_reporter_is_cloneable_across_threads() {
        let reporter = SharedReporter::new(RecordingReporter::default());
        let mut handles = vec![];
        for i in 0..8 {
            let r = reporter.clone();
            handles.push(thread::spawn(move || {
                r.info(&format!("from thread {i}"));
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }
}

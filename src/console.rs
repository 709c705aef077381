use std::sync::{Arc, Mutex};

/// One line of console output, already tagged with the RPC call id (or
/// kernel-internal marker) that produced it.
#[derive(Debug, Clone)]
pub struct ConsoleLine {
    pub tag: String,
    pub message: String,
}

/// Where console lines actually go. The persistence backend behind this is
/// an external collaborator — this crate only defines the seam and ships a
/// `tracing`-backed default so the kernel has somewhere to write during
/// tests and standalone runs.
pub trait ConsoleSink: Send + Sync {
    fn write(&self, line: &ConsoleLine);
}

/// Default sink: routes every console line through `tracing` at `info`,
/// with the tag carried as a structured field rather than baked into the
/// message.
pub struct TracingConsoleSink;

impl ConsoleSink for TracingConsoleSink {
    fn write(&self, line: &ConsoleLine) {
        tracing::info!(tag = %line.tag, "{}", line.message);
    }
}

/// The kernel's console cache handle. Every call's shield routes `console`
/// through here (tagged `RPC(<ID>):-$`, uppercased, per call), and kernel
/// internals log their own transitions through the same cache via
/// `log_internal` (tagged `rpc(<id>)`, lowercased). This is a different
/// surface from a kernel module named `console`, if one is ever
/// registered: the shield's binding and a module import are independent
/// paths and must never be collapsed into each other.
pub struct ConsoleCache {
    sink: Arc<dyn ConsoleSink>,
    lines: Mutex<Vec<ConsoleLine>>,
}

impl ConsoleCache {
    pub fn new(sink: Arc<dyn ConsoleSink>) -> Self {
        ConsoleCache {
            sink,
            lines: Mutex::new(Vec::new()),
        }
    }

    pub fn with_default_sink() -> Self {
        ConsoleCache::new(Arc::new(TracingConsoleSink))
    }

    fn push(&self, tag: String, message: String) {
        let line = ConsoleLine { tag, message };
        self.sink.write(&line);
        self.lines.lock().unwrap().push(line);
    }

    /// Logs a line on behalf of user code running inside a call, tagged
    /// `RPC(<ID>):-$` with the call id uppercased.
    pub fn log_call(&self, call_id: &str, message: impl Into<String>) {
        self.push(format!("RPC({}):-$", call_id.to_uppercase()), message.into());
    }

    /// Logs an error line on behalf of user code, same tagging as
    /// `log_call`.
    pub fn error_call(&self, call_id: &str, message: impl Into<String>) {
        self.push(
            format!("RPC({}):-$ [error]", call_id.to_uppercase()),
            message.into(),
        );
    }

    /// Logs a kernel-internal transition (not user-emitted), tagged
    /// `rpc(<id>)` with the call id lowercased.
    pub fn log_internal(&self, call_id: &str, message: impl Into<String>) {
        self.push(format!("rpc({})", call_id.to_lowercase()), message.into());
    }

    /// Returns every line buffered so far and empties the cache. A call's
    /// lines are all pushed before its terminal state is delivered, so a
    /// transport that drains after writing the response never sees a stray
    /// late line for that call.
    pub fn drain(&self) -> Vec<ConsoleLine> {
        std::mem::take(&mut *self.lines.lock().unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CollectingSink {
        lines: Mutex<Vec<ConsoleLine>>,
    }

    impl ConsoleSink for CollectingSink {
        fn write(&self, line: &ConsoleLine) {
            self.lines.lock().unwrap().push(line.clone());
        }
    }

    #[test]
    fn call_lines_are_tagged_uppercase() {
        let cache = ConsoleCache::with_default_sink();
        cache.log_call("abc-1", "hello");
        let lines = cache.drain();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].tag, "RPC(ABC-1):-$");
        assert_eq!(lines[0].message, "hello");
    }

    #[test]
    fn internal_lines_are_tagged_lowercase() {
        let cache = ConsoleCache::with_default_sink();
        cache.log_internal("ABC-1", "phase 1 started");
        let lines = cache.drain();
        assert_eq!(lines[0].tag, "rpc(abc-1)");
    }

    #[test]
    fn drain_empties_the_cache() {
        let cache = ConsoleCache::with_default_sink();
        cache.log_call("x", "one");
        assert_eq!(cache.drain().len(), 1);
        assert_eq!(cache.drain().len(), 0);
    }

    #[test]
    fn custom_sink_receives_every_line() {
        let sink = Arc::new(CollectingSink {
            lines: Mutex::new(Vec::new()),
        });
        let cache = ConsoleCache::new(sink.clone());
        cache.log_call("x", "one");
        cache.error_call("x", "two");
        assert_eq!(sink.lines.lock().unwrap().len(), 2);
    }
}

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

/// Identifies which transport a call arrived over; carried on the request
/// object as `CallMethod`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallMethod {
    Http,
    Ws,
    Ipc,
}

impl CallMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallMethod::Http => "http",
            CallMethod::Ws => "ws",
            CallMethod::Ipc => "ipc",
        }
    }
}

/// One cookie as exposed under `http.Cookies[name]`. Field names serialize
/// capitalized because that is exactly how the request object presents them
/// to script code.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Cookie {
    pub value: String,
    pub domain: String,
    pub path: String,
    pub expires: Option<String>,
}

/// A fresh process log created per request, tagged with the call id used
/// for every `RPC(<id>)` log line the call produces.
#[derive(Debug, Clone)]
pub struct ProcessLog {
    id: String,
}

impl ProcessLog {
    pub fn new(id: impl Into<String>) -> Self {
        ProcessLog { id: id.into() }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Closed when the owning connection goes away; a watcher thread holds the
/// sender side and drops it (or sends) on cancellation so any blocked
/// reader wakes up rather than hanging forever.
pub struct SafetyChannel {
    rx: mpsc::Receiver<()>,
}

impl SafetyChannel {
    fn pair() -> (mpsc::Sender<()>, SafetyChannel) {
        let (tx, rx) = mpsc::channel();
        (tx, SafetyChannel { rx })
    }

    /// Blocks until the channel closes (the connection dropped) or the
    /// timeout elapses, returning `true` if it closed.
    pub fn wait_closed(&self, timeout: std::time::Duration) -> bool {
        matches!(
            self.rx.recv_timeout(timeout),
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected)
        )
    }
}

/// Per-HTTP-request liveness and metadata carrier. Built once per inbound
/// request and handed to the RPC pipeline as part of `RpcRequest`.
pub struct HttpContext {
    is_connected: Arc<AtomicBool>,
    safety_channel: SafetyChannel,
    pub local_ip: IpAddr,
    pub remote_ip: IpAddr,
    pub process_log: ProcessLog,
    pub content_length: u64,
    pub host: String,
    pub proto: String,
    pub request_uri: String,
    pub cookies: std::collections::HashMap<String, Cookie>,
    pub headers: std::collections::HashMap<String, Vec<String>>,
}

impl HttpContext {
    /// A fresh read of the liveness flag, exposed to JS as
    /// `http.IsConnected()`.
    pub fn is_connected(&self) -> bool {
        self.is_connected.load(Ordering::SeqCst)
    }

    pub fn safety_channel(&self) -> &SafetyChannel {
        &self.safety_channel
    }
}

/// Builds `HttpContext`s for inbound requests and wires each one to a
/// cancellation watcher. There is no shared state between requests; this
/// exists purely to keep the construction-plus-watcher-spawn recipe in one
/// place.
pub struct ContextManager;

impl ContextManager {
    /// Creates a new HTTP-backed session. `cancelled` is a receiver that
    /// fires (or disconnects) when the transport's request context is
    /// done — e.g. the client closed the connection.
    pub fn new_http_session(
        call_id: impl Into<String>,
        local_ip: IpAddr,
        remote_ip: IpAddr,
        content_length: u64,
        host: impl Into<String>,
        proto: impl Into<String>,
        request_uri: impl Into<String>,
        cancelled: mpsc::Receiver<()>,
    ) -> HttpContext {
        let is_connected = Arc::new(AtomicBool::new(true));
        let (safety_tx, safety_channel) = SafetyChannel::pair();

        let watcher_flag = Arc::clone(&is_connected);
        thread::spawn(move || {
            // Blocks until the transport signals cancellation, then one-way
            // latches liveness to false and drops the safety sender so any
            // blocked `wait_closed` caller wakes up.
            let _ = cancelled.recv();
            watcher_flag.store(false, Ordering::SeqCst);
            drop(safety_tx);
        });

        HttpContext {
            is_connected,
            safety_channel,
            local_ip,
            remote_ip,
            process_log: ProcessLog::new(call_id),
            content_length,
            host: host.into(),
            proto: proto.into(),
            request_uri: request_uri.into(),
            cookies: std::collections::HashMap::new(),
            headers: std::collections::HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    #[test]
    fn liveness_flips_false_on_cancellation() {
        let (tx, rx) = mpsc::channel();
        let ctx = ContextManager::new_http_session(
            "call-1",
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            0,
            "localhost",
            "HTTP/1.1",
            "/rpc",
            rx,
        );

        assert!(ctx.is_connected());
        tx.send(()).unwrap();
        assert!(ctx.safety_channel().wait_closed(Duration::from_secs(1)));
        assert!(!ctx.is_connected());
    }

    #[test]
    fn liveness_flips_false_when_sender_is_dropped() {
        let (tx, rx) = mpsc::channel();
        let ctx = ContextManager::new_http_session(
            "call-2",
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            0,
            "localhost",
            "HTTP/1.1",
            "/rpc",
            rx,
        );

        drop(tx);
        assert!(ctx.safety_channel().wait_closed(Duration::from_secs(1)));
        assert!(!ctx.is_connected());
    }
}

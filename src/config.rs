use serde::{Deserialize, Serialize};

/// Per-VM options. Defaults match the recognized configuration surface:
/// main script origin, call timeout, poll backoff, and the console cache's
/// logging directory (the persistence backend behind that directory is an
/// external collaborator — this crate only carries the path).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Name used in stack traces for the VM's main script.
    pub main_script_origin: String,
    /// How long a call may sit with a pending promise before Phase 5 gives
    /// up and delivers `state="timeout"`.
    pub rpc_call_timeout_ms: u64,
    /// Off-loop sleep between Phase 5 re-polls of a still-pending promise.
    pub poll_backoff_ms: u64,
    /// Directory the console cache's persistence backend writes under.
    pub logging_dir: String,
    /// Math.random() seed, for reproducible VM runs. Orthogonal to RPC but
    /// carried here since it is still a per-VM V8 option.
    pub seed: Option<i64>,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            main_script_origin: "main.js".to_string(),
            rpc_call_timeout_ms: 30_000,
            poll_backoff_ms: 1,
            logging_dir: "./logs".to_string(),
            seed: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = VmConfig::default();
        assert_eq!(config.main_script_origin, "main.js");
        assert_eq!(config.rpc_call_timeout_ms, 30_000);
        assert_eq!(config.poll_backoff_ms, 1);
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: VmConfig = serde_json::from_str(r#"{"main_script_origin": "boot.js"}"#).unwrap();
        assert_eq!(config.main_script_origin, "boot.js");
        assert_eq!(config.rpc_call_timeout_ms, 30_000);
    }
}

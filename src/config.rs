//! Process-wide configuration carried as an explicit value, never a singleton
//! (§9 Design Notes: "Global service state" — generalized from the teacher's
//! constructor-injected `Arc<dyn ProcessStore>`).

use std::time::Duration;

/// Reserved work basket a `Pause` node pends at.
pub const PAUSE_WORK_BASKET: &str = "workflow_pause";

/// Sentinel node name meaning "no more nodes".
pub const END_NODE: &str = "end";

#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Worker pool size. 0 disables concurrency — the drive loop advances each
    /// runnable path inline on the caller's task instead of spawning workers.
    pub max_threads: usize,
    /// Idle worker reclaim / executor shutdown wait.
    pub idle_timeout: Duration,
    /// Separator used in hierarchical execution-path names and in snapshot/audit
    /// repository keys. Forbidden inside branch labels.
    pub path_separator: char,
    /// Basket used when user code throws (`ERROR_PEND`).
    pub error_workbasket: String,
    /// If true, every snapshot is also written under a sequenced audit key.
    pub write_audit_log: bool,
    /// If true, snapshot after each path advance; otherwise only at
    /// pend/complete/persist-node.
    pub write_process_info_after_each_step: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_threads: 8,
            idle_timeout: Duration::from_secs(60),
            path_separator: '-',
            error_workbasket: "workflow_error".to_string(),
            write_audit_log: false,
            write_process_info_after_each_step: true,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.path_separator.is_alphanumeric() {
            return Err("path_separator must not be alphanumeric".to_string());
        }
        Ok(())
    }
}

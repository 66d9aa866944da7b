use std::path::PathBuf;

#[derive(Debug)]
/// Bridge configuration
pub struct Config {
    /// Path to the GDB executable to spawn
    pub gdb_path: PathBuf,
    /// Directory the rolling DAP/MI trace log is written to
    pub log_dir: PathBuf,
    /// GDB command execution timeout in seconds; only the CLI entry point
    /// enforces this, the core command-correlation engine itself has none
    pub command_timeout: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gdb_path: std::env::var("GDB_PATH")
                .unwrap_or_else(|_| "gdb".to_string())
                .into(),
            log_dir: std::env::var("MI_DAP_BRIDGE_LOG_DIR")
                .unwrap_or_else(|_| "logs".to_string())
                .into(),
            command_timeout: std::env::var("GDB_COMMAND_TIMEOUT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
        }
    }
}

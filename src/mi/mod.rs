pub mod commands;
pub mod correlator;
pub mod output;

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::io::BufReader;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, broadcast, mpsc};
use tracing::{debug, warn};

use crate::error::{AppError, AppResult};
use correlator::Correlator;
use output::process_output;

const ASYNC_CHANNEL_CAPACITY: usize = 256;
const CONSOLE_CHANNEL_CAPACITY: usize = 256;

/// A `Stream{console|target}`/`Stream{log}` record forwarded to console
/// subscribers, already classified into the DAP-facing `stdout`/`stderr`
/// categories `4.2` specifies.
#[derive(Debug, Clone)]
pub struct ConsoleEvent {
    pub category: &'static str,
    pub text: String,
}

#[allow(clippy::upper_case_acronyms)]
pub struct GDB {
    pub process: Arc<Mutex<Child>>,
    is_running: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    correlator: Arc<Mutex<Correlator>>,
    async_events: broadcast::Sender<output::OutOfBandRecord>,
    console_events: broadcast::Sender<ConsoleEvent>,
    current_command_token: AtomicU64,
    binary_path: PathBuf,
    init_options: Vec<OsString>,
}

/// A builder struct for configuring and launching GDB with various command line options.
/// This struct provides a fluent interface for setting up GDB with different parameters
/// before spawning the debugger process.
pub struct GDBBuilder {
    /// Path to the GDB executable
    pub gdb_path: PathBuf,
    /// Do not read ~/.gdbinit file (--nh)
    pub opt_nh: bool,
    /// Do not read any .gdbinit files in any directory (--nx)
    pub opt_nx: bool,
    /// Do not print version number on startup (--quiet)
    pub opt_quiet: bool,
    /// Change current directory to DIR (--cd=DIR)
    pub opt_cd: Option<PathBuf>,
    /// Set serial port baud rate used for remote debugging (-b BAUDRATE)
    pub opt_bps: Option<u32>,
    /// Read symbols from SYMFILE (--symbols=SYMFILE)
    pub opt_symbol_file: Option<PathBuf>,
    /// Analyze the core dump COREFILE (--core=COREFILE)
    pub opt_core_file: Option<PathBuf>,
    /// Attach to running process PID (--pid=PID)
    pub opt_proc_id: Option<u32>,
    /// Execute GDB commands from FILE (--command=FILE)
    pub opt_command: Option<PathBuf>,
    /// Search for source files in DIR (--directory=DIR)
    pub opt_source_dir: Option<PathBuf>,
    /// Arguments to be passed to the inferior program (--args)
    pub opt_args: Vec<OsString>,
    /// The executable file to debug
    pub opt_program: Option<PathBuf>,
    /// Use TTY for input/output by the program being debugged (--tty=TTY)
    pub opt_tty: Option<PathBuf>,
}

impl GDBBuilder {
    pub fn new(gdb: PathBuf) -> Self {
        GDBBuilder {
            gdb_path: gdb,
            opt_nh: false,
            opt_nx: false,
            opt_quiet: false,
            opt_cd: None,
            opt_bps: None,
            opt_symbol_file: None,
            opt_core_file: None,
            opt_proc_id: None,
            opt_command: None,
            opt_source_dir: None,
            opt_args: Vec::new(),
            opt_program: None,
            opt_tty: None,
        }
    }

    pub fn try_spawn(self) -> AppResult<GDB> {
        let mut gdb_args = Vec::<OsString>::new();
        let mut init_options = Vec::<OsString>::new();
        if self.opt_nh {
            gdb_args.push("--nh".into());
            init_options.push("--nh".into());
        }
        if self.opt_nx {
            gdb_args.push("--nx".into());
            init_options.push("--nx".into());
        }
        if self.opt_quiet {
            gdb_args.push("--quiet".into());
        }
        if let Some(cd) = self.opt_cd {
            gdb_args.push("--cd=".into());
            gdb_args.last_mut().unwrap().push(&cd);
        }
        if let Some(bps) = self.opt_bps {
            gdb_args.push("-b".into());
            gdb_args.push(bps.to_string().into());
        }
        if let Some(symbol_file) = self.opt_symbol_file {
            gdb_args.push("--symbols=".into());
            gdb_args.last_mut().unwrap().push(&symbol_file);
        }
        if let Some(core_file) = self.opt_core_file {
            gdb_args.push("--core=".into());
            gdb_args.last_mut().unwrap().push(&core_file);
        }
        if let Some(proc_id) = self.opt_proc_id {
            gdb_args.push("--pid=".into());
            gdb_args.last_mut().unwrap().push(proc_id.to_string());
        }
        if let Some(command) = self.opt_command {
            gdb_args.push("--command=".into());
            gdb_args.last_mut().unwrap().push(&command);
        }
        if let Some(source_dir) = self.opt_source_dir {
            gdb_args.push("--directory=".into());
            gdb_args.last_mut().unwrap().push(&source_dir);
        }
        if let Some(tty) = self.opt_tty {
            gdb_args.push("--tty=".into());
            gdb_args.last_mut().unwrap().push(&tty);
        }
        if !self.opt_args.is_empty() {
            gdb_args.push("--args".into());
            gdb_args.push(
                self.opt_program
                    .ok_or(AppError::InvalidArgument(
                        "Program path is required if --args is provided".to_string(),
                    ))?
                    .into_os_string(),
            );
            for arg in self.opt_args {
                gdb_args.push(arg);
            }
        } else if let Some(program) = self.opt_program {
            gdb_args.push(program.into());
        }

        let mut command = Command::new(self.gdb_path.clone());
        command.arg("--interpreter=mi2").args(gdb_args);

        debug!("Starting GDB process with command: {:?}", command);

        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| AppError::GDBError(format!("Failed to start GDB process: {}", e)))?;

        let stdout = BufReader::new(child.stdout.take().unwrap());
        let is_running = Arc::new(AtomicBool::new(false));
        let closed = Arc::new(AtomicBool::new(false));
        let correlator = Arc::new(Mutex::new(Correlator::new()));
        let (async_events, _) = broadcast::channel(ASYNC_CHANNEL_CAPACITY);
        let (console_events, _) = broadcast::channel(CONSOLE_CHANNEL_CAPACITY);

        let (result_tx, result_rx) = mpsc::channel(100);
        let (oob_tx, oob_rx) = mpsc::channel(100);
        tokio::spawn(process_output(
            stdout,
            result_tx,
            oob_tx,
            is_running.clone(),
        ));
        tokio::spawn(dispatch_loop(
            result_rx,
            oob_rx,
            correlator.clone(),
            async_events.clone(),
            console_events.clone(),
            closed.clone(),
        ));

        let gdb = GDB {
            process: Arc::new(Mutex::new(child)),
            is_running,
            closed,
            correlator,
            async_events,
            console_events,
            current_command_token: AtomicU64::new(0),
            binary_path: self.gdb_path,
            init_options,
        };
        Ok(gdb)
    }
}

/// Reads parsed records off the two channels `process_output` feeds and
/// routes each to where `4.2` says it belongs: result records complete (or
/// fail) their correlator slot, async records go to `async_events`
/// subscribers, stream records become categorized `ConsoleEvent`s. Runs
/// until both channels close, at which point every slot still pending is
/// failed with `TransportClosed`.
async fn dispatch_loop(
    mut result_rx: mpsc::Receiver<output::ResultRecord>,
    mut oob_rx: mpsc::Receiver<output::OutOfBandRecord>,
    correlator: Arc<Mutex<Correlator>>,
    async_events: broadcast::Sender<output::OutOfBandRecord>,
    console_events: broadcast::Sender<ConsoleEvent>,
    closed: Arc<AtomicBool>,
) {
    loop {
        tokio::select! {
            result = result_rx.recv() => {
                match result {
                    Some(record) => dispatch_result(&correlator, record).await,
                    None => break,
                }
            }
            oob = oob_rx.recv() => {
                match oob {
                    Some(record) => dispatch_out_of_band(&async_events, &console_events, record),
                    None => break,
                }
            }
        }
    }
    closed.store(true, Ordering::SeqCst);
    correlator.lock().await.fail_all_closed();
}

async fn dispatch_result(correlator: &Arc<Mutex<Correlator>>, record: output::ResultRecord) {
    let Some(token) = record.token else {
        warn!("dropping unsolicited result record: {:?}", record.class);
        return;
    };
    let completion = match record.class {
        output::ResultClass::Done | output::ResultClass::Running | output::ResultClass::Connected => {
            Ok(record)
        }
        output::ResultClass::Error => {
            let msg = record
                .results
                .get("msg")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown GDB error")
                .to_string();
            Err(AppError::GDBError(msg))
        }
        output::ResultClass::Exit => Err(AppError::Protocol(format!(
            "unexpected result class for token {}: exit",
            token
        ))),
    };
    if !correlator.lock().await.complete(token, completion) {
        warn!("no pending command slot for token {}", token);
    }
}

fn dispatch_out_of_band(
    async_events: &broadcast::Sender<output::OutOfBandRecord>,
    console_events: &broadcast::Sender<ConsoleEvent>,
    record: output::OutOfBandRecord,
) {
    match record {
        output::OutOfBandRecord::AsyncRecord { .. } => {
            let _ = async_events.send(record);
        }
        output::OutOfBandRecord::StreamRecord { kind, data } => {
            let category = match kind {
                output::StreamKind::Console | output::StreamKind::Target => "stdout",
                output::StreamKind::Log => "stderr",
            };
            let _ = console_events.send(ConsoleEvent {
                category,
                text: data,
            });
        }
    }
}

impl GDB {
    #[cfg(unix)]
    pub async fn interrupt_execution(&self) -> Result<(), nix::Error> {
        use nix::sys::signal;
        use nix::unistd::Pid;
        signal::kill(
            Pid::from_raw(self.process.lock().await.id().unwrap() as i32),
            signal::SIGINT,
        )
    }

    #[cfg(windows)]
    pub async fn interrupt_execution(&self) -> Result<(), std::io::Error> {
        Ok(())
    }

    pub fn binary_path(&self) -> &Path {
        &self.binary_path
    }

    pub fn init_options(&self) -> &[OsString] {
        &self.init_options
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn new_token(&self) -> u64 {
        self.current_command_token.fetch_add(1, Ordering::SeqCst)
    }

    /// Subscribes to async exec/notify/status records. The session core
    /// decides which classes to act on; everything else is logged and
    /// dropped at that layer, not here.
    pub fn subscribe_async(&self) -> broadcast::Receiver<output::OutOfBandRecord> {
        self.async_events.subscribe()
    }

    /// Subscribes to console/target/log stream records, already
    /// categorized into `stdout`/`stderr`.
    pub fn subscribe_console(&self) -> broadcast::Receiver<ConsoleEvent> {
        self.console_events.subscribe()
    }

    /// Allocates a token, writes the command, and returns a future that
    /// resolves when the matching result record arrives. Safe to call
    /// concurrently: the stdin write is serialized by locking the child
    /// process only for the duration of the write, and correlation by
    /// token means interleaved in-flight commands never cross streams.
    pub async fn execute<C: std::borrow::Borrow<commands::MiCommand>>(
        &self,
        command: C,
    ) -> AppResult<output::ResultRecord> {
        if self.is_closed() {
            return Err(AppError::TransportClosed);
        }

        let token = self.new_token();
        let rx = self.correlator.lock().await.register(token);

        {
            let mut process = self.process.lock().await;
            let stdin = process
                .stdin
                .as_mut()
                .ok_or(AppError::TransportClosed)?;
            command
                .borrow()
                .write_interpreter_string(stdin, token)
                .await
                .map_err(AppError::IoError)?;
        }

        rx.await.unwrap_or(Err(AppError::TransportClosed))
    }

    /// Fire-and-forget issuance: writes the command and does not wait for
    /// (or even register a slot for) its result. Used for `-gdb-exit` and
    /// `-enable-pretty-printing`, whose results the launch sequence doesn't
    /// act on; the eventual unsolicited result is logged and dropped by
    /// the dispatch loop.
    pub async fn execute_later<C: std::borrow::Borrow<commands::MiCommand>>(
        &self,
        command: C,
    ) -> AppResult<()> {
        if self.is_closed() {
            return Err(AppError::TransportClosed);
        }

        let token = self.new_token();
        let mut process = self.process.lock().await;
        let stdin = process
            .stdin
            .as_mut()
            .ok_or(AppError::TransportClosed)?;
        command
            .borrow()
            .write_interpreter_string(stdin, token)
            .await
            .map_err(AppError::IoError)?;
        Ok(())
    }

    pub async fn is_session_active(&self) -> AppResult<bool> {
        let res = self.execute(commands::MiCommand::thread_info(None)).await?;
        Ok(!res.results["threads"].as_array().map_or(true, |a| a.is_empty()))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mi::output::{AsyncKind, ResultClass};
    use tokio::io::AsyncWriteExt;

    /// Drives `process_output` and `dispatch_loop` together over a
    /// `tokio::io::duplex`, standing in for GDB's stdout pipe without a real
    /// subprocess: a result record completes a correlator slot registered
    /// ahead of time, and a stream record reaches the console subscriber.
    #[tokio::test]
    async fn transport_pipeline_completes_a_pending_command_via_duplex() {
        let (mut client, server) = tokio::io::duplex(1024);

        let is_running = Arc::new(AtomicBool::new(false));
        let (result_tx, result_rx) = mpsc::channel(16);
        let (oob_tx, oob_rx) = mpsc::channel(16);
        tokio::spawn(process_output(server, result_tx, oob_tx, is_running));

        let correlator = Arc::new(Mutex::new(Correlator::new()));
        let (async_events, _async_sub) = broadcast::channel(16);
        let (console_events, mut console_rx) = broadcast::channel(16);
        let closed = Arc::new(AtomicBool::new(false));

        let rx = correlator.lock().await.register(7);

        tokio::spawn(dispatch_loop(
            result_rx,
            oob_rx,
            correlator.clone(),
            async_events,
            console_events,
            closed.clone(),
        ));

        client
            .write_all(b"~\"hello from gdb\\n\"\n7^done,value=\"42\"\n(gdb)\n")
            .await
            .unwrap();

        let console = console_rx.recv().await.unwrap();
        assert_eq!(console.category, "stdout");
        assert_eq!(console.text, "hello from gdb\n");

        let completion = rx.await.unwrap().unwrap();
        assert_eq!(completion.token, Some(7));
        assert_eq!(completion.class, ResultClass::Done);

        drop(client);
    }

    /// When the process side of the duplex closes, `process_output` hits
    /// EOF, its channels drop, `dispatch_loop` exits its select loop, and
    /// every slot still registered in the correlator is failed rather than
    /// left to hang forever.
    #[tokio::test]
    async fn closing_the_stream_fails_every_pending_slot() {
        let (client, server) = tokio::io::duplex(1024);
        let is_running = Arc::new(AtomicBool::new(false));
        let (result_tx, result_rx) = mpsc::channel(16);
        let (oob_tx, oob_rx) = mpsc::channel(16);
        tokio::spawn(process_output(server, result_tx, oob_tx, is_running));

        let correlator = Arc::new(Mutex::new(Correlator::new()));
        let (async_events, _) = broadcast::channel(16);
        let (console_events, _) = broadcast::channel(16);
        let closed = Arc::new(AtomicBool::new(false));

        let rx = correlator.lock().await.register(1);

        let dispatch_handle = tokio::spawn(dispatch_loop(
            result_rx,
            oob_rx,
            correlator.clone(),
            async_events,
            console_events,
            closed.clone(),
        ));

        drop(client);

        dispatch_handle.await.unwrap();
        assert!(closed.load(Ordering::SeqCst));
        assert!(matches!(rx.await.unwrap(), Err(AppError::TransportClosed)));
    }

    #[tokio::test]
    async fn dispatch_result_errors_are_delivered_as_gdb_errors() {
        let correlator = Arc::new(Mutex::new(Correlator::new()));
        let rx = correlator.lock().await.register(3);
        dispatch_result(
            &correlator,
            output::ResultRecord {
                token: Some(3),
                class: ResultClass::Error,
                results: serde_json::json!({ "msg": "no such breakpoint" }),
            },
        )
        .await;
        match rx.await.unwrap() {
            Err(AppError::GDBError(msg)) => assert_eq!(msg, "no such breakpoint"),
            other => panic!("expected GDBError, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn dispatch_result_with_no_token_is_dropped_without_panic() {
        let correlator = Arc::new(Mutex::new(Correlator::new()));
        dispatch_result(
            &correlator,
            output::ResultRecord {
                token: None,
                class: ResultClass::Done,
                results: serde_json::json!({}),
            },
        )
        .await;
        assert_eq!(correlator.lock().await.pending_count(), 0);
    }

    #[test]
    fn dispatch_out_of_band_routes_async_and_stream_records_separately() {
        let (async_events, mut async_rx) = broadcast::channel(16);
        let (console_events, mut console_rx) = broadcast::channel(16);

        dispatch_out_of_band(
            &async_events,
            &console_events,
            output::OutOfBandRecord::AsyncRecord {
                token: None,
                kind: AsyncKind::Exec,
                class: output::AsyncClass::Stopped,
                results: serde_json::json!({}),
            },
        );
        assert!(async_rx.try_recv().is_ok());
        assert!(console_rx.try_recv().is_err());

        dispatch_out_of_band(
            &async_events,
            &console_events,
            output::OutOfBandRecord::StreamRecord {
                kind: output::StreamKind::Log,
                data: "warning".to_string(),
            },
        );
        let console = console_rx.try_recv().unwrap();
        assert_eq!(console.category, "stderr");
        assert_eq!(console.text, "warning");
    }
}

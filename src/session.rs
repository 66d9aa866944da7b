//! The DAP Session Core: maps each DAP request to a deterministic sequence
//! of typed MI commands, mints frame/variable handles, and translates
//! async MI events into DAP events. See `4.5`.

use std::path::PathBuf;

use dap::events::{Event, OutputEventBody, StoppedEventBody, TerminatedEventBody};
use dap::requests::{Command, Request};
use dap::responses::{
    ContinueResponse, EvaluateResponse, ResponseBody, ScopesResponse, SetBreakpointsResponse,
    SetVariableResponse, StackTraceResponse, ThreadsResponse, VariablesResponse,
};
use dap::types::{
    Breakpoint, Capabilities, EvaluateArgumentsContext, OutputEventCategory, Scope,
    ScopePresentationhint, Source, StackFrame as DapStackFrame, StoppedEventReason, Thread,
    Variable as DapVariable,
};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::dap_bridge::DapBridge;
use crate::error::{AppError, AppResult};
use crate::handles::{FrameRef, HandleTables, VarRef};
use crate::mi::commands::{BreakPointLocation, MiCommand};
use crate::mi::output::{AsyncClass, OutOfBandRecord};
use crate::mi::{ConsoleEvent, GDB, GDBBuilder};
use crate::varobj::VarObjCache;

#[derive(Debug, Deserialize)]
struct LaunchArgs {
    gdb: Option<String>,
    program: String,
    arguments: Option<Vec<String>>,
    #[allow(dead_code)]
    target: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AttachArgs {
    gdb: Option<String>,
    #[allow(dead_code)]
    program: Option<String>,
    #[serde(rename = "processId")]
    process_id: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LaunchMode {
    Launch,
    Attach,
}

/// A breakpoint the client asked to be set before a debugger existed to
/// ask it of. Applied as soon as the session launches.
#[derive(Debug, Clone)]
struct PendingBreakpoints {
    source: Source,
    lines: Vec<i64>,
}

struct ActiveSession {
    gdb: GDB,
    mode: LaunchMode,
    running: bool,
    handles: HandleTables,
    varobjs: VarObjCache,
}

/// A launch/attach target supplied directly on the command line, for
/// headless use where no DAP client sends a `launch`/`attach` request over
/// the wire. Reuses the same [`DapSession::launch`]/[`DapSession::attach`]
/// handlers a real request would dispatch to.
#[derive(Debug, Clone)]
pub enum InitialAction {
    Launch { program: String },
    Attach { process_id: u32 },
}

pub struct DapSession {
    config: Config,
    pending_breakpoints: Vec<PendingBreakpoints>,
    active: Option<ActiveSession>,
    initial_action: Option<InitialAction>,
}

impl DapSession {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            pending_breakpoints: Vec::new(),
            active: None,
            initial_action: None,
        }
    }

    /// Arranges for `run` to launch or attach immediately, before servicing
    /// any DAP requests, instead of waiting for the client to send one.
    pub fn with_initial_action(mut self, action: InitialAction) -> Self {
        self.initial_action = Some(action);
        self
    }

    /// Drives the adapter to completion: alternates between DAP requests
    /// and, once a debugger is attached, its async/console events. This is
    /// the single logical dispatch task `5` describes; no locking is
    /// needed because nothing else touches `self`.
    pub async fn run(mut self, mut bridge: DapBridge) -> AppResult<()> {
        if let Some(action) = self.initial_action.take() {
            let outcome = match action {
                InitialAction::Launch { program } => {
                    self.launch(&bridge, Some(serde_json::json!({ "program": program }))).await
                }
                InitialAction::Attach { process_id } => {
                    self.attach(&bridge, Some(serde_json::json!({ "processId": process_id }))).await
                }
            };
            outcome?;
        }

        loop {
            let async_event = async {
                match &self.active {
                    Some(active) => Some(active.gdb.subscribe_async().recv().await),
                    None => std::future::pending().await,
                }
            };
            let console_event = async {
                match &self.active {
                    Some(active) => Some(active.gdb.subscribe_console().recv().await),
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                request = bridge.requests.recv() => {
                    match request {
                        Some(req) => {
                            let keep_going = self.handle_request(&bridge, req).await;
                            if !keep_going {
                                return Ok(());
                            }
                        }
                        None => {
                            info!("DAP input stream closed");
                            return Ok(());
                        }
                    }
                }
                Some(event) = async_event => {
                    if let Ok(record) = event {
                        self.handle_async_record(&bridge, record).await;
                    }
                }
                Some(event) = console_event => {
                    if let Ok(console) = event {
                        self.forward_console_event(&bridge, console).await;
                    }
                }
            }
        }
    }

    async fn handle_request(&mut self, bridge: &DapBridge, req: Request) -> bool {
        let seq = req.seq;
        let result = self.dispatch(bridge, &req.command).await;
        match result {
            Ok(RequestOutcome::Respond(body)) => {
                if let Err(e) = bridge.respond_success(seq, body).await {
                    warn!("failed to send DAP response: {}", e);
                }
            }
            Ok(RequestOutcome::Disconnect(body)) => {
                if let Err(e) = bridge.respond_success(seq, body).await {
                    warn!("failed to send DAP response: {}", e);
                }
                return false;
            }
            Err(e) => {
                if let Err(send_err) = bridge.respond_error(seq, e.to_string()).await {
                    warn!("failed to send DAP error response: {}", send_err);
                }
            }
        }
        true
    }

    async fn dispatch(&mut self, bridge: &DapBridge, command: &Command) -> AppResult<RequestOutcome> {
        match command {
            Command::Initialize(_) => Ok(RequestOutcome::Respond(ResponseBody::Initialize(
                Capabilities {
                    supports_configuration_done_request: Some(true),
                    supports_set_variable: Some(true),
                    ..Default::default()
                },
            ))),
            Command::Launch(args) => self.launch(bridge, args.additional_data.clone()).await,
            Command::Attach(args) => self.attach(bridge, args.additional_data.clone()).await,
            Command::SetBreakpoints(args) => self.set_breakpoints(args).await,
            Command::ConfigurationDone => self.configuration_done().await,
            Command::Threads => self.threads().await,
            Command::StackTrace(args) => self.stack_trace(args.thread_id).await,
            Command::Scopes(args) => self.scopes(args.frame_id),
            Command::Variables(args) => self.variables(args.variables_reference).await,
            Command::SetVariable(args) => {
                self.set_variable(args.variables_reference, &args.name, &args.value)
                    .await
            }
            Command::Next(_) => self.resume(MiCommand::exec_next(), ResponseBody::Next).await,
            Command::StepIn(_) => self.resume(MiCommand::exec_step(), ResponseBody::StepIn).await,
            Command::StepOut(_) => {
                self.resume(MiCommand::exec_finish(), ResponseBody::StepOut).await
            }
            Command::Continue(_) => {
                self.resume(
                    MiCommand::exec_continue(),
                    ResponseBody::Continue(ContinueResponse::default()),
                )
                .await
            }
            Command::Evaluate(args) => {
                let context = match &args.context {
                    Some(EvaluateArgumentsContext::Variables) => "variables",
                    Some(EvaluateArgumentsContext::Watch) => "watch",
                    Some(EvaluateArgumentsContext::Repl) => "repl",
                    Some(EvaluateArgumentsContext::Hover) => "hover",
                    Some(EvaluateArgumentsContext::Clipboard) => "clipboard",
                    Some(EvaluateArgumentsContext::String(s)) => s.as_str(),
                    None => "",
                };
                self.evaluate(context, &args.expression, args.frame_id)
                    .await
            }
            Command::Disconnect(_) => self.disconnect().await,
            other => {
                warn!("unhandled DAP request: {:?}", other);
                Err(AppError::InvalidArgument("unsupported request".to_string()))
            }
        }
    }

    async fn launch(&mut self, bridge: &DapBridge, data: Option<Value>) -> AppResult<RequestOutcome> {
        let data = data.ok_or_else(|| AppError::InvalidArgument("missing launch arguments".to_string()))?;
        let args: LaunchArgs = serde_json::from_value(data)
            .map_err(|e| AppError::InvalidArgument(format!("invalid launch arguments: {}", e)))?;

        let gdb_path: PathBuf = args.gdb.map(Into::into).unwrap_or_else(|| self.config.gdb_path.clone());
        let mut builder = GDBBuilder::new(gdb_path);
        builder.opt_quiet = true;
        let gdb = builder.try_spawn()?;

        gdb.execute_later(MiCommand::file_exec_and_symbols(std::path::Path::new(&args.program)))
            .await?;
        gdb.execute_later(MiCommand::enable_pretty_printing()).await?;
        if let Some(arguments) = args.arguments {
            gdb.execute_later(MiCommand::exec_arguments(arguments.into_iter().map(Into::into).collect()))
                .await?;
        }

        self.active = Some(ActiveSession {
            gdb,
            mode: LaunchMode::Launch,
            running: false,
            handles: HandleTables::new(),
            varobjs: VarObjCache::new(),
        });

        self.apply_pending_breakpoints().await;
        bridge.send_event(Event::Initialized).await?;
        Ok(RequestOutcome::Respond(ResponseBody::Launch))
    }

    async fn attach(&mut self, bridge: &DapBridge, data: Option<Value>) -> AppResult<RequestOutcome> {
        let data = data.ok_or_else(|| AppError::InvalidArgument("missing attach arguments".to_string()))?;
        let args: AttachArgs = serde_json::from_value(data)
            .map_err(|e| AppError::InvalidArgument(format!("invalid attach arguments: {}", e)))?;

        let gdb_path: PathBuf = args.gdb.map(Into::into).unwrap_or_else(|| self.config.gdb_path.clone());
        let builder = GDBBuilder::new(gdb_path);
        let gdb = builder.try_spawn()?;
        gdb.execute(MiCommand::target_attach(args.process_id)).await?;

        self.active = Some(ActiveSession {
            gdb,
            mode: LaunchMode::Attach,
            running: false,
            handles: HandleTables::new(),
            varobjs: VarObjCache::new(),
        });

        self.apply_pending_breakpoints().await;
        bridge.send_event(Event::Initialized).await?;
        Ok(RequestOutcome::Respond(ResponseBody::Attach))
    }

    async fn apply_pending_breakpoints(&mut self) {
        let pending = std::mem::take(&mut self.pending_breakpoints);
        for entry in pending {
            if let Err(e) = self.reconcile_breakpoints(&entry.source, &entry.lines).await {
                warn!("failed to apply pending breakpoints: {}", e);
            }
        }
    }

    /// Implements the reconciliation algorithm of `4.5`: after this call
    /// the set of breakpoints in `source` is exactly `lines`, matching by
    /// line only (two breakpoints on the same line collapse, per the
    /// documented simplification).
    async fn set_breakpoints(
        &mut self,
        args: &dap::requests::SetBreakpointsArguments,
    ) -> AppResult<RequestOutcome> {
        let lines: Vec<i64> = args
            .breakpoints
            .iter()
            .flatten()
            .map(|bp| bp.line)
            .collect();

        if self.active.is_none() {
            self.pending_breakpoints.retain(|p| p.source.path != args.source.path);
            self.pending_breakpoints.push(PendingBreakpoints {
                source: args.source.clone(),
                lines: lines.clone(),
            });
            let breakpoints = lines
                .iter()
                .map(|line| Breakpoint {
                    source: Some(args.source.clone()),
                    line: Some(*line),
                    verified: true,
                    ..Default::default()
                })
                .collect();
            return Ok(RequestOutcome::Respond(ResponseBody::SetBreakpoints(
                SetBreakpointsResponse { breakpoints },
            )));
        }

        let breakpoints = self.reconcile_breakpoints(&args.source, &lines).await?;
        Ok(RequestOutcome::Respond(ResponseBody::SetBreakpoints(
            SetBreakpointsResponse { breakpoints },
        )))
    }

    async fn reconcile_breakpoints(
        &mut self,
        source: &Source,
        requested_lines: &[i64],
    ) -> AppResult<Vec<Breakpoint>> {
        let active = self.active.as_ref().ok_or(AppError::TransportClosed)?;
        let Some(path) = source.path.as_ref() else {
            return Ok(Vec::new());
        };

        let listing = active.gdb.execute(MiCommand::breakpoints_list()).await?;
        let existing = listing
            .results
            .get("BreakpointTable")
            .and_then(|t| t.get("body"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut already_present: Vec<(i64, String)> = Vec::new();
        let mut to_delete: Vec<String> = Vec::new();
        for bp in &existing {
            let Some(fullname) = bp.get("fullname").and_then(Value::as_str) else {
                continue;
            };
            if fullname != path {
                continue;
            }
            let Some(line) = bp.get("line").and_then(Value::as_str).and_then(|s| s.parse::<i64>().ok())
            else {
                continue;
            };
            let Some(number) = bp.get("number").and_then(Value::as_str) else {
                continue;
            };
            if requested_lines.contains(&line) {
                already_present.push((line, number.to_string()));
            } else {
                to_delete.push(number.to_string());
            }
        }

        let mut breakpoints = Vec::new();
        for line in requested_lines {
            if let Some((_, number)) = already_present.iter().find(|(l, _)| l == line) {
                breakpoints.push(Breakpoint {
                    source: Some(source.clone()),
                    line: Some(*line),
                    id: number.parse().ok(),
                    verified: true,
                    ..Default::default()
                });
                continue;
            }
            let result = self
                .active
                .as_ref()
                .unwrap()
                .gdb
                .execute(MiCommand::insert_breakpoint(BreakPointLocation::Line(
                    std::path::Path::new(path),
                    *line as usize,
                )))
                .await?;
            let id = result
                .results
                .get("bkpt")
                .and_then(|b| b.get("number"))
                .and_then(Value::as_str)
                .and_then(|s| s.parse().ok());
            breakpoints.push(Breakpoint {
                source: Some(source.clone()),
                line: Some(*line),
                id,
                verified: id.is_some(),
                ..Default::default()
            });
        }

        if !to_delete.is_empty() {
            self.active
                .as_ref()
                .unwrap()
                .gdb
                .execute(MiCommand::delete_breakpoints(
                    to_delete.into_iter().map(Into::into).collect(),
                ))
                .await?;
        }

        Ok(breakpoints)
    }

    async fn configuration_done(&mut self) -> AppResult<RequestOutcome> {
        if let Some(active) = self.active.as_mut() {
            let run = match active.mode {
                LaunchMode::Attach => MiCommand::exec_continue(),
                LaunchMode::Launch => MiCommand::exec_run(),
            };
            active.gdb.execute(run).await?;
            active.running = true;
        }
        Ok(RequestOutcome::Respond(ResponseBody::ConfigurationDone))
    }

    /// DAP clients poll `threads` before `configurationDone` transitions
    /// to running; per `6` this returns an empty body without touching the
    /// debugger rather than erroring.
    async fn threads(&self) -> AppResult<RequestOutcome> {
        let Some(active) = self.active.as_ref().filter(|a| a.running) else {
            return Ok(RequestOutcome::Respond(ResponseBody::Threads(ThreadsResponse {
                threads: Vec::new(),
            })));
        };

        let result = active.gdb.execute(MiCommand::thread_info(None)).await?;
        let threads = result
            .results
            .get("threads")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
            .iter()
            .filter_map(|t| {
                let id = t.get("id").and_then(Value::as_str)?.parse().ok()?;
                let name = t
                    .get("name")
                    .or_else(|| t.get("target-id"))
                    .and_then(Value::as_str)
                    .unwrap_or("thread")
                    .to_string();
                Some(Thread { id, name })
            })
            .collect();
        Ok(RequestOutcome::Respond(ResponseBody::Threads(ThreadsResponse { threads })))
    }

    async fn stack_trace(&mut self, thread_id: i64) -> AppResult<RequestOutcome> {
        let active = self.active.as_mut().ok_or(AppError::TransportClosed)?;
        let result = active.gdb.execute(MiCommand::stack_list_frames(None, None)).await?;
        let stack = result
            .results
            .get("stack")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut stack_frames = Vec::new();
        for frame in stack {
            let level: i64 = frame
                .get("level")
                .and_then(Value::as_str)
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            let handle = active.handles.frames.alloc(FrameRef { thread_id, frame_id: level });
            let name = frame.get("func").and_then(Value::as_str).unwrap_or("??").to_string();
            let line = frame
                .get("line")
                .and_then(Value::as_str)
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            let source = frame.get("fullname").and_then(Value::as_str).map(|path| Source {
                path: Some(path.to_string()),
                ..Default::default()
            });
            stack_frames.push(DapStackFrame {
                id: handle,
                name,
                source,
                line,
                column: 0,
                ..Default::default()
            });
        }

        let total_frames = Some(stack_frames.len() as i64);
        Ok(RequestOutcome::Respond(ResponseBody::StackTrace(StackTraceResponse {
            stack_frames,
            total_frames,
        })))
    }

    /// Allocates one "Local" variable handle per frame, lazily, the first
    /// time `scopes` is called for that frame.
    fn scopes(&mut self, frame_handle: i64) -> AppResult<RequestOutcome> {
        let Some(active) = self.active.as_mut() else {
            return Ok(RequestOutcome::Respond(ResponseBody::Scopes(ScopesResponse {
                scopes: Vec::new(),
            })));
        };
        if active.handles.frames.get(frame_handle).is_none() {
            // Stale handle from a previous stop: DAP clients expect an empty
            // body here, not an error.
            return Ok(RequestOutcome::Respond(ResponseBody::Scopes(ScopesResponse {
                scopes: Vec::new(),
            })));
        }
        let variables_reference = active.handles.vars.alloc(VarRef::Frame { frame_handle });
        Ok(RequestOutcome::Respond(ResponseBody::Scopes(ScopesResponse {
            scopes: vec![Scope {
                name: "Locals".to_string(),
                presentation_hint: Some(ScopePresentationhint::Locals),
                variables_reference,
                expensive: false,
                ..Default::default()
            }],
        })))
    }

    async fn variables(&mut self, variables_reference: i64) -> AppResult<RequestOutcome> {
        let Some(active) = self.active.as_mut() else {
            return Ok(RequestOutcome::Respond(ResponseBody::Variables(VariablesResponse {
                variables: Vec::new(),
            })));
        };
        let Some(var_ref) = active.handles.vars.get(variables_reference).cloned() else {
            return Ok(RequestOutcome::Respond(ResponseBody::Variables(VariablesResponse {
                variables: Vec::new(),
            })));
        };

        let variables = match var_ref {
            VarRef::Frame { frame_handle } => frame_scope_variables(active, frame_handle).await?,
            VarRef::Object { frame_handle, varobj_name } => {
                object_scope_variables(active, frame_handle, &varobj_name, variables_reference).await?
            }
        };
        Ok(RequestOutcome::Respond(ResponseBody::Variables(VariablesResponse { variables })))
    }

    async fn set_variable(
        &mut self,
        variables_reference: i64,
        name: &str,
        value: &str,
    ) -> AppResult<RequestOutcome> {
        let active = self.active.as_mut().ok_or(AppError::TransportClosed)?;
        let Some(var_ref) = active.handles.vars.get(variables_reference).cloned() else {
            return Err(AppError::StaleHandle);
        };
        let (thread, frame, expression) = match &var_ref {
            VarRef::Frame { frame_handle } => {
                let fr = *active.handles.frames.get(*frame_handle).ok_or(AppError::StaleHandle)?;
                (fr.thread_id, fr.frame_id, name.to_string())
            }
            VarRef::Object { frame_handle, varobj_name } => {
                let fr = *active.handles.frames.get(*frame_handle).ok_or(AppError::StaleHandle)?;
                (fr.thread_id, fr.frame_id, format!("{}.{}", varobj_name, name))
            }
        };
        let depth = current_stack_depth(&active.gdb).await?;
        let varobj = active
            .varobjs
            .get(thread, frame, depth, &expression)
            .cloned()
            .ok_or_else(|| AppError::InvalidArgument(format!("unknown variable {}", expression)))?;

        active
            .gdb
            .execute(MiCommand::var_assign(varobj.varname.clone(), value))
            .await?;
        let refreshed = active
            .varobjs
            .update(&active.gdb, thread, frame, depth, &expression)
            .await?;
        let new_value = refreshed.map(|v| v.value).unwrap_or_else(|| value.to_string());
        Ok(RequestOutcome::Respond(ResponseBody::SetVariable(SetVariableResponse {
            value: new_value,
            ..Default::default()
        })))
    }

    async fn resume(&mut self, command: MiCommand, body: ResponseBody) -> AppResult<RequestOutcome> {
        let active = self.active.as_mut().ok_or(AppError::TransportClosed)?;
        active.gdb.execute(command).await?;
        Ok(RequestOutcome::Respond(body))
    }

    /// `repl` passes the expression straight through as a raw command;
    /// `watch` locates or creates a non-`isVar` varobj and keeps it fresh
    /// across steps. Any other context returns the default error body --
    /// no hover support is implemented.
    async fn evaluate(
        &mut self,
        context: &str,
        expression: &str,
        frame_id: Option<i64>,
    ) -> AppResult<RequestOutcome> {
        let active = self.active.as_mut().ok_or(AppError::TransportClosed)?;
        match context {
            "repl" => {
                let result = active.gdb.execute(MiCommand::cli_exec(expression)).await?;
                let text = result
                    .results
                    .get("msg")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                Ok(RequestOutcome::Respond(ResponseBody::Evaluate(EvaluateResponse {
                    result: text,
                    variables_reference: 0,
                    ..Default::default()
                })))
            }
            "watch" => {
                let frame_handle = frame_id.ok_or_else(|| {
                    AppError::InvalidArgument("watch evaluate requires a frameId".to_string())
                })?;
                let fr = *active.handles.frames.get(frame_handle).ok_or(AppError::StaleHandle)?;
                let depth = current_stack_depth(&active.gdb).await?;

                let existing = active.varobjs.get(fr.thread_id, fr.frame_id, depth, expression).cloned();
                let refreshed = if existing.is_some() {
                    active
                        .varobjs
                        .update(&active.gdb, fr.thread_id, fr.frame_id, depth, expression)
                        .await?
                } else {
                    None
                };
                let varobj = match refreshed {
                    Some(v) => v,
                    None => {
                        let created = active
                            .gdb
                            .execute(MiCommand::var_create(None, expression, None))
                            .await?;
                        active.varobjs.add(
                            fr.thread_id,
                            fr.frame_id,
                            depth,
                            expression,
                            false,
                            false,
                            &created.results,
                        )?
                    }
                };
                Ok(RequestOutcome::Respond(ResponseBody::Evaluate(EvaluateResponse {
                    result: varobj.value,
                    variables_reference: 0,
                    ..Default::default()
                })))
            }
            _ => Err(AppError::InvalidArgument(format!(
                "unsupported evaluate context: {}",
                context
            ))),
        }
    }

    async fn disconnect(&mut self) -> AppResult<RequestOutcome> {
        if let Some(active) = self.active.take() {
            let _ = active.gdb.execute_later(MiCommand::exit()).await;
        }
        Ok(RequestOutcome::Disconnect(ResponseBody::Disconnect))
    }

    async fn handle_async_record(&mut self, bridge: &DapBridge, record: OutOfBandRecord) {
        let OutOfBandRecord::AsyncRecord { class, results, .. } = record else {
            return;
        };
        match class {
            AsyncClass::Stopped => {
                let reason = results.get("reason").and_then(Value::as_str).unwrap_or("");
                if let Some(active) = self.active.as_mut() {
                    active.handles.reset_on_stop();
                }
                match reason {
                    "exited-normally" => {
                        if let Some(active) = self.active.as_mut() {
                            active.running = false;
                        }
                        let _ = bridge
                            .send_event(Event::Terminated(Some(TerminatedEventBody::default())))
                            .await;
                    }
                    "breakpoint-hit" => {
                        let thread_id = results.get("thread-id").and_then(Value::as_str).and_then(|s| s.parse().ok());
                        let _ = bridge
                            .send_event(Event::Stopped(StoppedEventBody {
                                reason: StoppedEventReason::Breakpoint,
                                description: None,
                                thread_id,
                                preserve_focus_hint: None,
                                text: None,
                                all_threads_stopped: None,
                                hit_breakpoint_ids: None,
                            }))
                            .await;
                    }
                    "end-stepping-range" => {
                        let thread_id = results.get("thread-id").and_then(Value::as_str).and_then(|s| s.parse().ok());
                        let _ = bridge
                            .send_event(Event::Stopped(StoppedEventBody {
                                reason: StoppedEventReason::Step,
                                description: None,
                                thread_id,
                                preserve_focus_hint: None,
                                text: None,
                                all_threads_stopped: None,
                                hit_breakpoint_ids: None,
                            }))
                            .await;
                    }
                    other => debug!("dropping stop reason not translated to a DAP event: {}", other),
                }
            }
            AsyncClass::Running => { /* DAP does not require a corresponding event */ }
            other => debug!("dropping async notify/status class: {:?}", other),
        }
    }

    async fn forward_console_event(&self, bridge: &DapBridge, event: ConsoleEvent) {
        let category = match event.category {
            "stderr" => OutputEventCategory::Stderr,
            _ => OutputEventCategory::Stdout,
        };
        let _ = bridge
            .send_event(Event::Output(OutputEventBody {
                category: Some(category),
                output: event.text,
                ..Default::default()
            }))
            .await;
    }
}

enum RequestOutcome {
    Respond(ResponseBody),
    Disconnect(ResponseBody),
}

async fn current_stack_depth(gdb: &GDB) -> AppResult<i64> {
    let result = gdb.execute(MiCommand::stack_info_depth()).await?;
    Ok(result
        .results
        .get("depth")
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0))
}

/// `4.5`'s frame-scope procedure: refresh every cached top-level varobj at
/// this stack context; re-enumerate via `-stack-list-variables` only if a
/// cached one fell out of scope or none existed yet.
async fn frame_scope_variables(active: &mut ActiveSession, frame_handle: i64) -> AppResult<Vec<DapVariable>> {
    let Some(fr) = active.handles.frames.get(frame_handle).copied() else {
        return Ok(Vec::new());
    };
    let depth = current_stack_depth(&active.gdb).await?;

    let cached: Vec<String> = active
        .varobjs
        .top_level_for(fr.thread_id, fr.frame_id, depth)
        .map(|v| v.expression.clone())
        .collect();

    let mut call_stack_changed = cached.is_empty();
    let mut results = Vec::new();
    for expression in &cached {
        match active.varobjs.update(&active.gdb, fr.thread_id, fr.frame_id, depth, expression).await? {
            Some(varobj) => results.push(to_dap_variable(active, frame_handle, &varobj)),
            None => call_stack_changed = true,
        }
    }

    if call_stack_changed {
        results.clear();
        let listing = active
            .gdb
            .execute(MiCommand::stack_list_variables(Some(fr.thread_id as usize), Some(fr.frame_id as usize)))
            .await?;
        let variables = listing
            .results
            .get("variables")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for variable in variables {
            let Some(name) = variable.get("name").and_then(Value::as_str) else {
                continue;
            };
            let varobj = if let Some(existing) = active.varobjs.get(fr.thread_id, fr.frame_id, depth, name) {
                existing.clone()
            } else {
                let created = active.gdb.execute(MiCommand::var_create(None, name, None)).await?;
                active.varobjs.add(fr.thread_id, fr.frame_id, depth, name, true, false, &created.results)?
            };
            results.push(to_dap_variable(active, frame_handle, &varobj));
        }
    }

    Ok(results)
}

/// `4.5`'s object-scope procedure: list children of a parent varobj,
/// synthesizing array-aware display names, creating or refreshing a
/// cached child varobj for each.
async fn object_scope_variables(
    active: &mut ActiveSession,
    frame_handle: i64,
    parent_varname: &str,
    parent_handle: i64,
) -> AppResult<Vec<DapVariable>> {
    let Some(fr) = active.handles.frames.get(frame_handle).copied() else {
        return Ok(Vec::new());
    };
    let depth = current_stack_depth(&active.gdb).await?;

    let parent = active
        .varobjs
        .by_varname(fr.thread_id, fr.frame_id, depth, parent_varname)
        .cloned();

    let result = active
        .gdb
        .execute(MiCommand::var_list_children(parent_varname.to_string(), true, None))
        .await?;
    let children = result.results.get("children").and_then(Value::as_array).cloned().unwrap_or_default();

    let mut variables = Vec::new();
    for child in children {
        let Some(raw_exp) = child.get("exp").and_then(Value::as_str) else {
            continue;
        };
        let display_name = match &parent {
            Some(p) => p.child_display_name(raw_exp),
            None => raw_exp.to_string(),
        };
        let varobj = if let Some(existing) = active.varobjs.get(fr.thread_id, fr.frame_id, depth, &display_name) {
            existing.clone()
        } else {
            active.varobjs.add(fr.thread_id, fr.frame_id, depth, &display_name, false, true, &child)?
        };
        variables.push(DapVariable {
            name: display_name.clone(),
            value: varobj.value.clone(),
            type_field: Some(varobj.r#type.clone()),
            variables_reference: if varobj.numchild > 0 {
                active.handles.vars.alloc(VarRef::Object {
                    frame_handle,
                    varobj_name: varobj.varname.clone(),
                })
            } else {
                0
            },
            ..Default::default()
        });
    }
    let _ = parent_handle;
    Ok(variables)
}

fn to_dap_variable(active: &mut ActiveSession, frame_handle: i64, varobj: &crate::varobj::VarObj) -> DapVariable {
    DapVariable {
        name: varobj.expression.clone(),
        value: varobj.value.clone(),
        type_field: Some(varobj.r#type.clone()),
        variables_reference: if varobj.numchild > 0 {
            active.handles.vars.alloc(VarRef::Object {
                frame_handle,
                varobj_name: varobj.varname.clone(),
            })
        } else {
            0
        },
        ..Default::default()
    }
}

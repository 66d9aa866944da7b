//! Bridges the synchronous `dap` crate transport (stdin/stdout framed JSON)
//! to the async session loop. `dap::server::Server` blocks on stdin reads,
//! so request polling runs on a dedicated OS thread; responses and events
//! share its `ServerOutput` handle, written to from async code via
//! `spawn_blocking` since `ServerOutput` itself is synchronous.

use std::io::{self, BufReader, BufWriter, Stdin, Stdout};
use std::sync::{Arc, Mutex};

use dap::events::Event;
use dap::requests::Request;
use dap::responses::{Response, ResponseBody, ResponseMessage};
use dap::server::{Server, ServerOutput};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{AppError, AppResult};

const REQUEST_CHANNEL_CAPACITY: usize = 64;

pub struct DapBridge {
    pub requests: mpsc::Receiver<Request>,
    output: Arc<Mutex<ServerOutput<Stdout>>>,
}

impl DapBridge {
    /// Spawns the blocking poll loop over stdin/stdout and returns the
    /// async-facing handle to it.
    pub fn spawn() -> Self {
        let input = BufReader::new(io::stdin());
        let output_writer = BufWriter::new(io::stdout());
        let server = Server::new(input, output_writer);
        let output = server.output.clone();

        let (tx, rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
        std::thread::spawn(move || poll_loop(server, tx));

        Self { requests: rx, output }
    }

    pub async fn respond_success(&self, seq: i64, body: ResponseBody) -> AppResult<()> {
        debug!("responding to request {}: {:?}", seq, body);
        let output = self.output.clone();
        run_blocking(move || {
            output
                .lock()
                .unwrap()
                .respond(Response {
                    request_seq: seq,
                    success: true,
                    message: None,
                    body: Some(body),
                    error: None,
                })
        })
        .await
    }

    pub async fn respond_error(&self, seq: i64, message: impl Into<String>) -> AppResult<()> {
        let message = message.into();
        debug!("responding to request {} with error: {}", seq, message);
        let output = self.output.clone();
        run_blocking(move || {
            output
                .lock()
                .unwrap()
                .respond(Response {
                    request_seq: seq,
                    success: false,
                    message: Some(ResponseMessage::Error(message)),
                    body: None,
                    error: None,
                })
        })
        .await
    }

    pub async fn send_event(&self, event: Event) -> AppResult<()> {
        let output = self.output.clone();
        run_blocking(move || output.lock().unwrap().send_event(event)).await
    }
}

async fn run_blocking<F>(f: F) -> AppResult<()>
where
    F: FnOnce() -> Result<(), dap::errors::ServerError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await?
        .map_err(|e| AppError::Protocol(e.to_string()))
}

fn poll_loop(mut server: Server<Stdin, Stdout>, tx: mpsc::Sender<Request>) {
    loop {
        match server.poll_request() {
            Ok(Some(req)) => {
                debug!("received DAP request {}: {:?}", req.seq, req.command);
                if tx.blocking_send(req).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("DAP input stream error: {}", e);
                break;
            }
        }
    }
}

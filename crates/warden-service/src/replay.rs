//! Scripted adapter: drives the interceptor traits from a JSON-lines file of
//! operations, one per line. Blank lines and `#` comments are skipped.
//!
//! ```text
//! {"op":"control","code":4,"payload":"4c425653..."}
//! {"op":"process_start","pid":300,"parent_pid":4,"image_path":"c:\\tools\\x.exe"}
//! {"op":"file","create":{"pid":300,"path":"c:\\a.txt","desired_access":2},
//!   "result":{"succeeded":true,"size":0,"disposition":"created"},
//!   "steps":[{"step":"write","position":0,"text":"hello"}]}
//! ```

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use parking_lot::Mutex;
use std::io::{BufRead, Write};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use warden_core::clock::ManualClock;
use warden_core::delivery::{ChannelError, EventChannel, WorkState};
use warden_core::events::to_json;
use warden_core::interceptor::{
    Disposition, FileCreate, FileCreated, FileInterceptor, HandleOpen, KeyDisposition, KeyOpen,
    ObjectInterceptor, PendingOutcome, PreCreate, ProcessInterceptor, RegistryInterceptor,
    Transfer, TransferStatus, ValueSet, Verdict,
};
use warden_core::process::ProcessIdentity;
use warden_core::reg_path::resolve_key_path;
use warden_core::Engine;

/// Consumer that prints every record as one JSON line.
pub struct JsonLinesChannel {
    out: Mutex<Box<dyn Write + Send>>,
}

impl JsonLinesChannel {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }
}

impl EventChannel for JsonLinesChannel {
    fn send(&self, record: &[u8], _timeout: Duration) -> Result<(), ChannelError> {
        let json = to_json(record).map_err(|e| ChannelError::Failed(e.to_string()))?;
        let mut out = self.out.lock();
        writeln!(out, "{json}").map_err(|e| ChannelError::Failed(e.to_string()))?;
        out.flush().map_err(|e| ChannelError::Failed(e.to_string()))
    }
}

fn yes() -> bool {
    true
}

/// Bytes given either as text or as hex.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Data {
    pub text: String,
    pub hex: String,
}

impl Data {
    fn bytes(&self) -> Result<Vec<u8>> {
        if self.hex.is_empty() {
            return Ok(self.text.as_bytes().to_vec());
        }
        hex::decode(&self.hex).map_err(|e| anyhow!("bad hex data: {e}"))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum FileStep {
    Write {
        position: u64,
        #[serde(flatten)]
        data: Data,
        #[serde(default)]
        status: Option<TransferStatus>,
    },
    Read {
        position: u64,
        #[serde(flatten)]
        data: Data,
        #[serde(default)]
        status: Option<TransferStatus>,
    },
    SetDisposition {
        info: Disposition,
        #[serde(default = "yes")]
        succeeded: bool,
    },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ScriptOp {
    /// A control command; the caller defaults to the host itself.
    Control {
        #[serde(default)]
        caller_pid: Option<u32>,
        code: u32,
        #[serde(default)]
        payload: String,
    },
    Advance {
        ms: u64,
    },
    ProcessStart(ProcessIdentity),
    ProcessExit {
        pid: u32,
        #[serde(default)]
        exit_code: u32,
        #[serde(default)]
        time_ms: u64,
    },
    File {
        create: FileCreate,
        result: FileCreated,
        #[serde(default)]
        steps: Vec<FileStep>,
        #[serde(default = "yes")]
        close_succeeded: bool,
    },
    CreateKey {
        key: KeyOpen,
        #[serde(default)]
        disposition: KeyDisposition,
        #[serde(default = "yes")]
        succeeded: bool,
    },
    OpenKey {
        key: KeyOpen,
    },
    SetValue {
        value: ValueSet,
        #[serde(default = "yes")]
        succeeded: bool,
    },
    DeleteKey {
        pid: u32,
        key_path: String,
        #[serde(default = "yes")]
        succeeded: bool,
    },
    DeleteValue {
        pid: u32,
        key_path: String,
        #[serde(default)]
        value_name: Option<String>,
        #[serde(default = "yes")]
        succeeded: bool,
    },
    RenameKey {
        pid: u32,
        key_path: String,
        #[serde(default)]
        new_name: Option<String>,
        #[serde(default = "yes")]
        succeeded: bool,
    },
    OpenProcess {
        handle: HandleOpen,
        /// Access the OS granted; defaults to what the pre-hook left.
        #[serde(default)]
        granted: Option<u32>,
        #[serde(default = "yes")]
        succeeded: bool,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    pub ops: usize,
    pub denied: usize,
    pub restricted: usize,
    pub rejected: usize,
}

pub struct Replayer {
    engine: Arc<Engine>,
    clock: Arc<ManualClock>,
    host_pid: u32,
    report: ReplayReport,
}

impl Replayer {
    pub fn new(engine: Arc<Engine>, clock: Arc<ManualClock>, host_pid: u32) -> Self {
        Self {
            engine,
            clock,
            host_pid,
            report: ReplayReport::default(),
        }
    }

    pub fn report(&self) -> ReplayReport {
        self.report
    }

    pub fn run<R: BufRead>(&mut self, script: R) -> Result<ReplayReport> {
        for (index, line) in script.lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let op: ScriptOp = serde_json::from_str(line)
                .with_context(|| format!("script line {}", index + 1))?;
            self.apply(op)
                .with_context(|| format!("script line {}", index + 1))?;
        }
        Ok(self.report)
    }

    pub fn apply(&mut self, op: ScriptOp) -> Result<()> {
        self.report.ops += 1;
        let engine = self.engine.clone();
        match op {
            ScriptOp::Control {
                caller_pid,
                code,
                payload,
            } => {
                let payload = hex::decode(&payload).map_err(|e| anyhow!("bad control payload: {e}"))?;
                let caller = caller_pid.unwrap_or(self.host_pid);
                if let Err(e) = engine.handle_control(caller, code, &payload) {
                    warn!(caller, code, error = %e, "scripted control command rejected");
                    self.report.rejected += 1;
                }
            }
            ScriptOp::Advance { ms } => self.clock.advance(ms),
            ScriptOp::ProcessStart(identity) => engine.processes().process_created(identity),
            ScriptOp::ProcessExit {
                pid,
                exit_code,
                time_ms,
            } => engine.processes().process_exited(pid, exit_code, time_ms),
            ScriptOp::File {
                create,
                result,
                steps,
                close_succeeded,
            } => self.file(&create, &result, steps, close_succeeded)?,
            ScriptOp::CreateKey {
                key,
                disposition,
                succeeded,
            } => {
                let registry = engine.registry();
                if self.verdict(registry.pre_create_key(&key)) {
                    if let Some(path) = resolve_key_path(key.root.as_deref(), key.complete_name.as_deref()) {
                        registry.post_create_key(key.pid, &path, disposition, succeeded);
                    }
                }
            }
            ScriptOp::OpenKey { key } => {
                self.verdict(engine.registry().pre_open_key(&key));
            }
            ScriptOp::SetValue { value, succeeded } => {
                let registry = engine.registry();
                if self.verdict(registry.pre_set_value(value.pid, &value.key_path)) {
                    registry.post_set_value(&value, succeeded);
                }
            }
            ScriptOp::DeleteKey {
                pid,
                key_path,
                succeeded,
            } => {
                let outcome = engine.registry().pre_delete_key(pid, &key_path);
                self.pending(outcome, succeeded);
            }
            ScriptOp::DeleteValue {
                pid,
                key_path,
                value_name,
                succeeded,
            } => {
                let outcome = engine
                    .registry()
                    .pre_delete_value(pid, &key_path, value_name.as_deref());
                self.pending(outcome, succeeded);
            }
            ScriptOp::RenameKey {
                pid,
                key_path,
                new_name,
                succeeded,
            } => {
                let outcome = engine
                    .registry()
                    .pre_rename_key(pid, &key_path, new_name.as_deref());
                self.pending(outcome, succeeded);
            }
            ScriptOp::OpenProcess {
                handle,
                granted,
                succeeded,
            } => {
                let objects = engine.objects();
                let decision = objects.pre_open_process(&handle);
                if decision.desired_access != handle.desired_access {
                    self.report.restricted += 1;
                }
                if let Some(token) = decision.token {
                    objects.post_open_process(token, granted.unwrap_or(decision.desired_access), succeeded);
                }
            }
        }
        self.drain();
        Ok(())
    }

    fn verdict(&mut self, verdict: Verdict) -> bool {
        if verdict == Verdict::Deny {
            self.report.denied += 1;
            return false;
        }
        true
    }

    fn pending(&mut self, outcome: PendingOutcome, succeeded: bool) {
        if self.verdict(outcome.verdict()) {
            if let Some(pending) = outcome.into_pending() {
                self.engine.registry().complete(pending, succeeded);
            }
        }
    }

    fn file(&mut self, create: &FileCreate, result: &FileCreated, steps: Vec<FileStep>, close_succeeded: bool) -> Result<()> {
        let files = self.engine.files();
        match files.pre_create(create) {
            PreCreate::Deny => {
                self.report.denied += 1;
                return Ok(());
            }
            PreCreate::Skip => {
                debug!(path = %create.path, "file not tracked");
                return Ok(());
            }
            PreCreate::Track => {}
        }
        let Some(mut handle) = files.post_create(create, result) else {
            return Ok(());
        };
        for step in steps {
            match step {
                FileStep::Write {
                    position,
                    data,
                    status,
                } => {
                    let bytes = data.bytes()?;
                    let io = Transfer {
                        position,
                        length: bytes.len() as u64,
                        ..Transfer::default()
                    };
                    if files.pre_write(&mut handle, &io) {
                        files.post_write(&mut handle, status.unwrap_or(TransferStatus::Success), &bytes);
                    }
                }
                FileStep::Read {
                    position,
                    data,
                    status,
                } => {
                    let bytes = data.bytes()?;
                    let io = Transfer {
                        position,
                        length: bytes.len() as u64,
                        ..Transfer::default()
                    };
                    if files.pre_read(&mut handle, &io) {
                        files.post_read(&mut handle, status.unwrap_or(TransferStatus::Success), &bytes);
                    }
                }
                FileStep::SetDisposition { info, succeeded } => {
                    if files.pre_set_disposition(&handle) {
                        files.post_set_disposition(&mut handle, info, succeeded);
                    }
                }
            }
        }
        files.cleanup(handle, close_succeeded);
        Ok(())
    }

    fn drain(&self) {
        while self.engine.pipeline().poll_once() == WorkState::MoreWork {}
    }
}

/// Runs a whole script and logs the summary.
pub fn replay<R: BufRead>(engine: Arc<Engine>, clock: Arc<ManualClock>, host_pid: u32, script: R) -> Result<ReplayReport> {
    let mut replayer = Replayer::new(engine, clock, host_pid);
    let report = replayer.run(script)?;
    info!(
        ops = report.ops,
        denied = report.denied,
        restricted = report.restricted,
        rejected = report.rejected,
        "replay finished"
    );
    Ok(report)
}

//! Control command dispatch.

use crate::config_store::ConfigStore;
use crate::delivery::DeliveryPipeline;
use crate::error::{EngineError, EngineResult};
use crate::process::ProcessInfoUpdate;
use crate::protocol::{ConfigId, ControlCode};
use crate::rules::PersistRequest;
use crate::state::EngineState;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Called with the new `LogLevel` whenever a config record supplies one.
pub type LogLevelHook = Arc<dyn Fn(u32) + Send + Sync>;

pub(crate) fn persist(store: &ConfigStore, request: PersistRequest) -> EngineResult<()> {
    match request.blob {
        Some(blob) => {
            debug!(id = ?request.id, size = blob.len(), "saving config blob");
            store.save(request.id, blob)
        }
        None => {
            debug!(id = ?request.id, "removing config blob");
            store.remove(request.id)
        }
    }
}

pub struct Controller {
    state: EngineState,
    pipeline: Arc<DeliveryPipeline>,
    store: Arc<ConfigStore>,
    log_hook: RwLock<Option<LogLevelHook>>,
}

impl Controller {
    pub fn new(state: EngineState, pipeline: Arc<DeliveryPipeline>, store: Arc<ConfigStore>) -> Self {
        Self {
            state,
            pipeline,
            store,
            log_hook: RwLock::new(None),
        }
    }

    pub fn set_log_level_hook(&self, hook: LogLevelHook) {
        *self.log_hook.write() = Some(hook);
    }

    pub(crate) fn notify_log_level(&self, level: u32) {
        let hook = self.log_hook.read().clone();
        if let Some(hook) = hook {
            hook(level);
        }
    }

    /// Runs one control command on behalf of `caller_pid`.
    pub fn dispatch(&self, caller_pid: u32, code: u32, payload: &[u8]) -> EngineResult<()> {
        let Some(code) = ControlCode::from_raw(code) else {
            warn!(pid = caller_pid, code, "unsupported control code");
            return Err(EngineError::NotSupported(code));
        };
        if code.requires_trusted_caller() && !self.state.is_trusted_pid(caller_pid) {
            warn!(pid = caller_pid, code = ?code, "control request from untrusted caller rejected");
            return Err(EngineError::AccessDenied { pid: caller_pid });
        }
        debug!(pid = caller_pid, code = ?code, size = payload.len(), "control request");

        match code {
            ControlCode::Start => {
                self.pipeline.start_monitoring();
                Ok(())
            }
            ControlCode::Stop => {
                self.pipeline.stop_monitoring(true);
                Ok(())
            }
            ControlCode::SetConfig => self.set_config(payload),
            ControlCode::UpdateFileRules => {
                if let Some(request) = self.state.rules.update_file_rules(payload)? {
                    persist(&self.store, request)?;
                }
                Ok(())
            }
            ControlCode::UpdateRegistryRules => {
                if let Some(request) = self.state.rules.update_registry_rules(payload)? {
                    persist(&self.store, request)?;
                }
                Ok(())
            }
            ControlCode::UpdateProcessRules => {
                let requests = self.state.rules.update_process_rules(payload)?;
                self.state.processes.reapply_all();
                for request in requests {
                    persist(&self.store, request)?;
                }
                Ok(())
            }
            ControlCode::SetProcessInfo => {
                let update = ProcessInfoUpdate::parse(payload)?;
                self.state.processes.apply_info(&update);
                Ok(())
            }
        }
    }

    fn set_config(&self, payload: &[u8]) -> EngineResult<()> {
        let load = self.state.config.load_record(payload)?;
        info!(fields = format_args!("{:#x}", load.changed_fields), "configuration loaded");
        if load.reported_changed {
            let record = self.state.config.save_record()?;
            self.store.save(ConfigId::Main, record)?;
        }
        if load.pipeline_reload {
            self.pipeline.reload_config();
        }
        if load.log_level_changed {
            self.notify_log_level(self.state.config().log_level);
        }
        Ok(())
    }
}

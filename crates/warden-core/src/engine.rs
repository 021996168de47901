//! Wires the monitors, the control dispatcher and the delivery pipeline
//! around one shared state.

use crate::clock::{Clock, SystemClock};
use crate::config::{Config, ConfigCell};
use crate::config_store::{BlobBackend, ConfigStore};
use crate::control::{Controller, LogLevelHook};
use crate::delivery::{DeliveryError, DeliveryPipeline, EventChannel};
use crate::error::EngineResult;
use crate::file_monitor::FileMonitor;
use crate::hashing::HashAlgorithm;
use crate::object_monitor::ObjectMonitor;
use crate::process::{NoProcessInfo, ProcessInfoSource, ProcessOption};
use crate::process_monitor::ProcessMonitor;
use crate::protocol::ConfigId;
use crate::registry_monitor::RegistryMonitor;
use crate::state::EngineState;
use serde::{Deserialize, Serialize};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::{info, warn};

const PROCESS_BLOBS: [ConfigId; 4] = [
    ConfigId::TrustedProcess,
    ConfigId::ProtectedProcess,
    ConfigId::InjectProcess,
    ConfigId::SendEventProcess,
];

pub struct EngineOptions {
    pub config: Config,
    pub backend: Box<dyn BlobBackend>,
    pub clock: Arc<dyn Clock>,
    pub process_info: Arc<dyn ProcessInfoSource>,
    pub hasher: Option<Arc<dyn HashAlgorithm>>,
    /// Pid of the hosting process; it is always trusted.
    pub self_pid: u32,
}

impl EngineOptions {
    pub fn new(backend: Box<dyn BlobBackend>) -> Self {
        Self {
            config: Config::default(),
            backend,
            clock: Arc::new(SystemClock::default()),
            process_info: Arc::new(NoProcessInfo),
            hasher: None,
            self_pid: std::process::id(),
        }
    }
}

/// Point-in-time view reported over the control channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStatus {
    pub monitoring: bool,
    pub consumer_pid: Option<u32>,
    pub queued: usize,
    pub queued_bytes: usize,
    pub sent: u64,
    pub processes: usize,
}

pub struct Engine {
    state: EngineState,
    pipeline: Arc<DeliveryPipeline>,
    store: Arc<ConfigStore>,
    controller: Controller,
    files: FileMonitor,
    registry: RegistryMonitor,
    objects: ObjectMonitor,
    processes: ProcessMonitor,
}

impl Engine {
    pub fn new(options: EngineOptions) -> Self {
        let config = Arc::new(ConfigCell::new(options.config));
        let monitoring = Arc::new(AtomicBool::new(false));
        let pipeline = Arc::new(DeliveryPipeline::new(
            config.clone(),
            options.clock.clone(),
            monitoring.clone(),
        ));
        let mut state = EngineState::new(
            config,
            pipeline.clone(),
            options.clock,
            options.process_info,
            options.self_pid,
        )
        .with_monitoring(monitoring);
        if let Some(hasher) = options.hasher {
            state = state.with_hasher(hasher);
        }
        let store = Arc::new(ConfigStore::new(options.backend));
        Self {
            controller: Controller::new(state.clone(), pipeline.clone(), store.clone()),
            files: FileMonitor::new(state.clone()),
            registry: RegistryMonitor::new(state.clone()),
            objects: ObjectMonitor::new(state.clone()),
            processes: ProcessMonitor::new(state.clone()),
            state,
            pipeline,
            store,
        }
    }

    /// Loads the blob store and replays every saved blob. A blob that fails
    /// to apply is skipped.
    pub fn initialize(&self) -> EngineResult<()> {
        self.store.initialize()?;

        if let Some(main) = self.store.load(ConfigId::Main) {
            match self.state.config.load_record(&main) {
                Ok(load) => {
                    self.pipeline.reload_config();
                    if load.log_level_changed {
                        self.controller.notify_log_level(self.state.config().log_level);
                    }
                }
                Err(e) => warn!(error = %e, "saved configuration skipped"),
            }
        }
        if let Some(blob) = self.store.load(ConfigId::ProtectedFiles) {
            if let Err(e) = self.state.rules.update_file_rules(&blob) {
                warn!(error = %e, "saved file rules skipped");
            }
        }
        if let Some(blob) = self.store.load(ConfigId::ProtectedRegKeys) {
            if let Err(e) = self.state.rules.update_registry_rules(&blob) {
                warn!(error = %e, "saved registry rules skipped");
            }
        }
        for id in PROCESS_BLOBS {
            let Some(blob) = self.store.load(id) else {
                continue;
            };
            if let Err(e) = self.state.rules.update_process_rules(&blob) {
                warn!(id = ?id, error = %e, "saved process rules skipped");
            }
        }
        self.state.processes.reapply_all();
        info!("engine initialized");
        Ok(())
    }

    /// Starts the delivery worker thread.
    pub fn spawn_delivery(&self) -> std::io::Result<()> {
        self.pipeline.spawn_worker()
    }

    pub fn shutdown(&self) {
        self.pipeline.shutdown();
    }

    pub fn set_log_level_hook(&self, hook: LogLevelHook) {
        self.controller.set_log_level_hook(hook);
    }

    pub fn handle_control(&self, caller_pid: u32, code: u32, payload: &[u8]) -> EngineResult<()> {
        self.controller.dispatch(caller_pid, code, payload)
    }

    /// Attaches the event consumer. It becomes trusted and its own
    /// operations stop producing events.
    pub fn connect_consumer(&self, pid: u32, channel: Arc<dyn EventChannel>) -> Result<(), DeliveryError> {
        self.pipeline.connect(pid, channel)?;
        self.state.processes.set_forced(pid, ProcessOption::Trusted, true);
        self.state.processes.set_forced(pid, ProcessOption::SendEvents, false);
        Ok(())
    }

    pub fn disconnect_consumer(&self) -> Result<u32, DeliveryError> {
        self.pipeline.disconnect()
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            monitoring: self.pipeline.is_monitoring(),
            consumer_pid: self.pipeline.consumer_pid(),
            queued: self.pipeline.queued(),
            queued_bytes: self.pipeline.queued_bytes(),
            sent: self.pipeline.sent(),
            processes: self.state.processes.table().snapshot().len(),
        }
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn pipeline(&self) -> &Arc<DeliveryPipeline> {
        &self.pipeline
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    pub fn files(&self) -> &FileMonitor {
        &self.files
    }

    pub fn registry(&self) -> &RegistryMonitor {
        &self.registry
    }

    pub fn objects(&self) -> &ObjectMonitor {
        &self.objects
    }

    pub fn processes(&self) -> &ProcessMonitor {
        &self.processes
    }
}

use crate::clock::Clock;
use crate::config::{Config, ConfigCell};
use crate::events::EventSink;
use crate::hashing::{Blake3Digest64, HashAlgorithm};
use crate::lbvs::CodecError;
use crate::process::{ProcessContext, ProcessInfoSource, ProcessOption, ProcessRegistry};
use crate::rules::RuleStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::error;

/// Everything the interception paths share. Cheap to clone.
#[derive(Clone)]
pub struct EngineState {
    pub config: Arc<ConfigCell>,
    pub rules: Arc<RuleStore>,
    pub processes: Arc<ProcessRegistry>,
    pub sink: Arc<dyn EventSink>,
    pub clock: Arc<dyn Clock>,
    pub hasher: Arc<dyn HashAlgorithm>,
    pub monitoring: Arc<AtomicBool>,
}

impl EngineState {
    pub fn new(
        config: Arc<ConfigCell>,
        sink: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
        source: Arc<dyn ProcessInfoSource>,
        self_pid: u32,
    ) -> Self {
        let rules = Arc::new(RuleStore::new());
        let processes = Arc::new(ProcessRegistry::new(rules.clone(), source, self_pid));
        Self {
            config,
            rules,
            processes,
            sink,
            clock,
            hasher: Arc::new(Blake3Digest64),
            monitoring: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_hasher(mut self, hasher: Arc<dyn HashAlgorithm>) -> Self {
        self.hasher = hasher;
        self
    }

    pub fn with_monitoring(mut self, monitoring: Arc<AtomicBool>) -> Self {
        self.monitoring = monitoring;
        self
    }

    pub fn config(&self) -> Arc<Config> {
        self.config.snapshot()
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitoring.load(Ordering::SeqCst)
    }

    pub fn set_monitoring(&self, on: bool) {
        self.monitoring.store(on, Ordering::SeqCst);
    }

    pub fn tick(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Trusted callers bypass every self-protection check. Disabling
    /// self-protection makes everyone trusted.
    pub fn is_trusted(&self, ctx: &ProcessContext) -> bool {
        self.config().disable_self_protection || ctx.value(ProcessOption::Trusted)
    }

    pub fn is_trusted_pid(&self, pid: u32) -> bool {
        self.is_trusted(&self.processes.context(pid))
    }

    /// False for allow-listed processes, whose operations produce no events.
    pub fn sends_events(&self, pid: u32) -> bool {
        self.processes.value(pid, ProcessOption::SendEvents)
    }

    /// Hands a finished record to the sink; an encoding failure drops the event.
    pub fn submit(&self, record: Result<Vec<u8>, CodecError>) {
        match record {
            Ok(record) => self.sink.submit(record),
            Err(e) => error!(error = %e, "event encoding failed, event dropped"),
        }
    }
}

use crate::error::EngineResult;
use crate::lbvs::{Field, LbvsReader, LbvsWriter};
use crate::protocol::{reg_type, ConfigField, SysmonEvent};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

pub const DEFAULT_MAX_QUEUE_SIZE: u64 = 2 * 1000 * 1024;
pub const DEFAULT_CONNECTION_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_SEND_MSG_TIMEOUT_MS: u64 = 2_000;
pub const DEFAULT_MAX_REG_VALUE_SIZE: u64 = 64 * 1024;
pub const DEFAULT_MIN_FULL_ACT_FILE_SIZE: u64 = 1;
pub const DEFAULT_MAX_FULL_ACT_FILE_SIZE: u64 = 85 * 1024 * 1024;
pub const DEFAULT_OPEN_PROCESS_REPEAT_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_REG_EVENT_REPEAT_TIMEOUT_MS: u64 = 10_000;

/// Fields whose change requires the delivery pipeline to pick up new limits.
const PIPELINE_FIELDS: u32 = (1 << ConfigField::ConnectionTimeout as u32)
    | (1 << ConfigField::MaxQueueSize as u32)
    | (1 << ConfigField::SendMsgTimeout as u32);

/// One immutable configuration snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub disable_self_protection: bool,
    pub max_queue_size: u64,
    pub connection_timeout_ms: u64,
    pub send_msg_timeout_ms: u64,
    pub enable_dll_inject: bool,
    pub log_level: u32,
    pub log_file: Option<String>,
    pub event_flags: u64,
    pub sent_reg_types: u64,
    pub max_reg_value_size: u64,
    pub min_full_act_file_size: u64,
    pub max_full_act_file_size: u64,
    pub file_mon_name_mask: Option<String>,
    pub injected_dlls: Vec<String>,
    pub verify_injected_dll: bool,
    pub open_process_repeat_timeout_ms: u64,
    pub reg_event_repeat_timeout_ms: u64,
    /// Scalar fields explicitly set through `SetConfig`; only these are persisted.
    pub explicit_fields: u32,
}

impl Default for Config {
    fn default() -> Self {
        let reg_bits = [
            reg_type::SZ,
            reg_type::EXPAND_SZ,
            reg_type::DWORD,
            reg_type::DWORD_BIG_ENDIAN,
            reg_type::MULTI_SZ,
            reg_type::QWORD,
        ]
        .iter()
        .fold(0u64, |acc, t| acc | (1u64 << t));
        Self {
            disable_self_protection: false,
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            connection_timeout_ms: DEFAULT_CONNECTION_TIMEOUT_MS,
            send_msg_timeout_ms: DEFAULT_SEND_MSG_TIMEOUT_MS,
            enable_dll_inject: false,
            log_level: 2,
            log_file: None,
            event_flags: u64::MAX,
            sent_reg_types: reg_bits,
            max_reg_value_size: DEFAULT_MAX_REG_VALUE_SIZE,
            min_full_act_file_size: DEFAULT_MIN_FULL_ACT_FILE_SIZE,
            max_full_act_file_size: DEFAULT_MAX_FULL_ACT_FILE_SIZE,
            file_mon_name_mask: None,
            injected_dlls: Vec::new(),
            verify_injected_dll: false,
            open_process_repeat_timeout_ms: DEFAULT_OPEN_PROCESS_REPEAT_TIMEOUT_MS,
            reg_event_repeat_timeout_ms: DEFAULT_REG_EVENT_REPEAT_TIMEOUT_MS,
            explicit_fields: 0,
        }
    }
}

impl Config {
    pub fn event_enabled(&self, event: SysmonEvent) -> bool {
        self.event_flags & event.mask() != 0
    }

    pub fn any_file_event_enabled(&self) -> bool {
        SysmonEvent::ALL
            .iter()
            .any(|e| e.is_file_event() && self.event_enabled(*e))
    }

    pub fn reg_type_enabled(&self, value_type: u32) -> bool {
        value_type < 64 && self.sent_reg_types & (1u64 << value_type) != 0
    }

    pub fn in_full_act_window(&self, size: u64) -> bool {
        size >= self.min_full_act_file_size && size <= self.max_full_act_file_size
    }

    /// True when the path should produce file events under the name mask.
    pub fn file_mask_allows(&self, path: &str) -> bool {
        match self.file_mon_name_mask.as_deref() {
            None | Some("") => true,
            Some(mask) => crate::rules::ends_with_ignore_case(path, mask),
        }
    }
}

/// Result of applying a `SetConfig` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigLoad {
    /// Scalar fields successfully read from this record.
    pub changed_fields: u32,
    /// Whether the caller should persist the `Main` blob.
    ///
    /// Always true, including for a record that changed nothing. Kept as
    /// observed behavior; `changed_fields` carries the precise answer.
    pub reported_changed: bool,
    /// Queue size or a channel timeout changed.
    pub pipeline_reload: bool,
    /// Log level was supplied.
    pub log_level_changed: bool,
}

fn read_u64(field: &Field<'_>, slot: &mut u64) -> bool {
    match field.as_u64() {
        Ok(v) => {
            *slot = v;
            true
        }
        Err(e) => {
            warn!(field = field.id, error = %e, "config field ignored");
            false
        }
    }
}

fn read_bool(field: &Field<'_>, slot: &mut bool) -> bool {
    match field.as_bool() {
        Ok(v) => {
            *slot = v;
            true
        }
        Err(e) => {
            warn!(field = field.id, error = %e, "config field ignored");
            false
        }
    }
}

/// Applies a `SetConfig` record on top of `base`. A malformed record is
/// rejected whole; a field of the wrong type is skipped.
pub fn apply_record(base: &Config, payload: &[u8]) -> EngineResult<(Config, ConfigLoad)> {
    let fields = LbvsReader::new(payload)?.collect()?;
    let mut cfg = base.clone();
    let mut changed = 0u32;
    let mut injected = Vec::new();

    for field in &fields {
        let Some(id) = ConfigField::from_raw(u32::from(field.id)) else {
            continue;
        };
        let read = match id {
            ConfigField::ConnectionTimeout => read_u64(field, &mut cfg.connection_timeout_ms),
            ConfigField::MaxQueueSize => read_u64(field, &mut cfg.max_queue_size),
            ConfigField::SendMsgTimeout => read_u64(field, &mut cfg.send_msg_timeout_ms),
            ConfigField::EventFlags => read_u64(field, &mut cfg.event_flags),
            ConfigField::MaxFullActFileSize => read_u64(field, &mut cfg.max_full_act_file_size),
            ConfigField::MaxRegValueSize => read_u64(field, &mut cfg.max_reg_value_size),
            ConfigField::MinFullActFileSize => read_u64(field, &mut cfg.min_full_act_file_size),
            ConfigField::SentRegTypes => read_u64(field, &mut cfg.sent_reg_types),
            ConfigField::OpenProcessRepeatTimeout => {
                read_u64(field, &mut cfg.open_process_repeat_timeout_ms)
            }
            ConfigField::RegEventRepeatTimeout => {
                read_u64(field, &mut cfg.reg_event_repeat_timeout_ms)
            }
            ConfigField::EnableDllInject => read_bool(field, &mut cfg.enable_dll_inject),
            ConfigField::VerifyInjectedDll => read_bool(field, &mut cfg.verify_injected_dll),
            ConfigField::LogLevel => match field.as_u32() {
                Ok(v) => {
                    cfg.log_level = v;
                    true
                }
                Err(_) => false,
            },
            ConfigField::LogFile => {
                if let Ok(path) = field.as_string() {
                    cfg.log_file = Some(path);
                }
                false
            }
            ConfigField::FileMonNameMask => {
                if let Ok(mask) = field.as_string() {
                    cfg.file_mon_name_mask = (!mask.is_empty()).then_some(mask);
                }
                false
            }
            ConfigField::InjectedDll => {
                if let Ok(dll) = field.as_string() {
                    injected.push(dll);
                }
                false
            }
            ConfigField::DisableSelfProtection => {
                if let Ok(disable) = field.as_bool() {
                    if disable != cfg.disable_self_protection {
                        cfg.disable_self_protection = disable;
                        info!(
                            state = if disable { "disabled" } else { "enabled" },
                            "self-protection state changed"
                        );
                    }
                }
                false
            }
        };
        if read {
            changed |= id.bit();
        }
    }

    if !injected.is_empty() {
        cfg.injected_dlls = injected;
    }
    cfg.explicit_fields |= changed;

    let load = ConfigLoad {
        changed_fields: changed,
        reported_changed: true,
        pipeline_reload: changed & PIPELINE_FIELDS != 0,
        log_level_changed: changed & ConfigField::LogLevel.bit() != 0,
    };
    Ok((cfg, load))
}

/// Serializes the explicitly-set fields, the name mask and the injected DLLs.
pub fn save_record(cfg: &Config) -> EngineResult<Vec<u8>> {
    let mut w = LbvsWriter::new();
    let set = |f: ConfigField| cfg.explicit_fields & f.bit() != 0;

    for (field, value) in [
        (ConfigField::ConnectionTimeout, cfg.connection_timeout_ms),
        (ConfigField::MaxQueueSize, cfg.max_queue_size),
        (ConfigField::SendMsgTimeout, cfg.send_msg_timeout_ms),
        (ConfigField::EventFlags, cfg.event_flags),
        (ConfigField::MaxFullActFileSize, cfg.max_full_act_file_size),
        (ConfigField::MaxRegValueSize, cfg.max_reg_value_size),
        (ConfigField::MinFullActFileSize, cfg.min_full_act_file_size),
        (ConfigField::SentRegTypes, cfg.sent_reg_types),
        (ConfigField::OpenProcessRepeatTimeout, cfg.open_process_repeat_timeout_ms),
        (ConfigField::RegEventRepeatTimeout, cfg.reg_event_repeat_timeout_ms),
    ] {
        if set(field) {
            w.write_u64(field, value);
        }
    }
    if set(ConfigField::LogLevel) {
        w.write_u32(ConfigField::LogLevel, cfg.log_level);
    }
    if set(ConfigField::EnableDllInject) {
        w.write_bool(ConfigField::EnableDllInject, cfg.enable_dll_inject);
    }
    if set(ConfigField::VerifyInjectedDll) {
        w.write_bool(ConfigField::VerifyInjectedDll, cfg.verify_injected_dll);
    }
    if let Some(mask) = &cfg.file_mon_name_mask {
        w.write_wstr(ConfigField::FileMonNameMask, mask)?;
    }
    for dll in &cfg.injected_dlls {
        w.write_wstr(ConfigField::InjectedDll, dll)?;
    }
    Ok(w.finish()?)
}

/// Tracing level for a `LogLevel` value; anything above 4 is trace.
pub fn tracing_level(log_level: u32) -> tracing::Level {
    match log_level {
        0 => tracing::Level::ERROR,
        1 => tracing::Level::WARN,
        2 => tracing::Level::INFO,
        3 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    }
}

/// Copy-on-write holder for the live configuration.
#[derive(Debug, Default)]
pub struct ConfigCell {
    current: RwLock<Arc<Config>>,
    writer: Mutex<()>,
}

impl ConfigCell {
    pub fn new(cfg: Config) -> Self {
        Self {
            current: RwLock::new(Arc::new(cfg)),
            writer: Mutex::new(()),
        }
    }

    pub fn snapshot(&self) -> Arc<Config> {
        self.current.read().clone()
    }

    pub fn load_record(&self, payload: &[u8]) -> EngineResult<ConfigLoad> {
        let _guard = self.writer.lock();
        let base = self.snapshot();
        let (next, load) = apply_record(&base, payload)?;
        *self.current.write() = Arc::new(next);
        Ok(load)
    }

    pub fn save_record(&self) -> EngineResult<Vec<u8>> {
        let _guard = self.writer.lock();
        save_record(&self.snapshot())
    }

    /// Applies `change` to a copy of the current snapshot and publishes it.
    pub fn update(&self, change: impl FnOnce(&mut Config)) {
        let _guard = self.writer.lock();
        let mut next = (*self.snapshot()).clone();
        change(&mut next);
        *self.current.write() = Arc::new(next);
    }
}

//! Registry self-protection and change events.
//!
//! Create, open and set-value decide in the pre-hook and report from the
//! post-hook. Delete, delete-value and rename lose the key name once the
//! operation runs, so their record is built up front and carried to the
//! post-hook in a [`PendingEvent`].

use crate::access::key;
use crate::error::{EngineError, EngineResult};
use crate::interceptor::{KeyDisposition, KeyOpen, PendingOutcome, RegistryInterceptor, ValueSet, Verdict};
use crate::lbvs::LbvsWriter;
use crate::protocol::{reg_type, EventField, SysmonEvent};
use crate::reg_path;
use crate::rules::Effect;
use crate::state::EngineState;
use tracing::{debug, error, info, trace};

/// A record built before the operation, sent only if it succeeds.
#[derive(Debug)]
pub struct PendingEvent {
    event: SysmonEvent,
    pid: u32,
    record: Vec<u8>,
}

impl PendingEvent {
    pub fn event(&self) -> SysmonEvent {
        self.event
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

/// Access check for an effect, widened to subkey creation for recursive
/// read-only rules.
fn access_allowed(effect: Effect, desired_access: u32) -> bool {
    if desired_access == 0 {
        return true;
    }
    match effect {
        Effect::Full => true,
        Effect::Deny => false,
        Effect::ReadOnly { recursive } => {
            let mask = if recursive {
                key::RECURSIVE_WRITE_MASK
            } else {
                key::WRITE_MASK
            };
            desired_access & mask == 0
        }
    }
}

fn utf16_units(data: &[u8]) -> Vec<u16> {
    data.chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

fn fixed<const N: usize>(data: &[u8], kind: &str) -> EngineResult<[u8; N]> {
    data.get(..N)
        .and_then(|head| <[u8; N]>::try_from(head).ok())
        .ok_or_else(|| {
            EngineError::invalid(
                EventField::RegistryRawData,
                format!("{kind} value of {} bytes", data.len()),
            )
        })
}

/// Writes value data as `RegistryRawData` in the form its type calls for.
///
/// Strings stop at the first NUL. Multi-strings keep their inner
/// terminators as U+0001 and drop the final double NUL.
pub fn write_reg_value(w: &mut LbvsWriter, value_type: u32, data: &[u8]) -> EngineResult<()> {
    let field = EventField::RegistryRawData;
    match value_type {
        reg_type::SZ | reg_type::EXPAND_SZ | reg_type::LINK => {
            let units = utf16_units(data);
            let end = units.iter().position(|&u| u == 0).unwrap_or(units.len());
            w.write_utf16(field, &units[..end])?;
        }
        reg_type::DWORD => w.write_u32(field, u32::from_le_bytes(fixed(data, "DWORD")?)),
        reg_type::DWORD_BIG_ENDIAN => {
            w.write_u32(field, u32::from_be_bytes(fixed(data, "DWORD_BIG_ENDIAN")?))
        }
        reg_type::QWORD => w.write_u64(field, u64::from_le_bytes(fixed(data, "QWORD")?)),
        reg_type::MULTI_SZ => {
            let mut units = utf16_units(data);
            if units.is_empty() {
                return Err(EngineError::invalid(field, "empty MULTI_SZ value"));
            }
            let scan = units.len() - 1;
            // an unterminated tail is still data
            let mut end = if units[scan] == 0 { scan } else { units.len() };
            for i in 0..scan {
                if units[i] != 0 {
                    continue;
                }
                units[i] = 0x0001;
                if units[i + 1] == 0 {
                    end = i + 1;
                    break;
                }
            }
            w.write_utf16(field, &units[..end])?;
        }
        _ => w.write_stream(field, data)?,
    }
    Ok(())
}

/// The part of a record that identifies a repeat: id, key and operation data.
fn keyed_record(event: SysmonEvent, key_path: &str) -> EngineResult<LbvsWriter> {
    let mut w = LbvsWriter::new();
    w.write_u32(EventField::RawEventId, event.raw());
    w.write_wstr(EventField::RegistryPath, key_path)?;
    Ok(w)
}

fn value_set_record(op: &ValueSet) -> EngineResult<LbvsWriter> {
    let mut w = keyed_record(SysmonEvent::RegistryValueSet, &op.key_path)?;
    w.write_u32(EventField::RegistryDataType, op.value_type);
    write_reg_value(&mut w, op.value_type, &op.data)?;
    w.write_wstr(EventField::RegistryName, op.value_name.as_deref().unwrap_or(""))?;
    Ok(w)
}

pub struct RegistryMonitor {
    state: EngineState,
}

impl RegistryMonitor {
    pub fn new(state: EngineState) -> Self {
        Self { state }
    }

    /// Effect of the registry rules on `path` for `pid`.
    fn key_effect(&self, pid: u32, path: Option<&str>) -> Effect {
        if !self.state.rules.has_registry_rules() || self.state.is_trusted_pid(pid) {
            return Effect::Full;
        }
        let Some(path) = path else {
            return Effect::Full;
        };
        let normalized = reg_path::normalize(path);
        let effect = self.state.rules.registry_effect(&normalized);
        trace!(pid, path = %normalized, effect = ?effect, "registry rule lookup");
        effect
    }

    fn require_full(&self, pid: u32, path: Option<&str>, operation: &str) -> Verdict {
        if self.key_effect(pid, path) == Effect::Full {
            return Verdict::Allow;
        }
        info!(pid, operation, key = path.unwrap_or(""), "self-protection: registry access denied");
        Verdict::Deny
    }

    fn reports(&self, pid: u32, event: SysmonEvent) -> bool {
        self.state.is_monitoring()
            && self.state.config().event_enabled(event)
            && self.state.sends_events(pid)
    }

    /// Sends unless the same operation from `pid` was reported within the
    /// repeat timeout.
    fn send_filtered(&self, pid: u32, event: SysmonEvent, built: EngineResult<LbvsWriter>) {
        let mut w = match built {
            Ok(w) => w,
            Err(e) => {
                error!(pid, event = ?event, error = %e, "registry event dropped");
                return;
            }
        };
        let now = self.state.tick();
        let digest = self.state.hasher.digest_of(w.field_bytes());
        let timeout = self.state.config().reg_event_repeat_timeout_ms;
        let ctx = self.state.processes.context(pid);
        if !ctx.registry_filter.lock().allow(digest, timeout, now) {
            trace!(pid, event = ?event, "repeated registry event suppressed");
            return;
        }
        w.write_u64(EventField::TickTime, now);
        w.write_u32(EventField::ProcessPid, pid);
        self.state.submit(w.finish());
    }

    fn pending(
        &self,
        event: SysmonEvent,
        pid: u32,
        key_path: &str,
        extra: Option<(EventField, &str)>,
    ) -> Option<PendingEvent> {
        if !self.reports(pid, event) {
            return None;
        }
        let build = || -> EngineResult<Vec<u8>> {
            let mut w = keyed_record(event, key_path)?;
            w.write_u64(EventField::TickTime, self.state.tick());
            w.write_u32(EventField::ProcessPid, pid);
            if let Some((field, value)) = extra {
                w.write_wstr(field, value)?;
            }
            Ok(w.finish()?)
        };
        match build() {
            Ok(record) => Some(PendingEvent { event, pid, record }),
            Err(e) => {
                error!(pid, event = ?event, error = %e, "registry event dropped");
                None
            }
        }
    }
}

impl RegistryInterceptor for RegistryMonitor {
    fn pre_create_key(&self, op: &KeyOpen) -> Verdict {
        let path = reg_path::resolve_key_path(op.root.as_deref(), op.complete_name.as_deref());
        self.require_full(op.pid, path.as_deref(), "create key")
    }

    fn post_create_key(&self, pid: u32, key_path: &str, disposition: KeyDisposition, succeeded: bool) {
        if !succeeded || disposition == KeyDisposition::OpenedExisting {
            return;
        }
        if self.reports(pid, SysmonEvent::RegistryKeyCreate) {
            self.send_filtered(
                pid,
                SysmonEvent::RegistryKeyCreate,
                keyed_record(SysmonEvent::RegistryKeyCreate, key_path),
            );
        }
    }

    fn pre_open_key(&self, op: &KeyOpen) -> Verdict {
        let path = reg_path::resolve_key_path(op.root.as_deref(), op.complete_name.as_deref());
        let effect = self.key_effect(op.pid, path.as_deref());
        if access_allowed(effect, op.desired_access) {
            return Verdict::Allow;
        }
        info!(
            pid = op.pid,
            access = format_args!("{:#010x}", op.desired_access),
            key = path.as_deref().unwrap_or(""),
            "self-protection: registry open denied"
        );
        Verdict::Deny
    }

    fn pre_set_value(&self, pid: u32, key_path: &str) -> Verdict {
        self.require_full(pid, Some(key_path), "set value")
    }

    fn post_set_value(&self, op: &ValueSet, succeeded: bool) {
        if !succeeded || !self.reports(op.pid, SysmonEvent::RegistryValueSet) {
            return;
        }
        let cfg = self.state.config();
        if !cfg.reg_type_enabled(op.value_type) {
            return;
        }
        if op.data.len() as u64 >= cfg.max_reg_value_size {
            debug!(pid = op.pid, size = op.data.len(), "registry value too large to report");
            return;
        }
        self.send_filtered(op.pid, SysmonEvent::RegistryValueSet, value_set_record(op));
    }

    fn pre_delete_key(&self, pid: u32, key_path: &str) -> PendingOutcome {
        if self.require_full(pid, Some(key_path), "delete key") == Verdict::Deny {
            return PendingOutcome::Denied;
        }
        PendingOutcome::Allowed(self.pending(SysmonEvent::RegistryKeyDelete, pid, key_path, None))
    }

    fn pre_delete_value(&self, pid: u32, key_path: &str, value_name: Option<&str>) -> PendingOutcome {
        if self.require_full(pid, Some(key_path), "delete value") == Verdict::Deny {
            return PendingOutcome::Denied;
        }
        let Some(name) = value_name else {
            debug!(pid, key = key_path, "value delete without a name, not reported");
            return PendingOutcome::Allowed(None);
        };
        PendingOutcome::Allowed(self.pending(
            SysmonEvent::RegistryValueDelete,
            pid,
            key_path,
            Some((EventField::RegistryName, name)),
        ))
    }

    fn pre_rename_key(&self, pid: u32, key_path: &str, new_name: Option<&str>) -> PendingOutcome {
        let Some(new_name) = new_name else {
            return PendingOutcome::Allowed(None);
        };
        if self.require_full(pid, Some(key_path), "rename key") == Verdict::Deny {
            return PendingOutcome::Denied;
        }
        PendingOutcome::Allowed(self.pending(
            SysmonEvent::RegistryKeyNameChange,
            pid,
            key_path,
            Some((EventField::RegistryKeyNewName, new_name)),
        ))
    }

    fn complete(&self, pending: PendingEvent, succeeded: bool) {
        if succeeded {
            self.state.sink.submit(pending.record);
        }
    }
}

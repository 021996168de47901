//! Process contexts and the option cascade.
//!
//! Every pid seen by an interception callback gets one shared
//! [`ProcessContext`]. Contexts are created lazily under a single fill lock,
//! so two racing lookups for the same pid always observe the same `Arc`.
//! Four options (trusted, protected, send-events, allow-inject) are resolved
//! per context from forced values, rules, the parent and defaults.

use crate::protocol::{ConfigId, RuleType, SetProcessInfoField};
use crate::repeat_filter::{RepeatFilter, GC_PERIOD_MS, REGISTRY_GC_EVENT_COUNT};
use crate::rules::{RuleMatch, RuleStore};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessOption {
    Trusted,
    Protected,
    SendEvents,
    AllowInject,
}

impl ProcessOption {
    pub const ALL: [ProcessOption; 4] = [
        ProcessOption::Trusted,
        ProcessOption::Protected,
        ProcessOption::SendEvents,
        ProcessOption::AllowInject,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_rule_type(rule_type: RuleType) -> Self {
        match rule_type {
            RuleType::Trusted => Self::Trusted,
            RuleType::Protected => Self::Protected,
            RuleType::EnableInject => Self::AllowInject,
            RuleType::SendEvent => Self::SendEvents,
        }
    }

    pub fn rule_type(self) -> RuleType {
        match self {
            Self::Trusted => RuleType::Trusted,
            Self::Protected => RuleType::Protected,
            Self::AllowInject => RuleType::EnableInject,
            Self::SendEvents => RuleType::SendEvent,
        }
    }

    pub fn config_id(self) -> ConfigId {
        match self {
            Self::Trusted => ConfigId::TrustedProcess,
            Self::Protected => ConfigId::ProtectedProcess,
            Self::AllowInject => ConfigId::InjectProcess,
            Self::SendEvents => ConfigId::SendEventProcess,
        }
    }

    fn from_info_field(field: SetProcessInfoField) -> Option<Self> {
        match field {
            SetProcessInfoField::Pid => None,
            SetProcessInfoField::Trusted => Some(Self::Trusted),
            SetProcessInfoField::Protected => Some(Self::Protected),
            SetProcessInfoField::SendEvent => Some(Self::SendEvents),
            SetProcessInfoField::EnableInject => Some(Self::AllowInject),
        }
    }

    pub fn default_value(self) -> bool {
        matches!(self, Self::SendEvents | Self::AllowInject)
    }
}

/// Resolved state of one option, with its provenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptionState {
    NotSet,
    Default(bool),
    ByRule { value: bool, inheritable: bool },
    /// Copied from the parent; stays inheritable for grandchildren.
    Inherited(bool),
    /// Set explicitly; never recomputed by rules.
    Forced(bool),
}

impl OptionState {
    pub fn value(self) -> Option<bool> {
        match self {
            OptionState::NotSet => None,
            OptionState::Default(v)
            | OptionState::Inherited(v)
            | OptionState::Forced(v)
            | OptionState::ByRule { value: v, .. } => Some(v),
        }
    }

    pub fn is_forced(self) -> bool {
        matches!(self, OptionState::Forced(_))
    }

    pub fn is_inheritable(self) -> bool {
        matches!(
            self,
            OptionState::ByRule {
                inheritable: true,
                ..
            } | OptionState::Inherited(_)
        )
    }
}

/// One step of the cascade: forced, then rule, then inheritable parent, then default.
pub fn resolve(
    own: OptionState,
    rule: Option<RuleMatch>,
    parent: Option<OptionState>,
    default: bool,
) -> OptionState {
    if own.is_forced() {
        return own;
    }
    if let Some(m) = rule {
        return OptionState::ByRule {
            value: m.value,
            inheritable: m.inherit,
        };
    }
    if let Some(value) = parent
        .filter(|p| p.is_inheritable())
        .and_then(OptionState::value)
    {
        return OptionState::Inherited(value);
    }
    OptionState::Default(default)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessFlags {
    /// The kernel or an equivalent pseudo-process.
    pub system_like: bool,
    /// One of this product's own processes.
    pub this_product: bool,
    /// Protected by the host OS.
    pub os_protected: bool,
    /// The session subsystem process, exempt from handle stripping.
    pub csrss: bool,
}

/// Identity facts captured once when a context is filled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessIdentity {
    pub pid: u32,
    pub parent_pid: u32,
    pub creator_pid: u32,
    pub image_path: String,
    pub command_line: String,
    pub user_sid: String,
    pub is_elevated: Option<bool>,
    pub elevation_type: Option<u32>,
    /// Milliseconds since the Unix epoch.
    pub creation_time_ms: u64,
    pub flags: ProcessFlags,
}

/// Supplies identity for pids first seen outside a create notification.
pub trait ProcessInfoSource: Send + Sync {
    fn query(&self, pid: u32) -> Option<ProcessIdentity>;
}

/// Source that knows nothing; contexts get a bare identity.
#[derive(Debug, Default)]
pub struct NoProcessInfo;

impl ProcessInfoSource for NoProcessInfo {
    fn query(&self, _pid: u32) -> Option<ProcessIdentity> {
        None
    }
}

#[derive(Debug)]
pub struct ProcessContext {
    identity: ProcessIdentity,
    options: Mutex<[OptionState; 4]>,
    terminated: AtomicBool,
    pub(crate) open_filter: Mutex<RepeatFilter<u32>>,
    pub(crate) registry_filter: Mutex<RepeatFilter<u64>>,
}

impl ProcessContext {
    pub fn new(identity: ProcessIdentity) -> Self {
        Self {
            identity,
            options: Mutex::new([OptionState::NotSet; 4]),
            terminated: AtomicBool::new(false),
            open_filter: Mutex::new(
                RepeatFilter::new(GC_PERIOD_MS, usize::MAX).with_fixed_retention(GC_PERIOD_MS),
            ),
            registry_filter: Mutex::new(RepeatFilter::new(GC_PERIOD_MS, REGISTRY_GC_EVENT_COUNT)),
        }
    }

    pub fn pid(&self) -> u32 {
        self.identity.pid
    }

    pub fn identity(&self) -> &ProcessIdentity {
        &self.identity
    }

    pub fn option(&self, option: ProcessOption) -> OptionState {
        self.options.lock()[option.index()]
    }

    /// Resolved value, falling back to the option's default when unset.
    pub fn value(&self, option: ProcessOption) -> bool {
        self.option(option)
            .value()
            .unwrap_or_else(|| option.default_value())
    }

    pub fn set_option(&self, option: ProcessOption, state: OptionState) {
        self.options.lock()[option.index()] = state;
    }

    /// Replaces one option with `f(current)` under a single lock, returning
    /// the previous and the new state.
    pub fn update_option(
        &self,
        option: ProcessOption,
        f: impl FnOnce(OptionState) -> OptionState,
    ) -> (OptionState, OptionState) {
        let mut options = self.options.lock();
        let slot = &mut options[option.index()];
        let prev = *slot;
        *slot = f(prev);
        (prev, *slot)
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    pub fn mark_terminated(&self) {
        self.terminated.store(true, Ordering::Release);
    }
}

/// Live pid → context map.
#[derive(Debug, Default)]
pub struct ContextTable {
    entries: RwLock<HashMap<u32, Arc<ProcessContext>>>,
    fill_lock: Mutex<()>,
}

impl ContextTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live context for `pid`. A terminated entry is unlinked and not returned;
    /// holders of that `Arc` keep a valid, detached context.
    pub fn get(&self, pid: u32) -> Option<Arc<ProcessContext>> {
        let found = self.entries.read().get(&pid).cloned()?;
        if !found.is_terminated() {
            return Some(found);
        }
        let removed = {
            let mut entries = self.entries.write();
            match entries.get(&pid) {
                Some(current) if Arc::ptr_eq(current, &found) => entries.remove(&pid),
                _ => None,
            }
        };
        drop(removed);
        None
    }

    /// Returns the live context or creates one with `make`. `make` runs at
    /// most once per pid even when callers race, and its result is only
    /// published once it returns.
    pub fn get_or_fill(
        &self,
        pid: u32,
        make: impl FnOnce() -> ProcessContext,
    ) -> (Arc<ProcessContext>, bool) {
        if let Some(ctx) = self.get(pid) {
            return (ctx, false);
        }
        let _fill = self.fill_lock.lock();
        if let Some(ctx) = self.get(pid) {
            return (ctx, false);
        }
        let ctx = Arc::new(make());
        self.entries.write().insert(pid, ctx.clone());
        (ctx, true)
    }

    /// Unlinks `pid` only while it still maps to `ctx`.
    pub fn remove_entry(&self, pid: u32, ctx: &Arc<ProcessContext>) -> bool {
        let removed = {
            let mut entries = self.entries.write();
            match entries.get(&pid) {
                Some(current) if Arc::ptr_eq(current, ctx) => entries.remove(&pid),
                _ => None,
            }
        };
        removed.is_some()
    }

    pub fn snapshot(&self) -> Vec<Arc<ProcessContext>> {
        self.entries.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// Options supplied by `SetProcessInfo`, applied as forced values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessInfoUpdate {
    pub pid: u32,
    pub forced: Vec<(ProcessOption, bool)>,
}

impl ProcessInfoUpdate {
    pub fn parse(payload: &[u8]) -> crate::error::EngineResult<Self> {
        use crate::error::EngineError;
        use crate::lbvs::LbvsReader;

        let mut update = ProcessInfoUpdate::default();
        for field in LbvsReader::new(payload)?.fields() {
            let field = field?;
            let Some(id) = SetProcessInfoField::from_raw(u32::from(field.id)) else {
                continue;
            };
            match ProcessOption::from_info_field(id) {
                None => update.pid = field.as_u32()?,
                Some(option) => update.forced.push((option, field.as_bool()?)),
            }
        }
        if update.pid == 0 {
            return Err(EngineError::invalid(SetProcessInfoField::Pid, "pid is missing"));
        }
        Ok(update)
    }
}

/// Context table plus the rule cascade that populates it.
pub struct ProcessRegistry {
    table: ContextTable,
    rules: Arc<RuleStore>,
    source: Arc<dyn ProcessInfoSource>,
    self_pid: u32,
}

impl ProcessRegistry {
    pub fn new(rules: Arc<RuleStore>, source: Arc<dyn ProcessInfoSource>, self_pid: u32) -> Self {
        Self {
            table: ContextTable::new(),
            rules,
            source,
            self_pid,
        }
    }

    pub fn table(&self) -> &ContextTable {
        &self.table
    }

    fn identity_for(&self, pid: u32) -> ProcessIdentity {
        let mut identity = self.source.query(pid).unwrap_or_else(|| ProcessIdentity {
            pid,
            ..ProcessIdentity::default()
        });
        identity.pid = pid;
        if pid <= 4 {
            identity.flags.system_like = true;
        }
        if pid == self.self_pid {
            identity.flags.this_product = true;
        }
        identity
    }

    /// Context for `pid`, filled from the info source on first use.
    pub fn context(&self, pid: u32) -> Arc<ProcessContext> {
        let (ctx, _) = self.table.get_or_fill(pid, || {
            let ctx = ProcessContext::new(self.identity_for(pid));
            self.apply_rules(&ctx);
            ctx
        });
        ctx
    }

    /// Context for a process announced by a create notification. An existing
    /// context for the pid is replaced only if it belongs to a finished process.
    pub fn register(&self, mut identity: ProcessIdentity) -> Arc<ProcessContext> {
        let pid = identity.pid;
        if pid <= 4 {
            identity.flags.system_like = true;
        }
        if pid == self.self_pid {
            identity.flags.this_product = true;
        }
        let (ctx, _) = self.table.get_or_fill(pid, move || {
            let ctx = ProcessContext::new(identity);
            self.apply_rules(&ctx);
            ctx
        });
        ctx
    }

    /// Recomputes every non-forced option of `ctx`. A forced value set
    /// concurrently is never overwritten.
    pub fn apply_rules(&self, ctx: &ProcessContext) {
        let identity = ctx.identity();
        let flags = identity.flags;
        let force = |option, value| {
            ctx.update_option(option, |own| {
                if own.is_forced() {
                    own
                } else {
                    OptionState::Forced(value)
                }
            });
        };
        if flags.system_like {
            force(ProcessOption::AllowInject, false);
            force(ProcessOption::SendEvents, false);
        }
        if flags.this_product {
            force(ProcessOption::Trusted, true);
        }
        if flags.os_protected {
            force(ProcessOption::AllowInject, false);
            force(ProcessOption::SendEvents, false);
            debug!(pid = identity.pid, "OS-protected process options forced");
        }

        let parent = (identity.parent_pid != identity.pid)
            .then(|| self.table.get(identity.parent_pid))
            .flatten();
        for option in ProcessOption::ALL {
            if ctx.option(option).is_forced() {
                continue;
            }
            let rule = self.rules.match_process_rule(option, &identity.image_path);
            let inherited = parent.as_ref().map(|p| p.option(option));
            let (own, next) = ctx.update_option(option, |own| {
                resolve(own, rule, inherited, option.default_value())
            });
            if next != own {
                debug!(pid = identity.pid, option = ?option, state = ?next, "process option resolved");
            }
        }
    }

    pub fn reapply_all(&self) {
        let contexts = self.table.snapshot();
        for ctx in contexts.iter().filter(|c| !c.is_terminated()) {
            self.apply_rules(ctx);
        }
        debug!(count = contexts.len(), "process rules reapplied");
    }

    pub fn set_forced(&self, pid: u32, option: ProcessOption, value: bool) {
        let ctx = self.context(pid);
        ctx.set_option(option, OptionState::Forced(value));
        info!(pid, option = ?option, value, "process option forced");
    }

    pub fn apply_info(&self, update: &ProcessInfoUpdate) {
        for (option, value) in &update.forced {
            self.set_forced(update.pid, *option, *value);
        }
    }

    pub fn value(&self, pid: u32, option: ProcessOption) -> bool {
        self.context(pid).value(option)
    }

    /// Marks the context finished and unlinks it. Safe to call repeatedly;
    /// a newer context registered under a reused pid is left in place.
    pub fn finish(&self, pid: u32) -> Option<Arc<ProcessContext>> {
        let ctx = self.table.get(pid)?;
        ctx.mark_terminated();
        self.table.remove_entry(pid, &ctx);
        Some(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lbvs::LbvsWriter;
    use crate::protocol::{UpdateRulesField, UpdateRulesMode};
    use std::sync::Barrier;

    struct Images(HashMap<u32, (u32, &'static str)>);

    impl ProcessInfoSource for Images {
        fn query(&self, pid: u32) -> Option<ProcessIdentity> {
            self.0.get(&pid).map(|(parent, image)| ProcessIdentity {
                pid,
                parent_pid: *parent,
                image_path: image.to_string(),
                ..ProcessIdentity::default()
            })
        }
    }

    fn registry(entries: &[(u32, u32, &'static str)]) -> ProcessRegistry {
        let images = entries.iter().map(|(p, pp, i)| (*p, (*pp, *i))).collect();
        ProcessRegistry::new(Arc::new(RuleStore::new()), Arc::new(Images(images)), 9999)
    }

    fn rule_payload(rule_type: RuleType, mask: &str, value: bool, inherit: bool) -> Vec<u8> {
        let mut w = LbvsWriter::new();
        w.write_u32(UpdateRulesField::Type, rule_type.raw());
        w.write_u32(UpdateRulesField::Mode, UpdateRulesMode::PushBack.raw());
        w.begin_group(UpdateRulesField::Rule);
        w.write_str(UpdateRulesField::RuleImagePath, mask).unwrap();
        w.write_bool(UpdateRulesField::RuleValue, value);
        w.write_bool(UpdateRulesField::RuleInherit, inherit);
        w.finish().unwrap()
    }

    #[test]
    fn cascade_is_pure_and_ordered() {
        let rule = Some(RuleMatch {
            value: false,
            inherit: true,
        });
        assert_eq!(
            resolve(OptionState::Forced(true), rule, None, true),
            OptionState::Forced(true)
        );
        assert_eq!(
            resolve(OptionState::Default(true), rule, Some(OptionState::Inherited(true)), true),
            OptionState::ByRule {
                value: false,
                inheritable: true
            }
        );
        assert_eq!(
            resolve(OptionState::NotSet, None, Some(OptionState::Inherited(false)), true),
            OptionState::Inherited(false)
        );
        assert_eq!(
            resolve(OptionState::NotSet, None, Some(OptionState::Default(false)), true),
            OptionState::Default(true)
        );
        assert_eq!(
            resolve(
                OptionState::NotSet,
                None,
                Some(OptionState::ByRule {
                    value: false,
                    inheritable: false
                }),
                true
            ),
            OptionState::Default(true)
        );
    }

    #[test]
    fn defaults_apply_without_rules() {
        let reg = registry(&[(100, 1, "c:\\app.exe")]);
        let ctx = reg.context(100);
        assert_eq!(ctx.option(ProcessOption::Trusted), OptionState::Default(false));
        assert!(ctx.value(ProcessOption::SendEvents));
        assert!(ctx.value(ProcessOption::AllowInject));
        assert!(!ctx.value(ProcessOption::Protected));
    }

    #[test]
    fn rule_value_is_inherited_by_children() {
        let reg = registry(&[(100, 1, "c:\\edr\\agent.exe"), (200, 100, "c:\\cmd.exe")]);
        reg.rules
            .update_process_rules(&rule_payload(RuleType::SendEvent, "\\agent.exe", false, true))
            .unwrap();
        let parent = reg.context(100);
        assert_eq!(
            parent.option(ProcessOption::SendEvents),
            OptionState::ByRule {
                value: false,
                inheritable: true
            }
        );
        let child = reg.context(200);
        assert_eq!(child.option(ProcessOption::SendEvents), OptionState::Inherited(false));
        assert_eq!(child.option(ProcessOption::Trusted), OptionState::Default(false));
    }

    #[test]
    fn built_in_overrides_are_forced() {
        let reg = registry(&[]);
        let system = reg.context(4);
        assert_eq!(system.option(ProcessOption::SendEvents), OptionState::Forced(false));
        assert_eq!(system.option(ProcessOption::AllowInject), OptionState::Forced(false));
        let me = reg.context(9999);
        assert_eq!(me.option(ProcessOption::Trusted), OptionState::Forced(true));

        let protected = reg.register(ProcessIdentity {
            pid: 500,
            flags: ProcessFlags {
                os_protected: true,
                ..ProcessFlags::default()
            },
            ..ProcessIdentity::default()
        });
        assert!(!protected.value(ProcessOption::SendEvents));
    }

    #[test]
    fn forced_survives_rule_reapplication() {
        let reg = registry(&[(100, 1, "c:\\tool.exe")]);
        reg.set_forced(100, ProcessOption::Protected, true);
        reg.rules
            .update_process_rules(&rule_payload(RuleType::Protected, "tool.exe", false, false))
            .unwrap();
        reg.reapply_all();
        assert_eq!(reg.context(100).option(ProcessOption::Protected), OptionState::Forced(true));
    }

    #[test]
    fn reapply_picks_up_new_rules() {
        let reg = registry(&[(100, 1, "c:\\tool.exe")]);
        assert!(!reg.value(100, ProcessOption::Trusted));
        reg.rules
            .update_process_rules(&rule_payload(RuleType::Trusted, "TOOL.EXE", true, false))
            .unwrap();
        reg.reapply_all();
        assert!(reg.value(100, ProcessOption::Trusted));
    }

    #[test]
    fn concurrent_fill_creates_one_context() {
        let reg = Arc::new(registry(&[(321, 1, "c:\\x.exe")]));
        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let reg = reg.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    reg.context(321)
                })
            })
            .collect();
        let contexts: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(contexts.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(reg.table().len(), 1);
    }

    #[test]
    fn terminated_context_is_unlinked_but_stays_valid_for_holders() {
        let reg = registry(&[(100, 1, "c:\\a.exe")]);
        let held = reg.context(100);
        held.mark_terminated();
        assert!(reg.table().get(100).is_none());
        assert!(reg.table().is_empty());
        assert_eq!(held.identity().image_path, "c:\\a.exe");

        let fresh = reg.context(100);
        assert!(!Arc::ptr_eq(&held, &fresh));
        assert!(reg.finish(100).is_some());
        assert!(reg.finish(100).is_none());
    }

    #[test]
    fn context_is_published_only_after_resolution() {
        let reg = Arc::new(registry(&[(100, 1, "c:\\edr\\agent.exe")]));
        reg.rules
            .update_process_rules(&rule_payload(RuleType::Trusted, "\\agent.exe", true, false))
            .unwrap();

        let held = reg.rules.hold_process_rules();
        let filler = {
            let reg = reg.clone();
            std::thread::spawn(move || reg.context(100))
        };
        std::thread::sleep(std::time::Duration::from_millis(100));
        // the filler is parked on the rule lookup
        assert!(reg.table().get(100).is_none());
        drop(held);

        let ctx = filler.join().unwrap();
        assert!(ProcessOption::ALL
            .iter()
            .all(|o| ctx.option(*o) != OptionState::NotSet));
        assert_eq!(
            ctx.option(ProcessOption::Trusted),
            OptionState::ByRule {
                value: true,
                inheritable: false
            }
        );
    }

    #[test]
    fn forced_value_set_during_reapply_is_kept() {
        let reg = Arc::new(registry(&[(100, 1, "c:\\tool.exe")]));
        reg.context(100);
        reg.rules
            .update_process_rules(&rule_payload(RuleType::Trusted, "tool.exe", true, false))
            .unwrap();

        let held = reg.rules.hold_process_rules();
        let reapply = {
            let reg = reg.clone();
            std::thread::spawn(move || reg.reapply_all())
        };
        std::thread::sleep(std::time::Duration::from_millis(100));
        reg.set_forced(100, ProcessOption::Trusted, false);
        drop(held);
        reapply.join().unwrap();

        assert_eq!(reg.context(100).option(ProcessOption::Trusted), OptionState::Forced(false));
    }

    #[test]
    fn finish_leaves_a_reused_pid_alone() {
        let reg = registry(&[]);
        let old = reg.register(ProcessIdentity {
            pid: 100,
            image_path: "c:\\old.exe".into(),
            ..ProcessIdentity::default()
        });
        old.mark_terminated();
        let fresh = reg.register(ProcessIdentity {
            pid: 100,
            image_path: "c:\\new.exe".into(),
            ..ProcessIdentity::default()
        });
        assert!(!Arc::ptr_eq(&old, &fresh));

        assert!(!reg.table().remove_entry(100, &old));
        let live = reg.table().get(100).unwrap();
        assert!(Arc::ptr_eq(&live, &fresh));

        let finished = reg.finish(100).unwrap();
        assert_eq!(finished.identity().image_path, "c:\\new.exe");
        assert!(reg.table().is_empty());
    }

    #[test]
    fn process_info_payload() {
        let mut w = LbvsWriter::new();
        w.write_u32(SetProcessInfoField::Pid, 42);
        w.write_bool(SetProcessInfoField::Trusted, true);
        w.write_u32(SetProcessInfoField::SendEvent, 0);
        let update = ProcessInfoUpdate::parse(&w.finish().unwrap()).unwrap();
        assert_eq!(update.pid, 42);
        assert_eq!(
            update.forced,
            vec![(ProcessOption::Trusted, true), (ProcessOption::SendEvents, false)]
        );

        let mut w = LbvsWriter::new();
        w.write_bool(SetProcessInfoField::Trusted, true);
        assert!(ProcessInfoUpdate::parse(&w.finish().unwrap()).is_err());
    }
}

//! Rule store: file, registry and process-option rules.
//!
//! Each resource kind keeps two ordered partitions, temporary and persisted,
//! behind its own reader/writer lock. Lookups walk temporary rules first and
//! the first structural match wins.

use crate::error::{EngineError, EngineResult};
use crate::lbvs::{Field, LbvsReader, LbvsWriter};
use crate::process::ProcessOption;
use crate::protocol::{AccessType, ConfigId, RuleType, UpdateRulesField, UpdateRulesMode};
use parking_lot::RwLock;
use tracing::{debug, warn};

fn same_char_ignore_case(a: char, b: char) -> bool {
    a == b || a.to_lowercase().eq(b.to_lowercase())
}

/// Strips `prefix` from `s` comparing one char at a time, folded the same way
/// registry paths are normalized.
pub fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let mut rest = s.chars();
    for p in prefix.chars() {
        let c = rest.next()?;
        if !same_char_ignore_case(c, p) {
            return None;
        }
    }
    Some(rest.as_str())
}

pub fn ends_with_ignore_case(s: &str, suffix: &str) -> bool {
    let mut rest = s.chars().rev();
    suffix
        .chars()
        .rev()
        .all(|p| rest.next().is_some_and(|c| same_char_ignore_case(c, p)))
}

fn is_separator(c: char) -> bool {
    c == '\\' || c == '/'
}

/// Outcome of a rule lookup before the requested access is considered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    Full,
    ReadOnly { recursive: bool },
    Deny,
}

impl Effect {
    /// Reduces the effect to a yes/no for `requested` under `write_mask`.
    pub fn permits(self, requested: u32, write_mask: u32) -> bool {
        match self {
            Effect::Full => true,
            Effect::Deny => false,
            Effect::ReadOnly { .. } => requested & write_mask == 0,
        }
    }
}

/// A file or registry rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathRule {
    pub path: String,
    pub access: AccessType,
    pub recursive: bool,
    pub tag: Option<String>,
}

impl PathRule {
    /// Exact match, or a recursive rule followed by a path separator.
    pub fn matches(&self, path: &str) -> bool {
        match strip_prefix_ignore_case(path, &self.path) {
            None => false,
            Some("") => true,
            Some(rest) => self.recursive && rest.starts_with(is_separator),
        }
    }

    pub fn effect(&self) -> Effect {
        match self.access {
            AccessType::Full => Effect::Full,
            AccessType::NoAccess => Effect::Deny,
            AccessType::ReadOnly => Effect::ReadOnly {
                recursive: self.recursive,
            },
        }
    }
}

/// A process-option rule matched against the end of the image path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRule {
    pub image_mask: String,
    pub value: bool,
    pub inherit: bool,
    pub tag: Option<String>,
}

impl ProcessRule {
    pub fn matches(&self, image_path: &str) -> bool {
        ends_with_ignore_case(image_path, &self.image_mask)
    }
}

trait Tagged {
    fn tag(&self) -> Option<&str>;
}

impl Tagged for PathRule {
    fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }
}

impl Tagged for ProcessRule {
    fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partitions<R> {
    pub temp: Vec<R>,
    pub persisted: Vec<R>,
}

impl<R> Default for Partitions<R> {
    fn default() -> Self {
        Self {
            temp: Vec::new(),
            persisted: Vec::new(),
        }
    }
}

impl<R> Partitions<R> {
    pub fn iter(&self) -> impl Iterator<Item = &R> {
        self.temp.iter().chain(self.persisted.iter())
    }

    pub fn is_empty(&self) -> bool {
        self.temp.is_empty() && self.persisted.is_empty()
    }

    fn partition_mut(&mut self, persistent: bool) -> &mut Vec<R> {
        if persistent {
            &mut self.persisted
        } else {
            &mut self.temp
        }
    }
}

/// First rule matching `path`; `Full` when none does.
pub fn decide(path: &str, rules: &Partitions<PathRule>) -> Effect {
    rules
        .iter()
        .find(|r| r.matches(path))
        .map(PathRule::effect)
        .unwrap_or(Effect::Full)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleUpdate<R> {
    pub mode: UpdateRulesMode,
    pub persistent: Option<bool>,
    pub tag: Option<String>,
    pub rule_type: Option<RuleType>,
    pub rules: Vec<R>,
}

/// Which path-rule list a payload targets. Registry paths are lowercased.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathRuleKind {
    File,
    Registry,
}

struct Header {
    mode: UpdateRulesMode,
    persistent: Option<bool>,
    tag: Option<String>,
    rule_type: Option<RuleType>,
}

fn parse_header(fields: &[Field<'_>]) -> EngineResult<Header> {
    let mut mode = None;
    let mut persistent = None;
    let mut tag = None;
    let mut rule_type = None;
    for field in fields {
        match UpdateRulesField::from_raw(u32::from(field.id)) {
            Some(UpdateRulesField::Mode) => {
                let raw = field.as_u32()?;
                mode = Some(UpdateRulesMode::from_raw(raw).ok_or_else(|| {
                    EngineError::invalid(UpdateRulesField::Mode, format!("invalid mode {raw}"))
                })?);
            }
            Some(UpdateRulesField::Persistent) => persistent = Some(field.as_bool()?),
            Some(UpdateRulesField::Tag) => tag = Some(field.as_string()?),
            Some(UpdateRulesField::Type) => {
                let raw = field.as_u32()?;
                rule_type = Some(RuleType::from_raw(raw).ok_or_else(|| {
                    EngineError::invalid(UpdateRulesField::Type, format!("invalid rule type {raw}"))
                })?);
            }
            _ => {}
        }
    }
    let mode = mode.ok_or_else(|| EngineError::invalid(UpdateRulesField::Mode, "mode is missing"))?;
    if mode == UpdateRulesMode::DeleteByTag && tag.is_none() {
        return Err(EngineError::invalid(
            UpdateRulesField::Tag,
            "DeleteByTag requires a tag",
        ));
    }
    Ok(Header {
        mode,
        persistent,
        tag,
        rule_type,
    })
}

/// Collects rule groups. `apply` sets one rule field on the current rule.
fn parse_rules<R>(
    fields: &[Field<'_>],
    header: &Header,
    new_rule: impl Fn(Option<String>) -> R,
    mut apply: impl FnMut(&mut R, UpdateRulesField, &Field<'_>) -> EngineResult<()>,
) -> EngineResult<Vec<R>> {
    let mut rules: Vec<R> = Vec::new();
    for field in fields {
        let Some(id) = UpdateRulesField::from_raw(u32::from(field.id)) else {
            continue;
        };
        match id {
            UpdateRulesField::Type
            | UpdateRulesField::Persistent
            | UpdateRulesField::Mode
            | UpdateRulesField::Tag => {}
            UpdateRulesField::Rule => rules.push(new_rule(header.tag.clone())),
            _ => {
                let current = rules.last_mut().ok_or_else(|| {
                    EngineError::invalid(id, "rule field before any Rule marker")
                })?;
                apply(current, id, field)?;
            }
        }
    }
    if !rules.is_empty()
        && matches!(
            header.mode,
            UpdateRulesMode::Clear | UpdateRulesMode::DeleteByTag
        )
    {
        warn!(mode = ?header.mode, count = rules.len(), "rules ignored for this mode");
        rules.clear();
    }
    Ok(rules)
}

pub fn parse_path_rule_update(
    payload: &[u8],
    kind: PathRuleKind,
) -> EngineResult<RuleUpdate<PathRule>> {
    let fields = LbvsReader::new(payload)?.collect()?;
    let header = parse_header(&fields)?;
    let rules = parse_rules(
        &fields,
        &header,
        |tag| PathRule {
            path: String::new(),
            access: AccessType::Full,
            recursive: false,
            tag,
        },
        |rule, id, field| {
            match id {
                UpdateRulesField::RulePath => {
                    let path = field.as_string()?;
                    rule.path = match kind {
                        PathRuleKind::File => path,
                        PathRuleKind::Registry => path.to_lowercase(),
                    };
                }
                UpdateRulesField::RuleValue => {
                    let raw = field.as_u32()?;
                    rule.access = AccessType::from_raw(raw).ok_or_else(|| {
                        EngineError::invalid(id, format!("invalid access type {raw}"))
                    })?;
                }
                UpdateRulesField::RuleRecursive => rule.recursive = field.as_bool()?,
                UpdateRulesField::RuleTag => rule.tag = Some(field.as_string()?),
                _ => {}
            }
            Ok(())
        },
    )?;
    if let Some(bad) = rules.iter().position(|r| r.path.is_empty()) {
        return Err(EngineError::invalid(
            UpdateRulesField::RulePath,
            format!("rule #{bad} has no path"),
        ));
    }
    Ok(RuleUpdate {
        mode: header.mode,
        persistent: header.persistent,
        tag: header.tag,
        rule_type: header.rule_type,
        rules,
    })
}

pub fn parse_process_rule_update(payload: &[u8]) -> EngineResult<RuleUpdate<ProcessRule>> {
    let fields = LbvsReader::new(payload)?.collect()?;
    let header = parse_header(&fields)?;
    if header.rule_type.is_none() && header.mode != UpdateRulesMode::DeleteByTag {
        return Err(EngineError::invalid(
            UpdateRulesField::Type,
            "rule type is missing",
        ));
    }
    let rules = parse_rules(
        &fields,
        &header,
        |tag| ProcessRule {
            image_mask: String::new(),
            value: false,
            inherit: false,
            tag,
        },
        |rule, id, field| {
            match id {
                UpdateRulesField::RuleImagePath | UpdateRulesField::RulePath => {
                    rule.image_mask = field.as_string()?
                }
                UpdateRulesField::RuleInherit | UpdateRulesField::RuleRecursive => {
                    rule.inherit = field.as_bool()?
                }
                UpdateRulesField::RuleValue => rule.value = field.as_bool()?,
                UpdateRulesField::RuleTag => rule.tag = Some(field.as_string()?),
                _ => {}
            }
            Ok(())
        },
    )?;
    if let Some(bad) = rules.iter().position(|r| r.image_mask.is_empty()) {
        return Err(EngineError::invalid(
            UpdateRulesField::RuleImagePath,
            format!("rule #{bad} has no image path"),
        ));
    }
    Ok(RuleUpdate {
        mode: header.mode,
        persistent: header.persistent,
        tag: header.tag,
        rule_type: header.rule_type,
        rules,
    })
}

/// Applies one update to one list. Returns whether the list changed.
fn apply_to_list<R: Tagged>(
    list: &mut Vec<R>,
    mode: UpdateRulesMode,
    tag: Option<&str>,
    rules: Vec<R>,
) -> bool {
    match mode {
        UpdateRulesMode::Replace => {
            *list = rules;
            true
        }
        UpdateRulesMode::Clear => {
            let changed = !list.is_empty();
            list.clear();
            changed
        }
        UpdateRulesMode::PushBack => {
            let changed = !rules.is_empty();
            list.extend(rules);
            changed
        }
        UpdateRulesMode::PushFront => {
            let changed = !rules.is_empty();
            list.splice(0..0, rules);
            changed
        }
        UpdateRulesMode::DeleteByTag => {
            let before = list.len();
            list.retain(|r| r.tag() != tag);
            list.len() != before
        }
    }
}

/// A blob write the caller must perform after an update. `None` removes the blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistRequest {
    pub id: ConfigId,
    pub blob: Option<Vec<u8>>,
}

pub fn serialize_path_rules(rules: &[PathRule]) -> EngineResult<Vec<u8>> {
    let mut w = LbvsWriter::new();
    w.write_u32(UpdateRulesField::Mode, UpdateRulesMode::Replace.raw());
    w.write_bool(UpdateRulesField::Persistent, true);
    for rule in rules {
        w.begin_group(UpdateRulesField::Rule);
        w.write_u32(UpdateRulesField::RuleValue, rule.access.raw());
        w.write_wstr(UpdateRulesField::RulePath, &rule.path)?;
        if let Some(tag) = &rule.tag {
            w.write_wstr(UpdateRulesField::RuleTag, tag)?;
        }
        if rule.recursive {
            w.write_bool(UpdateRulesField::RuleRecursive, true);
        }
    }
    Ok(w.finish()?)
}

pub fn serialize_process_rules(option: ProcessOption, rules: &[ProcessRule]) -> EngineResult<Vec<u8>> {
    let mut w = LbvsWriter::new();
    w.write_u32(UpdateRulesField::Type, option.rule_type().raw());
    w.write_bool(UpdateRulesField::Persistent, true);
    w.write_u32(UpdateRulesField::Mode, UpdateRulesMode::Replace.raw());
    for rule in rules {
        w.begin_group(UpdateRulesField::Rule);
        w.write_bool(UpdateRulesField::RuleValue, rule.value);
        w.write_wstr(UpdateRulesField::RuleImagePath, &rule.image_mask)?;
        if let Some(tag) = &rule.tag {
            w.write_wstr(UpdateRulesField::RuleTag, tag)?;
        }
        w.write_bool(UpdateRulesField::RuleInherit, rule.inherit);
    }
    Ok(w.finish()?)
}

fn persist_path_rules(id: ConfigId, rules: &[PathRule]) -> EngineResult<PersistRequest> {
    let blob = if rules.is_empty() {
        None
    } else {
        Some(serialize_path_rules(rules)?)
    };
    Ok(PersistRequest { id, blob })
}

fn persist_process_rules(option: ProcessOption, rules: &[ProcessRule]) -> EngineResult<PersistRequest> {
    let blob = if rules.is_empty() {
        None
    } else {
        Some(serialize_process_rules(option, rules)?)
    };
    Ok(PersistRequest {
        id: option.config_id(),
        blob,
    })
}

/// Match of a process-option rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleMatch {
    pub value: bool,
    pub inherit: bool,
}

#[derive(Debug, Default)]
pub struct RuleStore {
    file: RwLock<Partitions<PathRule>>,
    registry: RwLock<Partitions<PathRule>>,
    process: RwLock<[Partitions<ProcessRule>; 4]>,
}

impl RuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks every process-rule lookup while the guard lives.
    #[cfg(test)]
    pub(crate) fn hold_process_rules(
        &self,
    ) -> parking_lot::RwLockWriteGuard<'_, [Partitions<ProcessRule>; 4]> {
        self.process.write()
    }

    pub fn file_effect(&self, path: &str) -> Effect {
        decide(path, &self.file.read())
    }

    pub fn registry_effect(&self, path: &str) -> Effect {
        decide(path, &self.registry.read())
    }

    pub fn has_registry_rules(&self) -> bool {
        !self.registry.read().is_empty()
    }

    pub fn file_rules(&self) -> Partitions<PathRule> {
        self.file.read().clone()
    }

    pub fn registry_rules(&self) -> Partitions<PathRule> {
        self.registry.read().clone()
    }

    pub fn process_rules(&self, option: ProcessOption) -> Partitions<ProcessRule> {
        self.process.read()[option.index()].clone()
    }

    /// First process rule for `option` matching `image_path`, temporary rules first.
    pub fn match_process_rule(&self, option: ProcessOption, image_path: &str) -> Option<RuleMatch> {
        self.process.read()[option.index()]
            .iter()
            .find(|r| r.matches(image_path))
            .map(|r| RuleMatch {
                value: r.value,
                inherit: r.inherit,
            })
    }

    pub fn update_file_rules(&self, payload: &[u8]) -> EngineResult<Option<PersistRequest>> {
        let update = parse_path_rule_update(payload, PathRuleKind::File)?;
        update_path_rules(&self.file, update, ConfigId::ProtectedFiles, "file")
    }

    pub fn update_registry_rules(&self, payload: &[u8]) -> EngineResult<Option<PersistRequest>> {
        let update = parse_path_rule_update(payload, PathRuleKind::Registry)?;
        update_path_rules(&self.registry, update, ConfigId::ProtectedRegKeys, "registry")
    }

    /// Process updates default to the temporary partition.
    pub fn update_process_rules(&self, payload: &[u8]) -> EngineResult<Vec<PersistRequest>> {
        let update = parse_process_rule_update(payload)?;
        let mut sets = self.process.write();

        if update.mode == UpdateRulesMode::DeleteByTag {
            let tag = update.tag.as_deref();
            let mut deleted = false;
            for set in sets.iter_mut() {
                deleted |= apply_to_list(&mut set.temp, update.mode, tag, Vec::new());
                deleted |= apply_to_list(&mut set.persisted, update.mode, tag, Vec::new());
            }
            debug!(tag = ?tag, deleted, "process rules deleted by tag");
            if !deleted {
                return Ok(Vec::new());
            }
            return ProcessOption::ALL
                .iter()
                .map(|opt| persist_process_rules(*opt, &sets[opt.index()].persisted))
                .collect();
        }

        let rule_type = update.rule_type.ok_or_else(|| {
            EngineError::invalid(UpdateRulesField::Type, "rule type is missing")
        })?;
        let option = ProcessOption::from_rule_type(rule_type);
        let persistent = update.persistent.unwrap_or(false);
        debug!(option = ?option, mode = ?update.mode, persistent, rules = ?update.rules, "process rules update");
        let set = &mut sets[option.index()];
        apply_to_list(
            set.partition_mut(persistent),
            update.mode,
            update.tag.as_deref(),
            update.rules,
        );
        if !persistent {
            return Ok(Vec::new());
        }
        Ok(vec![persist_process_rules(option, &set.persisted)?])
    }
}

/// File and registry updates default to the persisted partition.
fn update_path_rules(
    lock: &RwLock<Partitions<PathRule>>,
    update: RuleUpdate<PathRule>,
    id: ConfigId,
    kind: &'static str,
) -> EngineResult<Option<PersistRequest>> {
    let mut rules = lock.write();
    let tag = update.tag.as_deref();
    debug!(kind, mode = ?update.mode, persistent = ?update.persistent, rules = ?update.rules, "path rules update");

    let persisted_changed = if update.mode == UpdateRulesMode::DeleteByTag {
        apply_to_list(&mut rules.temp, update.mode, tag, Vec::new());
        apply_to_list(&mut rules.persisted, update.mode, tag, Vec::new())
    } else {
        let persistent = update.persistent.unwrap_or(true);
        let changed = apply_to_list(rules.partition_mut(persistent), update.mode, tag, update.rules);
        persistent && changed
    };
    debug!(kind, temp = ?rules.temp, persisted = ?rules.persisted, "path rules now");

    if !persisted_changed {
        return Ok(None);
    }
    persist_path_rules(id, &rules.persisted).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access;

    fn path_update(
        mode: UpdateRulesMode,
        persistent: Option<bool>,
        tag: Option<&str>,
        rules: &[(&str, AccessType, bool, Option<&str>)],
    ) -> Vec<u8> {
        let mut w = LbvsWriter::new();
        w.write_u32(UpdateRulesField::Mode, mode.raw());
        if let Some(p) = persistent {
            w.write_bool(UpdateRulesField::Persistent, p);
        }
        if let Some(t) = tag {
            w.write_str(UpdateRulesField::Tag, t).unwrap();
        }
        for (path, access, recursive, rule_tag) in rules {
            w.begin_group(UpdateRulesField::Rule);
            w.write_str(UpdateRulesField::RulePath, path).unwrap();
            w.write_u32(UpdateRulesField::RuleValue, access.raw());
            if *recursive {
                w.write_bool(UpdateRulesField::RuleRecursive, true);
            }
            if let Some(t) = rule_tag {
                w.write_str(UpdateRulesField::RuleTag, t).unwrap();
            }
        }
        w.finish().unwrap()
    }

    fn rule(path: &str, access: AccessType, recursive: bool) -> PathRule {
        PathRule {
            path: path.into(),
            access,
            recursive,
            tag: None,
        }
    }

    #[test]
    fn non_recursive_rule_needs_exact_length() {
        let r = rule("/protected", AccessType::NoAccess, false);
        assert!(r.matches("/protected"));
        assert!(r.matches("/PROTECTED"));
        assert!(!r.matches("/protected/x"));
        assert!(!r.matches("/protectedx"));

        let r = rule("/protected", AccessType::NoAccess, true);
        assert!(r.matches("/protected/x"));
        assert!(!r.matches("/protectedx"));
    }

    #[test]
    fn non_ascii_paths_fold_like_registry_keys() {
        // registry rule paths are stored lowercased with full Unicode folding
        let r = rule(&"\\REGISTRY\\MACHINE\\SOFTWARE\\ÉDITEUR".to_lowercase(), AccessType::NoAccess, true);
        assert_eq!(r.path, "\\registry\\machine\\software\\éditeur");
        assert!(r.matches("\\REGISTRY\\MACHINE\\SOFTWARE\\ÉDITEUR"));
        assert!(r.matches("\\REGISTRY\\MACHINE\\SOFTWARE\\Éditeur\\Settings"));
        assert!(!r.matches("\\REGISTRY\\MACHINE\\SOFTWARE\\ÉDITEURS"));

        let r = rule("c:\\données", AccessType::ReadOnly, false);
        assert!(r.matches("C:\\DONNÉES"));
        assert!(ends_with_ignore_case("C:\\Программы\\АГЕНТ.exe", "\\агент.EXE"));
        assert!(!ends_with_ignore_case("агент.exe", "\\агент.exe"));
    }

    #[test]
    fn first_match_wins_in_insertion_order() {
        let broad_first = Partitions {
            temp: Vec::new(),
            persisted: vec![
                rule("/protected", AccessType::ReadOnly, true),
                rule("/protected/secret", AccessType::NoAccess, false),
            ],
        };
        let effect = decide("/protected/secret", &broad_first);
        assert_eq!(effect, Effect::ReadOnly { recursive: true });
        assert!(!effect.permits(access::file::WRITE_DATA, access::file::WRITE_MASK));
        assert!(effect.permits(access::file::READ_DATA, access::file::WRITE_MASK));

        let narrow_first = Partitions {
            temp: Vec::new(),
            persisted: vec![
                rule("/protected/secret", AccessType::NoAccess, false),
                rule("/protected", AccessType::ReadOnly, true),
            ],
        };
        assert_eq!(decide("/protected/secret", &narrow_first), Effect::Deny);
        assert_eq!(decide("/elsewhere", &narrow_first), Effect::Full);
    }

    #[test]
    fn temp_partition_is_consulted_first() {
        let rules = Partitions {
            temp: vec![rule("c:\\app", AccessType::Full, true)],
            persisted: vec![rule("c:\\app", AccessType::NoAccess, true)],
        };
        assert_eq!(decide("c:\\app\\bin", &rules), Effect::Full);
    }

    #[test]
    fn file_update_modes_and_persistence() {
        let store = RuleStore::new();
        let persist = store
            .update_file_rules(&path_update(
                UpdateRulesMode::Replace,
                None,
                Some("edr"),
                &[("c:\\edr", AccessType::ReadOnly, true, None)],
            ))
            .unwrap()
            .unwrap();
        assert_eq!(persist.id, ConfigId::ProtectedFiles);
        assert!(persist.blob.is_some());
        assert_eq!(store.file_rules().persisted[0].tag.as_deref(), Some("edr"));

        store
            .update_file_rules(&path_update(
                UpdateRulesMode::PushFront,
                None,
                None,
                &[
                    ("c:\\a", AccessType::NoAccess, false, Some("x")),
                    ("c:\\b", AccessType::NoAccess, false, Some("x")),
                ],
            ))
            .unwrap();
        let paths: Vec<_> = store
            .file_rules()
            .persisted
            .iter()
            .map(|r| r.path.clone())
            .collect();
        assert_eq!(paths, vec!["c:\\a", "c:\\b", "c:\\edr"]);

        let temp = store
            .update_file_rules(&path_update(
                UpdateRulesMode::PushBack,
                Some(false),
                Some("x"),
                &[("c:\\tmp", AccessType::NoAccess, false, None)],
            ))
            .unwrap();
        assert!(temp.is_none());
        assert_eq!(store.file_rules().temp.len(), 1);

        let deleted = store
            .update_file_rules(&path_update(UpdateRulesMode::DeleteByTag, None, Some("x"), &[]))
            .unwrap()
            .unwrap();
        assert!(deleted.blob.is_some());
        let rules = store.file_rules();
        assert!(rules.temp.is_empty());
        assert_eq!(rules.persisted.len(), 1);

        let cleared = store
            .update_file_rules(&path_update(UpdateRulesMode::Clear, None, None, &[]))
            .unwrap()
            .unwrap();
        assert_eq!(cleared.blob, None);
    }

    #[test]
    fn saved_rules_replay_to_the_same_list() {
        let store = RuleStore::new();
        let persist = store
            .update_registry_rules(&path_update(
                UpdateRulesMode::Replace,
                None,
                Some("t"),
                &[
                    ("%HKLM%\\Software\\Edr", AccessType::ReadOnly, true, None),
                    ("%hklm%\\system\\x", AccessType::NoAccess, false, Some("other")),
                ],
            ))
            .unwrap()
            .unwrap();
        assert_eq!(store.registry_rules().persisted[0].path, "%hklm%\\software\\edr");

        let replayed = RuleStore::new();
        replayed
            .update_registry_rules(&persist.blob.unwrap())
            .unwrap();
        assert_eq!(replayed.registry_rules(), store.registry_rules());
    }

    #[test]
    fn malformed_updates_are_rejected_whole() {
        let store = RuleStore::new();
        let mut w = LbvsWriter::new();
        w.write_u32(UpdateRulesField::Mode, UpdateRulesMode::PushBack.raw());
        w.write_str(UpdateRulesField::RulePath, "c:\\x").unwrap();
        assert!(store.update_file_rules(&w.finish().unwrap()).is_err());

        let mut w = LbvsWriter::new();
        w.write_u32(UpdateRulesField::Mode, 9);
        assert!(store.update_file_rules(&w.finish().unwrap()).is_err());

        let missing_mode = LbvsWriter::new().finish().unwrap();
        assert!(store.update_file_rules(&missing_mode).is_err());

        let no_tag = path_update(UpdateRulesMode::DeleteByTag, None, None, &[]);
        assert!(store.update_file_rules(&no_tag).is_err());

        let mut w = LbvsWriter::new();
        w.write_u32(UpdateRulesField::Mode, UpdateRulesMode::PushBack.raw());
        w.begin_group(UpdateRulesField::Rule);
        w.write_str(UpdateRulesField::RulePath, "c:\\x").unwrap();
        w.write_u32(UpdateRulesField::RuleValue, 7);
        assert!(store.update_file_rules(&w.finish().unwrap()).is_err());
        assert!(store.file_rules().is_empty());
    }

    fn process_update(
        rule_type: Option<RuleType>,
        mode: UpdateRulesMode,
        persistent: bool,
        tag: Option<&str>,
        rules: &[(&str, bool, bool)],
    ) -> Vec<u8> {
        let mut w = LbvsWriter::new();
        if let Some(t) = rule_type {
            w.write_u32(UpdateRulesField::Type, t.raw());
        }
        w.write_u32(UpdateRulesField::Mode, mode.raw());
        w.write_bool(UpdateRulesField::Persistent, persistent);
        if let Some(t) = tag {
            w.write_str(UpdateRulesField::Tag, t).unwrap();
        }
        for (mask, value, inherit) in rules {
            w.begin_group(UpdateRulesField::Rule);
            w.write_wstr(UpdateRulesField::RuleImagePath, mask).unwrap();
            w.write_bool(UpdateRulesField::RuleValue, *value);
            w.write_bool(UpdateRulesField::RuleInherit, *inherit);
        }
        w.finish().unwrap()
    }

    #[test]
    fn process_rules_match_image_suffix() {
        let store = RuleStore::new();
        let persist = store
            .update_process_rules(&process_update(
                Some(RuleType::Trusted),
                UpdateRulesMode::Replace,
                false,
                None,
                &[("\\edrsvc.exe", true, true)],
            ))
            .unwrap();
        assert!(persist.is_empty());
        assert_eq!(
            store.match_process_rule(ProcessOption::Trusted, "C:\\Program Files\\EDRSVC.EXE"),
            Some(RuleMatch {
                value: true,
                inherit: true
            })
        );
        assert_eq!(
            store.match_process_rule(ProcessOption::Protected, "c:\\x\\edrsvc.exe"),
            None
        );
    }

    #[test]
    fn process_delete_by_tag_spans_all_options() {
        let store = RuleStore::new();
        store
            .update_process_rules(&process_update(
                Some(RuleType::SendEvent),
                UpdateRulesMode::PushBack,
                true,
                Some("t1"),
                &[("a.exe", false, false)],
            ))
            .unwrap();
        store
            .update_process_rules(&process_update(
                Some(RuleType::EnableInject),
                UpdateRulesMode::PushBack,
                false,
                Some("t1"),
                &[("b.exe", false, false)],
            ))
            .unwrap();

        let persist = store
            .update_process_rules(&process_update(
                None,
                UpdateRulesMode::DeleteByTag,
                false,
                Some("t1"),
                &[],
            ))
            .unwrap();
        assert_eq!(persist.len(), 4);
        assert!(persist.iter().all(|p| p.blob.is_none()));
        assert!(store.process_rules(ProcessOption::SendEvents).is_empty());
        assert!(store.process_rules(ProcessOption::AllowInject).is_empty());

        let nothing = store
            .update_process_rules(&process_update(
                None,
                UpdateRulesMode::DeleteByTag,
                false,
                Some("t1"),
                &[],
            ))
            .unwrap();
        assert!(nothing.is_empty());
    }

    #[test]
    fn process_update_without_type_is_rejected() {
        let store = RuleStore::new();
        let payload = process_update(None, UpdateRulesMode::PushBack, false, None, &[("a", true, false)]);
        assert!(store.update_process_rules(&payload).is_err());
    }
}

//! Builds the LBVS payloads carried by control requests.

use anyhow::{anyhow, bail, Result};
use clap::{Args, ValueEnum};
use warden_core::lbvs::LbvsWriter;
use warden_core::protocol::{
    AccessType, ConfigField, RuleType, SetProcessInfoField, UpdateRulesField, UpdateRulesMode,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    Replace,
    Clear,
    PushBack,
    PushFront,
    DeleteByTag,
}

impl From<Mode> for UpdateRulesMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Replace => UpdateRulesMode::Replace,
            Mode::Clear => UpdateRulesMode::Clear,
            Mode::PushBack => UpdateRulesMode::PushBack,
            Mode::PushFront => UpdateRulesMode::PushFront,
            Mode::DeleteByTag => UpdateRulesMode::DeleteByTag,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OptionArg {
    Trusted,
    Protected,
    EnableInject,
    SendEvent,
}

impl From<OptionArg> for RuleType {
    fn from(option: OptionArg) -> Self {
        match option {
            OptionArg::Trusted => RuleType::Trusted,
            OptionArg::Protected => RuleType::Protected,
            OptionArg::EnableInject => RuleType::EnableInject,
            OptionArg::SendEvent => RuleType::SendEvent,
        }
    }
}

/// Header shared by every rule update.
#[derive(Args, Debug, Clone)]
pub struct RuleHeader {
    #[arg(long, value_enum, default_value = "replace")]
    pub mode: Mode,
    /// Tag applied to rules without their own, and matched by delete-by-tag
    #[arg(long)]
    pub tag: Option<String>,
    /// Override whether the rule set is saved across restarts
    #[arg(long)]
    pub persistent: Option<bool>,
}

impl RuleHeader {
    fn write(&self, w: &mut LbvsWriter) -> Result<()> {
        w.write_u32(UpdateRulesField::Mode, UpdateRulesMode::from(self.mode).raw());
        if let Some(persistent) = self.persistent {
            w.write_bool(UpdateRulesField::Persistent, persistent);
        }
        if let Some(tag) = &self.tag {
            w.write_wstr(UpdateRulesField::Tag, tag)?;
        }
        Ok(())
    }
}

/// `ACCESS[,recursive][,tag=T]:PATH`, e.g. `read-only,recursive:c:\warden`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathRuleArg {
    pub access: AccessType,
    pub recursive: bool,
    pub tag: Option<String>,
    pub path: String,
}

/// `VALUE[,inherit][,tag=T]:IMAGE`, e.g. `true,inherit:\agent.exe`.
///
/// IMAGE is a literal, case-insensitive suffix of the image path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRuleArg {
    pub value: bool,
    pub inherit: bool,
    pub tag: Option<String>,
    pub image: String,
}

fn split_rule(s: &str) -> Result<(Vec<&str>, &str)> {
    let (head, target) = s
        .split_once(':')
        .ok_or_else(|| anyhow!("rule {s:?} has no ':' before the path"))?;
    if target.is_empty() {
        bail!("rule {s:?} has an empty path");
    }
    Ok((head.split(',').map(str::trim).collect(), target))
}

fn parse_access(s: &str) -> Result<AccessType> {
    Ok(match s {
        "no-access" | "deny" => AccessType::NoAccess,
        "read-only" | "ro" => AccessType::ReadOnly,
        "full" => AccessType::Full,
        other => bail!("unknown access {other:?}"),
    })
}

fn parse_flag(flag: &str, tag: &mut Option<String>, named: &str, set: &mut bool) -> Result<()> {
    if let Some(t) = flag.strip_prefix("tag=") {
        *tag = Some(t.to_string());
    } else if flag == named {
        *set = true;
    } else {
        bail!("unknown rule flag {flag:?}");
    }
    Ok(())
}

impl std::str::FromStr for PathRuleArg {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (head, path) = split_rule(s)?;
        let mut rule = PathRuleArg {
            access: parse_access(head[0])?,
            recursive: false,
            tag: None,
            path: path.to_string(),
        };
        for flag in &head[1..] {
            parse_flag(flag, &mut rule.tag, "recursive", &mut rule.recursive)?;
        }
        Ok(rule)
    }
}

impl std::str::FromStr for ProcessRuleArg {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (head, image) = split_rule(s)?;
        if image.contains(['*', '?']) {
            bail!("image mask {image:?} is a literal path suffix, wildcards never match");
        }
        let value = head[0]
            .parse::<bool>()
            .map_err(|_| anyhow!("rule value must be true or false, got {:?}", head[0]))?;
        let mut rule = ProcessRuleArg {
            value,
            inherit: false,
            tag: None,
            image: image.to_string(),
        };
        for flag in &head[1..] {
            parse_flag(flag, &mut rule.tag, "inherit", &mut rule.inherit)?;
        }
        Ok(rule)
    }
}

/// Payload for `UpdateFileRules` and `UpdateRegistryRules`.
pub fn path_rules(header: &RuleHeader, rules: &[PathRuleArg]) -> Result<Vec<u8>> {
    let mut w = LbvsWriter::new();
    header.write(&mut w)?;
    for rule in rules {
        w.begin_group(UpdateRulesField::Rule);
        w.write_wstr(UpdateRulesField::RulePath, &rule.path)?;
        w.write_u32(UpdateRulesField::RuleValue, rule.access.raw());
        if rule.recursive {
            w.write_bool(UpdateRulesField::RuleRecursive, true);
        }
        if let Some(tag) = &rule.tag {
            w.write_wstr(UpdateRulesField::RuleTag, tag)?;
        }
    }
    Ok(w.finish()?)
}

/// Payload for `UpdateProcessRules`.
pub fn process_rules(option: OptionArg, header: &RuleHeader, rules: &[ProcessRuleArg]) -> Result<Vec<u8>> {
    let mut w = LbvsWriter::new();
    w.write_u32(UpdateRulesField::Type, RuleType::from(option).raw());
    header.write(&mut w)?;
    for rule in rules {
        w.begin_group(UpdateRulesField::Rule);
        w.write_wstr(UpdateRulesField::RuleImagePath, &rule.image)?;
        w.write_bool(UpdateRulesField::RuleValue, rule.value);
        w.write_bool(UpdateRulesField::RuleInherit, rule.inherit);
        if let Some(tag) = &rule.tag {
            w.write_wstr(UpdateRulesField::RuleTag, tag)?;
        }
    }
    Ok(w.finish()?)
}

/// Fields of a `SetConfig` record. Only the given ones are sent.
#[derive(Args, Debug, Clone, Default)]
pub struct ConfigArgs {
    #[arg(long)]
    pub disable_self_protection: Option<bool>,
    #[arg(long)]
    pub max_queue_size: Option<u64>,
    /// Grace period after the consumer disconnects, in milliseconds
    #[arg(long)]
    pub connection_timeout: Option<u64>,
    #[arg(long)]
    pub send_msg_timeout: Option<u64>,
    #[arg(long)]
    pub enable_dll_inject: Option<bool>,
    #[arg(long)]
    pub log_level: Option<u32>,
    #[arg(long)]
    pub log_file: Option<String>,
    /// Bit per event id; accepts 0x-prefixed hex
    #[arg(long, value_parser = parse_u64)]
    pub event_flags: Option<u64>,
    /// Bit per registry value type; accepts 0x-prefixed hex
    #[arg(long, value_parser = parse_u64)]
    pub sent_reg_types: Option<u64>,
    #[arg(long)]
    pub max_reg_value_size: Option<u64>,
    #[arg(long)]
    pub min_full_act_file_size: Option<u64>,
    #[arg(long)]
    pub max_full_act_file_size: Option<u64>,
    #[arg(long)]
    pub file_mon_name_mask: Option<String>,
    #[arg(long = "injected-dll")]
    pub injected_dlls: Vec<String>,
    #[arg(long)]
    pub verify_injected_dll: Option<bool>,
    #[arg(long)]
    pub open_process_repeat_timeout: Option<u64>,
    #[arg(long)]
    pub reg_event_repeat_timeout: Option<u64>,
}

pub fn parse_u64(s: &str) -> Result<u64, String> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    }
    .map_err(|e| format!("{s:?}: {e}"))
}

pub fn config(args: &ConfigArgs) -> Result<Vec<u8>> {
    let mut w = LbvsWriter::new();
    let numbers = [
        (ConfigField::MaxQueueSize, args.max_queue_size),
        (ConfigField::ConnectionTimeout, args.connection_timeout),
        (ConfigField::SendMsgTimeout, args.send_msg_timeout),
        (ConfigField::EventFlags, args.event_flags),
        (ConfigField::SentRegTypes, args.sent_reg_types),
        (ConfigField::MaxRegValueSize, args.max_reg_value_size),
        (ConfigField::MinFullActFileSize, args.min_full_act_file_size),
        (ConfigField::MaxFullActFileSize, args.max_full_act_file_size),
        (ConfigField::OpenProcessRepeatTimeout, args.open_process_repeat_timeout),
        (ConfigField::RegEventRepeatTimeout, args.reg_event_repeat_timeout),
    ];
    for (field, value) in numbers {
        if let Some(v) = value {
            w.write_u64(field, v);
        }
    }
    let flags = [
        (ConfigField::DisableSelfProtection, args.disable_self_protection),
        (ConfigField::EnableDllInject, args.enable_dll_inject),
        (ConfigField::VerifyInjectedDll, args.verify_injected_dll),
    ];
    for (field, value) in flags {
        if let Some(v) = value {
            w.write_bool(field, v);
        }
    }
    if let Some(level) = args.log_level {
        w.write_u32(ConfigField::LogLevel, level);
    }
    if let Some(file) = &args.log_file {
        w.write_wstr(ConfigField::LogFile, file)?;
    }
    if let Some(mask) = &args.file_mon_name_mask {
        w.write_wstr(ConfigField::FileMonNameMask, mask)?;
    }
    for dll in &args.injected_dlls {
        w.write_wstr(ConfigField::InjectedDll, dll)?;
    }
    Ok(w.finish()?)
}

#[derive(Args, Debug, Clone)]
pub struct ProcessInfoArgs {
    #[arg(long)]
    pub pid: u32,
    #[arg(long)]
    pub trusted: Option<bool>,
    #[arg(long)]
    pub protected: Option<bool>,
    #[arg(long)]
    pub send_event: Option<bool>,
    #[arg(long)]
    pub enable_inject: Option<bool>,
}

pub fn process_info(args: &ProcessInfoArgs) -> Result<Vec<u8>> {
    if args.pid == 0 {
        bail!("pid must be nonzero");
    }
    let mut w = LbvsWriter::new();
    w.write_u32(SetProcessInfoField::Pid, args.pid);
    let forced = [
        (SetProcessInfoField::Trusted, args.trusted),
        (SetProcessInfoField::Protected, args.protected),
        (SetProcessInfoField::SendEvent, args.send_event),
        (SetProcessInfoField::EnableInject, args.enable_inject),
    ];
    for (field, value) in forced {
        if let Some(v) = value {
            w.write_bool(field, v);
        }
    }
    Ok(w.finish()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_core::config::{apply_record, Config};
    use warden_core::process::{ProcessInfoUpdate, ProcessOption};
    use warden_core::rules::RuleStore;

    fn header(mode: Mode) -> RuleHeader {
        RuleHeader {
            mode,
            tag: None,
            persistent: None,
        }
    }

    #[test]
    fn path_rule_syntax() {
        let rule: PathRuleArg = "read-only,recursive,tag=core:c:\\warden".parse().unwrap();
        assert_eq!(
            rule,
            PathRuleArg {
                access: AccessType::ReadOnly,
                recursive: true,
                tag: Some("core".into()),
                path: "c:\\warden".into(),
            }
        );
        assert!("read-only".parse::<PathRuleArg>().is_err());
        assert!("sometimes:c:\\x".parse::<PathRuleArg>().is_err());
        assert!("full,deep:c:\\x".parse::<PathRuleArg>().is_err());
    }

    #[test]
    fn process_rule_masks_are_literal_suffixes() {
        let rule: ProcessRuleArg = "false,tag=ops:\\Tools\\Agent.exe".parse().unwrap();
        assert_eq!(
            rule,
            ProcessRuleArg {
                value: false,
                inherit: false,
                tag: Some("ops".into()),
                image: "\\Tools\\Agent.exe".into(),
            }
        );
        let err = "true,inherit:*\\agent.exe".parse::<ProcessRuleArg>().unwrap_err();
        assert!(err.to_string().contains("wildcards never match"));
        assert!("true:c:\\apps\\agent?.exe".parse::<ProcessRuleArg>().is_err());
        assert!("maybe:\\agent.exe".parse::<ProcessRuleArg>().is_err());
    }

    #[test]
    fn file_rules_payload_is_accepted_by_the_store() {
        let rules = vec![
            "read-only,recursive:c:\\warden".parse().unwrap(),
            "no-access:c:\\warden\\keys".parse().unwrap(),
        ];
        let payload = path_rules(&header(Mode::Replace), &rules).unwrap();
        let store = RuleStore::new();
        store.update_file_rules(&payload).unwrap();
        assert_eq!(store.file_rules().iter().count(), 2);
    }

    #[test]
    fn process_rules_payload_is_accepted_by_the_store() {
        let rules = vec!["true,inherit:\\agent.exe".parse().unwrap()];
        let payload = process_rules(OptionArg::Trusted, &header(Mode::PushBack), &rules).unwrap();
        let store = RuleStore::new();
        store.update_process_rules(&payload).unwrap();
        assert!(store
            .match_process_rule(ProcessOption::Trusted, "c:\\apps\\agent.exe")
            .is_some());
    }

    #[test]
    fn config_sends_only_given_fields() {
        let args = ConfigArgs {
            max_queue_size: Some(4096),
            log_level: Some(4),
            event_flags: Some(parse_u64("0x3").unwrap()),
            ..ConfigArgs::default()
        };
        let payload = config(&args).unwrap();
        let (cfg, _) = apply_record(&Config::default(), &payload).unwrap();
        assert_eq!(cfg.max_queue_size, 4096);
        assert_eq!(cfg.log_level, 4);
        assert_eq!(cfg.event_flags, 3);
        assert_eq!(cfg.connection_timeout_ms, Config::default().connection_timeout_ms);
    }

    #[test]
    fn process_info_round_trips() {
        let payload = process_info(&ProcessInfoArgs {
            pid: 4242,
            trusted: Some(true),
            protected: None,
            send_event: Some(false),
            enable_inject: None,
        })
        .unwrap();
        let update = ProcessInfoUpdate::parse(&payload).unwrap();
        assert_eq!(update.pid, 4242);
        assert_eq!(
            update.forced,
            vec![(ProcessOption::Trusted, true), (ProcessOption::SendEvents, false)]
        );
    }
}

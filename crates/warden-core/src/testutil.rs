//! Fixtures shared by the unit tests.

use crate::clock::ManualClock;
use crate::config::{Config, ConfigCell};
use crate::events::MemorySink;
use crate::lbvs::LbvsWriter;
use crate::process::NoProcessInfo;
use crate::protocol::{AccessType, RuleType, UpdateRulesField, UpdateRulesMode};
use crate::state::EngineState;
use std::sync::Arc;

pub(crate) const START_MS: u64 = 5_000;

/// Monitoring state over a memory sink and a manual clock, already started.
pub(crate) fn engine_state(cfg: Config) -> (EngineState, Arc<MemorySink>, Arc<ManualClock>) {
    let sink = Arc::new(MemorySink::new());
    let clock = Arc::new(ManualClock::new(START_MS));
    let state = EngineState::new(
        Arc::new(ConfigCell::new(cfg)),
        sink.clone(),
        clock.clone(),
        Arc::new(NoProcessInfo),
        1,
    );
    state.set_monitoring(true);
    (state, sink, clock)
}

/// Replace-mode file or registry rule payload of `(path, access, recursive)`.
pub(crate) fn path_rules(rules: &[(&str, AccessType, bool)]) -> Vec<u8> {
    let mut w = LbvsWriter::new();
    w.write_u32(UpdateRulesField::Mode, UpdateRulesMode::Replace.raw());
    for (path, access, recursive) in rules {
        w.begin_group(UpdateRulesField::Rule);
        w.write_wstr(UpdateRulesField::RulePath, path).unwrap();
        w.write_u32(UpdateRulesField::RuleValue, access.raw());
        w.write_bool(UpdateRulesField::RuleRecursive, *recursive);
    }
    w.finish().unwrap()
}

/// Replace-mode process rule payload of `(image_mask, value, inherit)`.
pub(crate) fn process_rules(rule_type: RuleType, rules: &[(&str, bool, bool)]) -> Vec<u8> {
    let mut w = LbvsWriter::new();
    w.write_u32(UpdateRulesField::Type, rule_type.raw());
    w.write_u32(UpdateRulesField::Mode, UpdateRulesMode::Replace.raw());
    for (image, value, inherit) in rules {
        w.begin_group(UpdateRulesField::Rule);
        w.write_wstr(UpdateRulesField::RuleImagePath, image).unwrap();
        w.write_bool(UpdateRulesField::RuleValue, *value);
        w.write_bool(UpdateRulesField::RuleInherit, *inherit);
    }
    w.finish().unwrap()
}

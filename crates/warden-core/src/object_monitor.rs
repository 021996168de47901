//! Process handle protection and open events.

use crate::access::process;
use crate::events;
use crate::interceptor::{HandleOpen, HandleOperation, ObjectInterceptor, OpenDecision};
use crate::process::ProcessOption;
use crate::protocol::{EventField, SysmonEvent};
use crate::state::EngineState;
use tracing::{debug, info, trace};

/// Carried from the pre-hook to the post-hook of a reported open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenToken {
    initiator_pid: u32,
    target_pid: u32,
}

impl OpenToken {
    pub fn initiator_pid(&self) -> u32 {
        self.initiator_pid
    }

    pub fn target_pid(&self) -> u32 {
        self.target_pid
    }
}

pub struct ObjectMonitor {
    state: EngineState,
}

impl ObjectMonitor {
    pub fn new(state: EngineState) -> Self {
        Self { state }
    }
}

impl ObjectInterceptor for ObjectMonitor {
    fn pre_open_process(&self, op: &HandleOpen) -> OpenDecision {
        let unchanged = OpenDecision {
            desired_access: op.desired_access,
            token: None,
        };
        if op.kernel_handle || op.initiator_pid == op.target_pid {
            return unchanged;
        }
        let destination = match op.operation {
            HandleOperation::Create => op.initiator_pid,
            HandleOperation::Duplicate => op.destination_pid,
        };
        let expanded = process::GENERIC_MAPPING.expand(op.desired_access);
        let target = self.state.processes.context(op.target_pid);
        let initiator = self.state.processes.context(op.initiator_pid);
        let parent = target.identity().parent_pid;
        let parent_child = parent == op.initiator_pid || parent == destination;

        let mut desired_access = op.desired_access;
        if !parent_child
            && target.value(ProcessOption::Protected)
            && !self.state.is_trusted(&initiator)
            && !initiator.identity().flags.csrss
            && expanded & process::DENIED_MASK != 0
        {
            desired_access = expanded & !process::DENIED_MASK;
            if desired_access == 0 {
                desired_access = process::QUERY_LIMITED_INFORMATION;
            }
            info!(
                initiator = op.initiator_pid,
                target = op.target_pid,
                requested = format_args!("{:#010x}", op.desired_access),
                granted = format_args!("{desired_access:#010x}"),
                "self-protection: process access restricted"
            );
        }

        let reported = self.state.is_monitoring()
            && !parent_child
            && initiator.value(ProcessOption::SendEvents)
            && self.state.config().event_enabled(SysmonEvent::ProcessOpen)
            && !target.is_terminated();
        OpenDecision {
            desired_access,
            token: reported.then_some(OpenToken {
                initiator_pid: op.initiator_pid,
                target_pid: op.target_pid,
            }),
        }
    }

    fn post_open_process(&self, token: OpenToken, granted_access: u32, succeeded: bool) {
        if !succeeded || granted_access & process::DETECTED_MASK == 0 {
            return;
        }
        let now = self.state.tick();
        let timeout = self.state.config().open_process_repeat_timeout_ms;
        let initiator = self.state.processes.context(token.initiator_pid);
        if !initiator.open_filter.lock().allow(token.target_pid, timeout, now) {
            trace!(initiator = token.initiator_pid, target = token.target_pid, "repeated open suppressed");
            return;
        }
        debug!(
            initiator = token.initiator_pid,
            target = token.target_pid,
            access = format_args!("{granted_access:#010x}"),
            "process open"
        );
        let mut w = events::begin(SysmonEvent::ProcessOpen, now, token.initiator_pid);
        w.write_u32(EventField::TargetProcessPid, token.target_pid);
        w.write_u32(EventField::AccessMask, granted_access);
        self.state.submit(w.finish());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::GENERIC_ALL;
    use crate::clock::ManualClock;
    use crate::config::Config;
    use crate::events::{to_json, MemorySink};
    use crate::process::{ProcessFlags, ProcessIdentity};
    use crate::testutil::engine_state;
    use std::sync::Arc;

    const GUARDED: u32 = 900;
    const ATTACKER: u32 = 500;

    fn setup() -> (ObjectMonitor, Arc<MemorySink>, EngineState, Arc<ManualClock>) {
        let (state, sink, clock) = engine_state(Config::default());
        state.processes.register(ProcessIdentity {
            pid: GUARDED,
            parent_pid: 10,
            image_path: "c:\\edr\\agent.exe".into(),
            ..ProcessIdentity::default()
        });
        state.processes.set_forced(GUARDED, ProcessOption::Protected, true);
        (ObjectMonitor::new(state.clone()), sink, state, clock)
    }

    fn open(initiator: u32, target: u32, access: u32) -> HandleOpen {
        HandleOpen {
            initiator_pid: initiator,
            target_pid: target,
            destination_pid: initiator,
            desired_access: access,
            ..HandleOpen::default()
        }
    }

    #[test]
    fn protected_target_loses_dangerous_rights() {
        let (mon, _, _, _) = setup();
        let d = mon.pre_open_process(&open(
            ATTACKER,
            GUARDED,
            process::TERMINATE | process::QUERY_LIMITED_INFORMATION,
        ));
        assert_eq!(d.desired_access, process::QUERY_LIMITED_INFORMATION);

        let d = mon.pre_open_process(&open(ATTACKER, GUARDED, process::VM_WRITE));
        assert_eq!(d.desired_access, process::QUERY_LIMITED_INFORMATION);

        let d = mon.pre_open_process(&open(ATTACKER, GUARDED, GENERIC_ALL));
        assert_eq!(d.desired_access & process::DENIED_MASK, 0);
        assert_ne!(d.desired_access, 0);

        let d = mon.pre_open_process(&open(ATTACKER, GUARDED, process::QUERY_LIMITED_INFORMATION));
        assert_eq!(d.desired_access, process::QUERY_LIMITED_INFORMATION);
    }

    #[test]
    fn exemptions_from_stripping() {
        let (mon, _, state, _) = setup();
        // parent
        let d = mon.pre_open_process(&open(10, GUARDED, process::TERMINATE));
        assert_eq!(d.desired_access, process::TERMINATE);
        // duplicated into the parent
        let dup = HandleOpen {
            destination_pid: 10,
            operation: HandleOperation::Duplicate,
            ..open(ATTACKER, GUARDED, process::TERMINATE)
        };
        assert_eq!(mon.pre_open_process(&dup).desired_access, process::TERMINATE);
        // kernel handles and self access
        let kernel = HandleOpen {
            kernel_handle: true,
            ..open(ATTACKER, GUARDED, process::TERMINATE)
        };
        assert_eq!(mon.pre_open_process(&kernel).desired_access, process::TERMINATE);
        assert_eq!(
            mon.pre_open_process(&open(GUARDED, GUARDED, process::TERMINATE)).desired_access,
            process::TERMINATE
        );
        // session subsystem
        state.processes.register(ProcessIdentity {
            pid: 600,
            flags: ProcessFlags {
                csrss: true,
                ..ProcessFlags::default()
            },
            ..ProcessIdentity::default()
        });
        assert_eq!(
            mon.pre_open_process(&open(600, GUARDED, process::TERMINATE)).desired_access,
            process::TERMINATE
        );
        // trusted caller
        state.processes.set_forced(ATTACKER, ProcessOption::Trusted, true);
        assert_eq!(
            mon.pre_open_process(&open(ATTACKER, GUARDED, process::TERMINATE)).desired_access,
            process::TERMINATE
        );
    }

    #[test]
    fn open_event_and_repeat_suppression() {
        let (mon, sink, _, clock) = setup();
        let d = mon.pre_open_process(&open(ATTACKER, 700, process::VM_WRITE));
        let token = d.token.unwrap();
        mon.post_open_process(token, process::VM_WRITE, true);
        let json = to_json(&sink.take()[0]).unwrap();
        assert_eq!(json["RawEventId"], SysmonEvent::ProcessOpen.raw());
        assert_eq!(json["ProcessPid"], ATTACKER);
        assert_eq!(json["TargetProcessPid"], 700);
        assert_eq!(json["AccessMask"], process::VM_WRITE);

        clock.advance(1_000);
        mon.post_open_process(token, process::VM_WRITE, true);
        assert!(sink.is_empty());

        // another target is independent
        let other = mon.pre_open_process(&open(ATTACKER, 701, process::VM_WRITE)).token.unwrap();
        mon.post_open_process(other, process::VM_WRITE, true);
        assert_eq!(sink.take().len(), 1);

        clock.advance(crate::config::DEFAULT_OPEN_PROCESS_REPEAT_TIMEOUT_MS);
        mon.post_open_process(token, process::VM_WRITE, true);
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn harmless_or_failed_opens_are_not_reported() {
        let (mon, sink, _, _) = setup();
        let token = mon
            .pre_open_process(&open(ATTACKER, 700, process::QUERY_LIMITED_INFORMATION))
            .token
            .unwrap();
        mon.post_open_process(token, process::QUERY_LIMITED_INFORMATION, true);
        mon.post_open_process(token, process::VM_WRITE, false);
        assert!(sink.is_empty());
    }

    #[test]
    fn no_token_when_not_reporting() {
        let (mon, _, state, _) = setup();
        assert!(mon.pre_open_process(&open(10, GUARDED, process::VM_READ)).token.is_none());

        state.processes.set_forced(ATTACKER, ProcessOption::SendEvents, false);
        assert!(mon.pre_open_process(&open(ATTACKER, 700, process::VM_READ)).token.is_none());

        state.set_monitoring(false);
        assert!(mon.pre_open_process(&open(400, 700, process::VM_READ)).token.is_none());
    }
}

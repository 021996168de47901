//! Process lifecycle events.

use crate::events;
use crate::interceptor::ProcessInterceptor;
use crate::lbvs::CodecError;
use crate::process::{ProcessIdentity, ProcessOption};
use crate::protocol::{EventField, SysmonEvent};
use crate::state::EngineState;
use tracing::debug;

fn create_record(tick_ms: u64, identity: &ProcessIdentity) -> Result<Vec<u8>, CodecError> {
    let mut w = events::begin(SysmonEvent::ProcessCreate, tick_ms, identity.pid);
    w.write_u64(EventField::ProcessCreationTime, identity.creation_time_ms);
    w.write_u64(EventField::ProcessParentPid, u64::from(identity.parent_pid));
    if identity.creator_pid != identity.parent_pid {
        w.write_u32(EventField::ProcessCreatorPid, identity.creator_pid);
    }
    w.write_wstr(EventField::ProcessCmdLine, &identity.command_line)?;
    w.write_wstr(EventField::ProcessImageFile, &identity.image_path)?;
    if !identity.user_sid.is_empty() {
        w.write_str(EventField::ProcessUserSid, &identity.user_sid)?;
    }
    if let Some(elevated) = identity.is_elevated {
        w.write_bool(EventField::ProcessIsElevated, elevated);
    }
    if let Some(elevation_type) = identity.elevation_type {
        w.write_u32(EventField::ProcessElevationType, elevation_type);
    }
    w.finish()
}

pub struct ProcessMonitor {
    state: EngineState,
}

impl ProcessMonitor {
    pub fn new(state: EngineState) -> Self {
        Self { state }
    }
}

impl ProcessInterceptor for ProcessMonitor {
    fn process_created(&self, identity: ProcessIdentity) {
        let creator = identity.creator_pid;
        let ctx = self.state.processes.register(identity);
        if creator != 0 && creator != ctx.pid() {
            self.state.processes.context(creator);
        }
        debug!(pid = ctx.pid(), parent = ctx.identity().parent_pid, image = %ctx.identity().image_path, "process created");

        if !self.state.is_monitoring()
            || !ctx.value(ProcessOption::SendEvents)
            || !self.state.config().event_enabled(SysmonEvent::ProcessCreate)
        {
            return;
        }
        self.state.submit(create_record(self.state.tick(), ctx.identity()));
    }

    fn process_exited(&self, pid: u32, exit_code: u32, exit_time_ms: u64) {
        // make sure there is a live context to finish
        let ctx = self.state.processes.context(pid);
        self.state.processes.finish(pid);
        debug!(pid, exit_code, "process exited");

        if !self.state.is_monitoring()
            || !ctx.value(ProcessOption::SendEvents)
            || !self.state.config().event_enabled(SysmonEvent::ProcessDelete)
        {
            return;
        }
        let mut w = events::begin(SysmonEvent::ProcessDelete, self.state.tick(), pid);
        w.write_u64(EventField::ProcessDeletionTime, exit_time_ms);
        w.write_u32(EventField::ProcessExitCode, exit_code);
        self.state.submit(w.finish());
    }
}

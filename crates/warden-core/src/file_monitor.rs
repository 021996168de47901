//! File-handle state machine.
//!
//! A handle moves from open through any number of reads and writes to
//! cleanup. Two sequence trackers watch for a contiguous transfer covering
//! the whole file; cleanup turns what they saw into events.

use crate::access::file;
use crate::events;
use crate::hashing::{digest_hex, ContentHasher};
use crate::interceptor::{
    disposition_flags, CreateDisposition, Disposition, FileCreate, FileCreated, FileInterceptor,
    PreCreate, Transfer, TransferStatus, Volume, VolumeKind,
};
use crate::lbvs::CodecError;
use crate::protocol::{EventField, SysmonEvent};
use crate::state::EngineState;
use std::fmt;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreationStatus {
    Opened,
    Created,
    Truncated,
}

impl From<CreateDisposition> for CreationStatus {
    fn from(d: CreateDisposition) -> Self {
        match d {
            CreateDisposition::Superseded | CreateDisposition::Overwritten => Self::Truncated,
            CreateDisposition::Created => Self::Created,
            CreateDisposition::Opened | CreateDisposition::Other => Self::Opened,
        }
    }
}

/// Follows one direction of contiguous transfers from offset zero.
#[derive(Default)]
pub struct SequenceTracker {
    armed: bool,
    next_pos: u64,
    hasher: Option<Box<dyn ContentHasher>>,
    allow_nested: bool,
}

impl fmt::Debug for SequenceTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SequenceTracker")
            .field("armed", &self.armed)
            .field("next_pos", &self.next_pos)
            .field("allow_nested", &self.allow_nested)
            .finish()
    }
}

impl SequenceTracker {
    fn arm(&mut self, hasher: Box<dyn ContentHasher>) {
        self.armed = true;
        self.next_pos = 0;
        self.hasher = Some(hasher);
        self.allow_nested = false;
    }

    fn disarm(&mut self) {
        self.armed = false;
        self.allow_nested = false;
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn next_pos(&self) -> u64 {
        self.next_pos
    }

    pub fn digest(&self) -> Option<u64> {
        self.hasher.as_ref().map(|h| h.digest())
    }

    fn feed(&mut self, data: &[u8]) {
        match self.hasher.as_mut() {
            Some(hasher) => {
                hasher.update(data);
                self.next_pos += data.len() as u64;
            }
            None => self.disarm(),
        }
    }

    /// Pre-transfer position check. Returns whether the post call matters.
    fn check_position(&mut self, io: &Transfer) -> bool {
        if !self.armed || io.length == 0 {
            return false;
        }
        if io.position != self.next_pos {
            self.disarm();
            return false;
        }
        true
    }

    fn complete(&mut self, status: TransferStatus, data: &[u8]) {
        if !self.armed {
            return;
        }
        match status {
            TransferStatus::Success => self.feed(data),
            TransferStatus::FastIoDisallowed => self.allow_nested = true,
            TransferStatus::Failed => self.disarm(),
        }
    }

    /// Nested transfers are ignored except the one slow-path retry that
    /// follows a fast-path refusal. The allowance is consumed here.
    fn admits(&mut self, io: &Transfer) -> bool {
        if !io.nested {
            return true;
        }
        if self.armed && self.allow_nested && io.slow_path {
            self.allow_nested = false;
            return true;
        }
        false
    }
}

/// Everything remembered about one open handle.
#[derive(Debug)]
pub struct FileHandleState {
    pid: u32,
    path: String,
    volume: Volume,
    size_at_open: Option<u64>,
    creation: CreationStatus,
    is_execute: bool,
    delete_on_close: bool,
    disposition_delete: bool,
    was_changed: bool,
    skip: bool,
    read: SequenceTracker,
    write: SequenceTracker,
}

impl FileHandleState {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn creation(&self) -> CreationStatus {
        self.creation
    }

    pub fn is_execute(&self) -> bool {
        self.is_execute
    }

    pub fn is_skipped(&self) -> bool {
        self.skip
    }

    pub fn was_changed(&self) -> bool {
        self.was_changed
    }

    pub fn is_deleted(&self) -> bool {
        self.delete_on_close || self.disposition_delete
    }

    pub fn read_tracker(&self) -> &SequenceTracker {
        &self.read
    }

    pub fn write_tracker(&self) -> &SequenceTracker {
        &self.write
    }
}

fn file_record(
    event: SysmonEvent,
    tick_ms: u64,
    handle: &FileHandleState,
    digest: Option<u64>,
) -> Result<Vec<u8>, CodecError> {
    let mut w = events::begin(event, tick_ms, handle.pid);
    w.write_wstr(EventField::FilePath, &handle.path)?;
    w.write_wstr(EventField::FileVolumeGuid, &handle.volume.guid)?;
    w.write_str(EventField::FileVolumeType, handle.volume.kind.as_str())?;
    if let Some(device) = handle.volume.device.as_deref().filter(|d| !d.is_empty()) {
        w.write_wstr(EventField::FileVolumeDevice, device)?;
    }
    if let Some(digest) = digest {
        w.write_str(EventField::FileRawHash, &digest_hex(digest))?;
    }
    w.finish()
}

pub struct FileMonitor {
    state: EngineState,
}

impl FileMonitor {
    pub fn new(state: EngineState) -> Self {
        Self { state }
    }

    fn send(&self, event: SysmonEvent, handle: &FileHandleState, digest: Option<u64>) {
        if !self.state.config().event_enabled(event) || handle.skip {
            return;
        }
        if !self.state.sends_events(handle.pid) {
            return;
        }
        debug!(event = ?event, pid = handle.pid, path = %handle.path, "file event");
        let record = file_record(event, self.state.tick(), handle, digest);
        self.state.submit(record);
    }

    fn is_protected_write(&self, op: &FileCreate) -> bool {
        let ctx = self.state.processes.context(op.pid);
        if self.state.is_trusted(&ctx) || op.volume.kind == VolumeKind::Network {
            return false;
        }
        let requested = file::GENERIC_MAPPING.expand(op.desired_access);
        let effect = self.state.rules.file_effect(&op.path);
        if effect.permits(requested, file::WRITE_MASK) {
            return false;
        }
        info!(
            pid = op.pid,
            access = format_args!("{:#010x}", op.desired_access),
            path = %op.path,
            "self-protection: file access denied"
        );
        true
    }
}

impl FileInterceptor for FileMonitor {
    fn pre_create(&self, op: &FileCreate) -> PreCreate {
        if op.special {
            return PreCreate::Skip;
        }
        if self.is_protected_write(op) {
            return PreCreate::Deny;
        }
        if !self.state.is_monitoring() || !self.state.sends_events(op.pid) {
            return PreCreate::Skip;
        }
        if !self.state.config().any_file_event_enabled() {
            return PreCreate::Skip;
        }
        PreCreate::Track
    }

    fn post_create(&self, op: &FileCreate, result: &FileCreated) -> Option<FileHandleState> {
        if !self.state.is_monitoring() || !result.succeeded || result.is_directory {
            return None;
        }
        let cfg = self.state.config();
        let mut handle = FileHandleState {
            pid: op.pid,
            path: op.path.clone(),
            volume: op.volume.clone(),
            size_at_open: result.size,
            creation: result.disposition.into(),
            is_execute: !op.directory_file
                && op.desired_access & file::EXECUTE != 0
                && op.desired_access & (file::WRITE_DATA | file::READ_EA) == 0,
            delete_on_close: op.delete_on_close,
            disposition_delete: false,
            was_changed: false,
            skip: !cfg.file_mask_allows(&op.path),
            read: SequenceTracker::default(),
            write: SequenceTracker::default(),
        };

        if !handle.skip {
            if cfg.event_enabled(SysmonEvent::FileDataWriteFull) && handle.size_at_open == Some(0) {
                handle.write.arm(self.state.hasher.start());
            }
            if cfg.event_enabled(SysmonEvent::FileDataReadFull)
                && handle.size_at_open.is_some_and(|size| cfg.in_full_act_window(size))
            {
                handle.read.arm(self.state.hasher.start());
            }
            self.send(SysmonEvent::FileCreate, &handle, None);
            trace!(
                pid = handle.pid,
                size = ?handle.size_at_open,
                full_read = handle.read.armed,
                full_write = handle.write.armed,
                path = %handle.path,
                "handle opened"
            );
        }
        Some(handle)
    }

    fn pre_write(&self, handle: &mut FileHandleState, io: &Transfer) -> bool {
        if !self.state.is_monitoring() || handle.skip || !handle.write.admits(io) {
            return false;
        }
        let mut post_needed = handle.write.check_position(io);
        if post_needed && io.position > self.state.config().max_full_act_file_size {
            handle.write.disarm();
            post_needed = false;
        }
        post_needed || !handle.was_changed
    }

    fn post_write(&self, handle: &mut FileHandleState, status: TransferStatus, data: &[u8]) {
        if !self.state.is_monitoring() {
            return;
        }
        if status == TransferStatus::Success {
            handle.was_changed = true;
            handle.read.disarm();
        }
        handle.write.complete(status, data);
    }

    fn pre_read(&self, handle: &mut FileHandleState, io: &Transfer) -> bool {
        if !self.state.is_monitoring() || handle.skip || !handle.read.admits(io) {
            return false;
        }
        handle.read.check_position(io)
    }

    fn post_read(&self, handle: &mut FileHandleState, status: TransferStatus, data: &[u8]) {
        if !self.state.is_monitoring() {
            return;
        }
        handle.read.complete(status, data);
    }

    fn pre_set_disposition(&self, handle: &FileHandleState) -> bool {
        self.state.is_monitoring() && !handle.skip
    }

    fn post_set_disposition(&self, handle: &mut FileHandleState, info: Disposition, succeeded: bool) {
        if !self.state.is_monitoring() || !succeeded {
            return;
        }
        match info {
            Disposition::Basic { delete } => handle.disposition_delete = delete,
            Disposition::Extended { flags } => {
                let delete = flags & disposition_flags::DELETE != 0;
                if flags & disposition_flags::ON_CLOSE != 0 {
                    handle.delete_on_close = delete;
                } else {
                    handle.disposition_delete = delete;
                }
            }
        }
    }

    fn cleanup(&self, handle: FileHandleState, succeeded: bool) {
        if !self.state.is_monitoring() || !succeeded || handle.skip {
            return;
        }
        let cfg = self.state.config();
        let deleted = handle.is_deleted();
        debug!(
            pid = handle.pid,
            deleted,
            changed = handle.was_changed,
            read_pos = handle.read.next_pos,
            read_armed = handle.read.armed,
            write_pos = handle.write.next_pos,
            write_armed = handle.write.armed,
            "handle cleanup"
        );

        if handle.write.armed && !deleted && cfg.in_full_act_window(handle.write.next_pos) {
            match handle.write.digest() {
                Some(digest) => {
                    info!(pid = handle.pid, size = handle.write.next_pos, hash = %digest_hex(digest), path = %handle.path, "full write");
                    self.send(SysmonEvent::FileDataWriteFull, &handle, Some(digest));
                }
                None => warn!(pid = handle.pid, "armed write tracker without hasher"),
            }
        }

        if handle.read.armed
            && handle.size_at_open == Some(handle.read.next_pos)
            && cfg.in_full_act_window(handle.read.next_pos)
        {
            if let Some(digest) = handle.read.digest() {
                info!(pid = handle.pid, size = handle.read.next_pos, hash = %digest_hex(digest), path = %handle.path, "full read");
                self.send(SysmonEvent::FileDataReadFull, &handle, Some(digest));
            }
        }

        if handle.was_changed && !deleted {
            self.send(SysmonEvent::FileDataChange, &handle, None);
        }
        if deleted && handle.creation != CreationStatus::Created {
            self.send(SysmonEvent::FileDelete, &handle, None);
        }
        self.send(SysmonEvent::FileClose, &handle, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::events::{event_id, to_json, MemorySink};
    use crate::hashing::{Blake3Digest64, HashAlgorithm};
    use crate::protocol::AccessType;
    use crate::testutil::{engine_state, path_rules};
    use std::sync::Arc;

    fn setup(cfg: Config) -> (FileMonitor, Arc<MemorySink>, EngineState) {
        let (state, sink, _) = engine_state(cfg);
        (FileMonitor::new(state.clone()), sink, state)
    }

    fn open(path: &str) -> FileCreate {
        FileCreate {
            pid: 300,
            path: path.into(),
            volume: Volume {
                guid: "{vol-1}".into(),
                kind: VolumeKind::Fixed,
                device: Some("\\Device\\HarddiskVolume2".into()),
            },
            desired_access: file::READ_DATA | file::WRITE_DATA,
            ..FileCreate::default()
        }
    }

    fn created(size: u64, disposition: CreateDisposition) -> FileCreated {
        FileCreated {
            succeeded: true,
            is_directory: false,
            size: Some(size),
            disposition,
        }
    }

    fn at(position: u64, length: u64) -> Transfer {
        Transfer {
            position,
            length,
            ..Transfer::default()
        }
    }

    fn ids(sink: &MemorySink) -> Vec<SysmonEvent> {
        sink.take()
            .iter()
            .filter_map(|r| event_id(r).unwrap())
            .collect()
    }

    fn write(mon: &FileMonitor, h: &mut FileHandleState, pos: u64, data: &[u8]) {
        if mon.pre_write(h, &at(pos, data.len() as u64)) {
            mon.post_write(h, TransferStatus::Success, data);
        }
    }

    fn read(mon: &FileMonitor, h: &mut FileHandleState, pos: u64, data: &[u8]) {
        if mon.pre_read(h, &at(pos, data.len() as u64)) {
            mon.post_read(h, TransferStatus::Success, data);
        }
    }

    #[test]
    fn full_write_of_new_file() {
        let (mon, sink, _) = setup(Config::default());
        let op = open("c:\\data\\new.bin");
        assert_eq!(mon.pre_create(&op), PreCreate::Track);
        let mut h = mon.post_create(&op, &created(0, CreateDisposition::Created)).unwrap();
        let payload = [0x5Au8; 100];
        write(&mon, &mut h, 0, &payload);
        mon.cleanup(h, true);

        let records = sink.take();
        let events: Vec<_> = records.iter().map(|r| event_id(r).unwrap().unwrap()).collect();
        assert_eq!(
            events,
            vec![
                SysmonEvent::FileCreate,
                SysmonEvent::FileDataWriteFull,
                SysmonEvent::FileDataChange,
                SysmonEvent::FileClose
            ]
        );
        let full = to_json(&records[1]).unwrap();
        assert_eq!(full["FileRawHash"], digest_hex(Blake3Digest64.digest_of(&payload)));
        assert_eq!(full["FilePath"], "c:\\data\\new.bin");
        assert_eq!(full["FileVolumeType"], "FIXED");
        assert_eq!(full["FileVolumeDevice"], "\\Device\\HarddiskVolume2");
        assert_eq!(full["ProcessPid"], 300);
    }

    #[test]
    fn full_read_in_chunks() {
        let (mon, sink, _) = setup(Config::default());
        let op = open("c:\\doc.txt");
        let mut h = mon.post_create(&op, &created(500, CreateDisposition::Opened)).unwrap();
        assert!(!h.write_tracker().is_armed());
        let content: Vec<u8> = (0..500u32).map(|i| i as u8).collect();
        read(&mon, &mut h, 0, &content[..200]);
        read(&mon, &mut h, 200, &content[200..]);
        mon.cleanup(h, true);

        let records = sink.take();
        assert_eq!(records.len(), 3);
        assert_eq!(event_id(&records[1]).unwrap(), Some(SysmonEvent::FileDataReadFull));
        assert_eq!(
            to_json(&records[1]).unwrap()["FileRawHash"],
            digest_hex(Blake3Digest64.digest_of(&content))
        );
        assert_eq!(event_id(&records[2]).unwrap(), Some(SysmonEvent::FileClose));
    }

    #[test]
    fn out_of_order_read_disarms_tracker() {
        let (mon, sink, _) = setup(Config::default());
        let mut h = mon
            .post_create(&open("c:\\doc.txt"), &created(100, CreateDisposition::Opened))
            .unwrap();
        read(&mon, &mut h, 50, &[0u8; 50]);
        assert!(!h.read_tracker().is_armed());
        read(&mon, &mut h, 0, &[0u8; 100]);
        mon.cleanup(h, true);
        assert_eq!(ids(&sink), vec![SysmonEvent::FileCreate, SysmonEvent::FileClose]);
    }

    #[test]
    fn partial_read_produces_no_full_read() {
        let (mon, sink, _) = setup(Config::default());
        let mut h = mon
            .post_create(&open("c:\\doc.txt"), &created(100, CreateDisposition::Opened))
            .unwrap();
        read(&mon, &mut h, 0, &[1u8; 60]);
        mon.cleanup(h, true);
        assert_eq!(ids(&sink), vec![SysmonEvent::FileCreate, SysmonEvent::FileClose]);
    }

    #[test]
    fn write_disarms_read_tracking_and_marks_change() {
        let (mon, sink, _) = setup(Config::default());
        let mut h = mon
            .post_create(&open("c:\\doc.txt"), &created(10, CreateDisposition::Opened))
            .unwrap();
        read(&mon, &mut h, 0, &[1u8; 5]);
        write(&mon, &mut h, 3, b"xy");
        assert!(!h.read_tracker().is_armed());
        assert!(h.was_changed());
        read(&mon, &mut h, 5, &[1u8; 5]);
        mon.cleanup(h, true);
        assert_eq!(
            ids(&sink),
            vec![SysmonEvent::FileCreate, SysmonEvent::FileDataChange, SysmonEvent::FileClose]
        );
    }

    #[test]
    fn fast_io_refusal_admits_one_nested_retry() {
        let (mon, sink, _) = setup(Config::default());
        let mut h = mon
            .post_create(&open("e:\\usb.bin"), &created(0, CreateDisposition::Created))
            .unwrap();
        assert!(mon.pre_write(&mut h, &at(0, 4)));
        mon.post_write(&mut h, TransferStatus::FastIoDisallowed, &[]);
        assert!(h.write_tracker().is_armed());

        let retry = Transfer {
            position: 0,
            length: 4,
            nested: true,
            slow_path: true,
        };
        assert!(mon.pre_write(&mut h, &retry));
        mon.post_write(&mut h, TransferStatus::Success, b"abcd");
        // allowance is spent
        assert!(!mon.pre_write(&mut h, &Transfer { position: 4, ..retry }));
        mon.cleanup(h, true);

        let records = sink.take();
        assert_eq!(event_id(&records[1]).unwrap(), Some(SysmonEvent::FileDataWriteFull));
        assert_eq!(
            to_json(&records[1]).unwrap()["FileRawHash"],
            digest_hex(Blake3Digest64.digest_of(b"abcd"))
        );
    }

    #[test]
    fn failed_write_disarms_write_tracking() {
        let (mon, sink, _) = setup(Config::default());
        let mut h = mon
            .post_create(&open("c:\\n.bin"), &created(0, CreateDisposition::Created))
            .unwrap();
        assert!(mon.pre_write(&mut h, &at(0, 4)));
        mon.post_write(&mut h, TransferStatus::Failed, &[]);
        assert!(!h.write_tracker().is_armed());
        mon.cleanup(h, true);
        assert_eq!(ids(&sink), vec![SysmonEvent::FileCreate, SysmonEvent::FileClose]);
    }

    #[test]
    fn delete_of_existing_file_reports_delete_not_change() {
        let (mon, sink, _) = setup(Config::default());
        let mut h = mon
            .post_create(&open("c:\\old.txt"), &created(10, CreateDisposition::Opened))
            .unwrap();
        write(&mon, &mut h, 0, b"zz");
        assert!(mon.pre_set_disposition(&h));
        mon.post_set_disposition(&mut h, Disposition::Basic { delete: true }, true);
        mon.cleanup(h, true);
        assert_eq!(ids(&sink), vec![SysmonEvent::FileCreate, SysmonEvent::FileDelete, SysmonEvent::FileClose]);
    }

    #[test]
    fn deleting_a_file_created_by_this_handle_is_silent() {
        let (mon, sink, _) = setup(Config::default());
        let mut op = open("c:\\tmp.txt");
        op.delete_on_close = true;
        let mut h = mon.post_create(&op, &created(0, CreateDisposition::Created)).unwrap();
        write(&mon, &mut h, 0, b"temp");
        mon.cleanup(h, true);
        assert_eq!(ids(&sink), vec![SysmonEvent::FileCreate, SysmonEvent::FileClose]);
    }

    #[test]
    fn extended_disposition_flags() {
        let (mon, _, _) = setup(Config::default());
        let mut h = mon
            .post_create(&open("c:\\a"), &created(1, CreateDisposition::Opened))
            .unwrap();
        mon.post_set_disposition(
            &mut h,
            Disposition::Extended {
                flags: disposition_flags::DELETE | disposition_flags::ON_CLOSE,
            },
            true,
        );
        assert!(h.delete_on_close && !h.disposition_delete);
        mon.post_set_disposition(&mut h, Disposition::Extended { flags: disposition_flags::ON_CLOSE }, true);
        assert!(!h.is_deleted());
        mon.post_set_disposition(&mut h, Disposition::Extended { flags: disposition_flags::DELETE }, true);
        assert!(h.disposition_delete);
    }

    #[test]
    fn creation_status_and_execute_classification() {
        assert_eq!(CreationStatus::from(CreateDisposition::Superseded), CreationStatus::Truncated);
        assert_eq!(CreationStatus::from(CreateDisposition::Overwritten), CreationStatus::Truncated);
        assert_eq!(CreationStatus::from(CreateDisposition::Created), CreationStatus::Created);
        assert_eq!(CreationStatus::from(CreateDisposition::Other), CreationStatus::Opened);

        let (mon, _, _) = setup(Config::default());
        let mut op = open("c:\\tool.exe");
        op.desired_access = file::EXECUTE | file::READ_DATA;
        let h = mon.post_create(&op, &created(1, CreateDisposition::Opened)).unwrap();
        assert!(h.is_execute());
        op.desired_access = file::EXECUTE | file::READ_EA;
        let h = mon.post_create(&op, &created(1, CreateDisposition::Opened)).unwrap();
        assert!(!h.is_execute());
    }

    #[test]
    fn directories_and_failures_are_not_tracked() {
        let (mon, _, _) = setup(Config::default());
        let op = open("c:\\dir");
        let mut result = created(0, CreateDisposition::Opened);
        result.is_directory = true;
        assert!(mon.post_create(&op, &result).is_none());
        result.is_directory = false;
        result.succeeded = false;
        assert!(mon.post_create(&op, &result).is_none());
    }

    #[test]
    fn name_mask_skips_other_files() {
        let cfg = Config {
            file_mon_name_mask: Some(".test".into()),
            ..Config::default()
        };
        let (mon, sink, _) = setup(cfg);
        let h = mon
            .post_create(&open("c:\\a.txt"), &created(0, CreateDisposition::Created))
            .unwrap();
        assert!(h.is_skipped());
        mon.cleanup(h, true);
        let h = mon
            .post_create(&open("c:\\b.TEST"), &created(0, CreateDisposition::Created))
            .unwrap();
        mon.cleanup(h, true);
        assert_eq!(ids(&sink), vec![SysmonEvent::FileCreate, SysmonEvent::FileClose]);
    }

    #[test]
    fn allow_listed_process_sends_nothing() {
        let (mon, sink, state) = setup(Config::default());
        state
            .processes
            .set_forced(300, crate::process::ProcessOption::SendEvents, false);
        assert_eq!(mon.pre_create(&open("c:\\x")), PreCreate::Skip);
        let mut h = mon
            .post_create(&open("c:\\x"), &created(0, CreateDisposition::Created))
            .unwrap();
        write(&mon, &mut h, 0, b"abc");
        mon.cleanup(h, true);
        assert!(sink.is_empty());
    }

    #[test]
    fn self_protection_denies_writes_to_read_only_tree() {
        let (mon, _, state) = setup(Config::default());
        state
            .rules
            .update_file_rules(&path_rules(&[("c:\\edr", AccessType::ReadOnly, true)]))
            .unwrap();
        let mut op = open("c:\\edr\\agent.exe");
        assert_eq!(mon.pre_create(&op), PreCreate::Deny);

        op.desired_access = file::READ_DATA;
        assert_eq!(mon.pre_create(&op), PreCreate::Track);

        op.desired_access = crate::access::GENERIC_WRITE;
        assert_eq!(mon.pre_create(&op), PreCreate::Deny);

        op.volume.kind = VolumeKind::Network;
        assert_eq!(mon.pre_create(&op), PreCreate::Track);

        op.volume.kind = VolumeKind::Fixed;
        state
            .processes
            .set_forced(op.pid, crate::process::ProcessOption::Trusted, true);
        assert_eq!(mon.pre_create(&op), PreCreate::Track);
    }

    #[test]
    fn disabled_self_protection_allows_everything() {
        let cfg = Config {
            disable_self_protection: true,
            ..Config::default()
        };
        let (mon, _, state) = setup(cfg);
        state
            .rules
            .update_file_rules(&path_rules(&[("c:\\edr", AccessType::NoAccess, true)]))
            .unwrap();
        assert_eq!(mon.pre_create(&open("c:\\edr\\x")), PreCreate::Track);
    }

    #[test]
    fn stopped_monitoring_tracks_nothing() {
        let (mon, sink, state) = setup(Config::default());
        state.set_monitoring(false);
        let op = open("c:\\x");
        assert_eq!(mon.pre_create(&op), PreCreate::Skip);
        assert!(mon.post_create(&op, &created(0, CreateDisposition::Created)).is_none());
        assert!(sink.is_empty());
    }
}

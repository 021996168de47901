//! Per-operation hooks an OS adapter drives.
//!
//! Each pre/post pair of the host's interception framework maps onto one
//! trait method pair here. Adapters own the per-handle and per-call values
//! ([`FileHandleState`], [`PendingEvent`], [`OpenToken`]) and hand them back
//! on the matching post call.

use crate::file_monitor::FileHandleState;
use crate::object_monitor::OpenToken;
use crate::process::ProcessIdentity;
use crate::registry_monitor::PendingEvent;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Allow,
    Deny,
}

// ─── Files ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeKind {
    Fixed,
    Network,
    Removable,
}

impl VolumeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            VolumeKind::Fixed => "FIXED",
            VolumeKind::Network => "NETWORK",
            VolumeKind::Removable => "REMOVABLE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub guid: String,
    pub kind: VolumeKind,
    #[serde(default)]
    pub device: Option<String>,
}

impl Default for Volume {
    fn default() -> Self {
        Self {
            guid: String::new(),
            kind: VolumeKind::Fixed,
            device: None,
        }
    }
}

/// An open/create request as seen before the file system runs it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileCreate {
    pub pid: u32,
    pub path: String,
    pub volume: Volume,
    pub desired_access: u32,
    /// Opened with the directory-only option.
    pub directory_file: bool,
    pub delete_on_close: bool,
    /// Pipes, mailslots, volume opens, paging files, prefetcher and
    /// down-level opens. Never monitored.
    pub special: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreCreate {
    Deny,
    /// No post callback needed.
    Skip,
    Track,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreateDisposition {
    Superseded,
    #[default]
    Opened,
    Created,
    Overwritten,
    Other,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileCreated {
    pub succeeded: bool,
    pub is_directory: bool,
    /// End of file at open; unknown when the query failed.
    pub size: Option<u64>,
    pub disposition: CreateDisposition,
}

/// A read or write about to be issued.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Transfer {
    /// Resolved byte offset (the current file position when none was given).
    pub position: u64,
    pub length: u64,
    /// Issued below another operation rather than at the top level.
    pub nested: bool,
    /// A nested retry through the slow path.
    pub slow_path: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Success,
    /// The fast path refused; the same transfer will be re-issued.
    FastIoDisallowed,
    Failed,
}

pub mod disposition_flags {
    pub const DELETE: u32 = 0x0000_0001;
    pub const ON_CLOSE: u32 = 0x0000_0008;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Basic { delete: bool },
    Extended { flags: u32 },
}

pub trait FileInterceptor: Send + Sync {
    fn pre_create(&self, op: &FileCreate) -> PreCreate;
    /// Returns the handle state the adapter must keep until cleanup.
    fn post_create(&self, op: &FileCreate, result: &FileCreated) -> Option<FileHandleState>;
    /// True when the post call is needed.
    fn pre_write(&self, handle: &mut FileHandleState, io: &Transfer) -> bool;
    fn post_write(&self, handle: &mut FileHandleState, status: TransferStatus, data: &[u8]);
    fn pre_read(&self, handle: &mut FileHandleState, io: &Transfer) -> bool;
    fn post_read(&self, handle: &mut FileHandleState, status: TransferStatus, data: &[u8]);
    fn pre_set_disposition(&self, handle: &FileHandleState) -> bool;
    fn post_set_disposition(&self, handle: &mut FileHandleState, info: Disposition, succeeded: bool);
    fn cleanup(&self, handle: FileHandleState, succeeded: bool);
}

// ─── Registry ─────────────────────────────────────────────────────────────

/// Create or open of a key relative to an optional root object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyOpen {
    pub pid: u32,
    pub root: Option<String>,
    pub complete_name: Option<String>,
    pub desired_access: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyDisposition {
    CreatedNew,
    OpenedExisting,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValueSet {
    pub pid: u32,
    pub key_path: String,
    pub value_name: Option<String>,
    pub value_type: u32,
    pub data: Vec<u8>,
}

/// Pre-hook result for operations whose event is built before the call.
#[must_use]
#[derive(Debug)]
pub enum PendingOutcome {
    Denied,
    Allowed(Option<PendingEvent>),
}

impl PendingOutcome {
    pub fn verdict(&self) -> Verdict {
        match self {
            PendingOutcome::Denied => Verdict::Deny,
            PendingOutcome::Allowed(_) => Verdict::Allow,
        }
    }

    pub fn into_pending(self) -> Option<PendingEvent> {
        match self {
            PendingOutcome::Denied => None,
            PendingOutcome::Allowed(pending) => pending,
        }
    }
}

pub trait RegistryInterceptor: Send + Sync {
    fn pre_create_key(&self, op: &KeyOpen) -> Verdict;
    fn post_create_key(&self, pid: u32, key_path: &str, disposition: KeyDisposition, succeeded: bool);
    fn pre_open_key(&self, op: &KeyOpen) -> Verdict;
    fn pre_set_value(&self, pid: u32, key_path: &str) -> Verdict;
    fn post_set_value(&self, op: &ValueSet, succeeded: bool);
    fn pre_delete_key(&self, pid: u32, key_path: &str) -> PendingOutcome;
    fn pre_delete_value(&self, pid: u32, key_path: &str, value_name: Option<&str>) -> PendingOutcome;
    fn pre_rename_key(&self, pid: u32, key_path: &str, new_name: Option<&str>) -> PendingOutcome;
    /// Post-hook for delete, delete-value and rename.
    fn complete(&self, pending: PendingEvent, succeeded: bool);
}

// ─── Processes ────────────────────────────────────────────────────────────

pub trait ProcessInterceptor: Send + Sync {
    fn process_created(&self, identity: ProcessIdentity);
    fn process_exited(&self, pid: u32, exit_code: u32, exit_time_ms: u64);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleOperation {
    #[default]
    Create,
    Duplicate,
}

/// A process handle being created or duplicated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandleOpen {
    pub initiator_pid: u32,
    pub target_pid: u32,
    /// Process that receives the handle; the initiator for a plain create.
    pub destination_pid: u32,
    pub desired_access: u32,
    pub kernel_handle: bool,
    pub operation: HandleOperation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenDecision {
    /// Access to request; narrower than asked for when protection applied.
    pub desired_access: u32,
    pub token: Option<OpenToken>,
}

pub trait ObjectInterceptor: Send + Sync {
    fn pre_open_process(&self, op: &HandleOpen) -> OpenDecision;
    fn post_open_process(&self, token: OpenToken, granted_access: u32, succeeded: bool);
}

//! Identifiers shared with the consumer process: event ids, field ids and
//! the enumerations carried inside control payloads.

use serde::{Deserialize, Serialize};

/// Declares a wire enumeration with a checked conversion from the raw value
/// and a conversion into the `u16` field id space.
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident { $($variant:ident = $value:expr),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $($variant = $value),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn from_raw(raw: u32) -> Option<Self> {
                match raw {
                    $(v if v == $value => Some($name::$variant),)+
                    _ => None,
                }
            }

            pub fn raw(self) -> u32 {
                self as u32
            }
        }

        impl From<$name> for u16 {
            fn from(value: $name) -> u16 {
                value as u16
            }
        }
    };
}

wire_enum! {
    /// High-level event kinds. Bit `1 << id` in `EventFlags` enables each one.
    pub enum SysmonEvent {
        ProcessCreate = 0,
        ProcessDelete = 1,
        RegistryKeyNameChange = 2,
        RegistryKeyCreate = 3,
        RegistryKeyDelete = 4,
        RegistryValueSet = 5,
        RegistryValueDelete = 6,
        FileCreate = 7,
        FileDelete = 8,
        FileClose = 9,
        FileDataChange = 10,
        FileDataReadFull = 11,
        FileDataWriteFull = 12,
        ProcessOpen = 13,
    }
}

impl SysmonEvent {
    pub fn mask(self) -> u64 {
        1u64 << (self as u32)
    }

    pub fn is_file_event(self) -> bool {
        matches!(
            self,
            Self::FileCreate
                | Self::FileDelete
                | Self::FileClose
                | Self::FileDataChange
                | Self::FileDataReadFull
                | Self::FileDataWriteFull
        )
    }
}

wire_enum! {
    pub enum EventField {
        RawEventId = 0,
        TickTime = 1,
        ProcessPid = 2,
        ProcessParentPid = 3,
        ProcessCmdLine = 4,
        ProcessIsElevated = 5,
        ProcessElevationType = 6,
        ProcessImageFile = 7,
        ProcessUserSid = 8,
        ProcessExitCode = 9,
        RegistryPath = 11,
        RegistryKeyNewName = 12,
        RegistryName = 13,
        RegistryRawData = 14,
        RegistryDataType = 15,
        FilePath = 16,
        FileVolumeGuid = 17,
        FileVolumeType = 18,
        FileVolumeDevice = 19,
        FileRawHash = 20,
        ProcessCreationTime = 21,
        ProcessDeletionTime = 22,
        ProcessCreatorPid = 23,
        TargetProcessPid = 24,
        AccessMask = 25,
    }
}

wire_enum! {
    pub enum ConfigField {
        DisableSelfProtection = 0,
        MaxQueueSize = 1,
        ConnectionTimeout = 2,
        SendMsgTimeout = 3,
        EnableDllInject = 4,
        LogLevel = 5,
        LogFile = 6,
        EventFlags = 8,
        SentRegTypes = 9,
        MaxRegValueSize = 10,
        MinFullActFileSize = 11,
        MaxFullActFileSize = 12,
        FileMonNameMask = 13,
        InjectedDll = 14,
        VerifyInjectedDll = 15,
        OpenProcessRepeatTimeout = 16,
        RegEventRepeatTimeout = 17,
    }
}

impl ConfigField {
    pub fn bit(self) -> u32 {
        1u32 << (self as u32)
    }
}

wire_enum! {
    /// Keys of the persisted configuration blobs.
    pub enum ConfigId {
        Main = 1,
        TrustedProcess = 2,
        ProtectedProcess = 3,
        InjectProcess = 4,
        SendEventProcess = 5,
        ProtectedFiles = 6,
        ProtectedRegKeys = 7,
    }
}

wire_enum! {
    pub enum UpdateRulesField {
        Type = 0,
        Persistent = 1,
        Mode = 2,
        Rule = 3,
        RuleImagePath = 4,
        RuleValue = 5,
        RuleInherit = 6,
        RuleTag = 7,
        Tag = 8,
        RuleRecursive = 9,
        RulePath = 10,
    }
}

wire_enum! {
    pub enum UpdateRulesMode {
        Replace = 1,
        Clear = 2,
        PushBack = 3,
        PushFront = 4,
        DeleteByTag = 5,
    }
}

wire_enum! {
    /// Process option addressed by a process-rule update.
    pub enum RuleType {
        Trusted = 1,
        Protected = 2,
        EnableInject = 3,
        SendEvent = 4,
    }
}

wire_enum! {
    /// Effect of a file or registry rule.
    pub enum AccessType {
        NoAccess = 1,
        ReadOnly = 2,
        Full = 3,
    }
}

wire_enum! {
    pub enum SetProcessInfoField {
        Pid = 0,
        Trusted = 1,
        Protected = 2,
        SendEvent = 3,
        EnableInject = 4,
    }
}

wire_enum! {
    pub enum ControlCode {
        Start = 1,
        Stop = 2,
        SetConfig = 3,
        UpdateFileRules = 4,
        UpdateRegistryRules = 5,
        UpdateProcessRules = 6,
        SetProcessInfo = 7,
    }
}

impl ControlCode {
    /// `Start` and `Stop` are accepted from any caller.
    pub fn requires_trusted_caller(self) -> bool {
        !matches!(self, Self::Start | Self::Stop)
    }
}

/// Registry value types, as numbered by the host registry API.
pub mod reg_type {
    pub const NONE: u32 = 0;
    pub const SZ: u32 = 1;
    pub const EXPAND_SZ: u32 = 2;
    pub const BINARY: u32 = 3;
    pub const DWORD: u32 = 4;
    pub const DWORD_BIG_ENDIAN: u32 = 5;
    pub const LINK: u32 = 6;
    pub const MULTI_SZ: u32 = 7;
    pub const QWORD: u32 = 11;
}

//! Access-mask constants and generic-rights expansion.

pub const DELETE: u32 = 0x0001_0000;
pub const READ_CONTROL: u32 = 0x0002_0000;
pub const WRITE_DAC: u32 = 0x0004_0000;
pub const WRITE_OWNER: u32 = 0x0008_0000;
pub const SYNCHRONIZE: u32 = 0x0010_0000;

pub const GENERIC_READ: u32 = 0x8000_0000;
pub const GENERIC_WRITE: u32 = 0x4000_0000;
pub const GENERIC_EXECUTE: u32 = 0x2000_0000;
pub const GENERIC_ALL: u32 = 0x1000_0000;

pub mod file {
    pub const READ_DATA: u32 = 0x0001;
    pub const WRITE_DATA: u32 = 0x0002;
    pub const APPEND_DATA: u32 = 0x0004;
    pub const READ_EA: u32 = 0x0008;
    pub const WRITE_EA: u32 = 0x0010;
    pub const EXECUTE: u32 = 0x0020;
    pub const DELETE_CHILD: u32 = 0x0040;
    pub const READ_ATTRIBUTES: u32 = 0x0080;
    pub const WRITE_ATTRIBUTES: u32 = 0x0100;

    /// Rights that modify a file or its metadata.
    pub const WRITE_MASK: u32 = WRITE_DATA
        | APPEND_DATA
        | WRITE_EA
        | DELETE_CHILD
        | WRITE_ATTRIBUTES
        | super::DELETE
        | super::WRITE_DAC
        | super::WRITE_OWNER;

    pub const GENERIC_MAPPING: super::GenericMapping = super::GenericMapping {
        read: 0x0012_0089,
        write: 0x0012_0116,
        execute: 0x0012_00A0,
        all: 0x001F_01FF,
    };
}

pub mod key {
    pub const QUERY_VALUE: u32 = 0x0001;
    pub const SET_VALUE: u32 = 0x0002;
    pub const CREATE_SUB_KEY: u32 = 0x0004;
    pub const ENUMERATE_SUB_KEYS: u32 = 0x0008;
    pub const CREATE_LINK: u32 = 0x0020;

    /// Write rights checked against a non-recursive read-only rule.
    pub const WRITE_MASK: u32 = SET_VALUE
        | CREATE_LINK
        | super::DELETE
        | super::WRITE_DAC
        | super::WRITE_OWNER
        | super::GENERIC_WRITE
        | super::GENERIC_ALL;

    /// Recursive rules also forbid creating children.
    pub const RECURSIVE_WRITE_MASK: u32 = WRITE_MASK | CREATE_SUB_KEY;
}

pub mod process {
    pub const TERMINATE: u32 = 0x0001;
    pub const CREATE_THREAD: u32 = 0x0002;
    pub const SET_SESSIONID: u32 = 0x0004;
    pub const VM_OPERATION: u32 = 0x0008;
    pub const VM_READ: u32 = 0x0010;
    pub const VM_WRITE: u32 = 0x0020;
    pub const DUP_HANDLE: u32 = 0x0040;
    pub const CREATE_PROCESS: u32 = 0x0080;
    pub const SET_QUOTA: u32 = 0x0100;
    pub const SET_INFORMATION: u32 = 0x0200;
    pub const QUERY_INFORMATION: u32 = 0x0400;
    pub const SUSPEND_RESUME: u32 = 0x0800;
    pub const QUERY_LIMITED_INFORMATION: u32 = 0x1000;
    pub const SET_LIMITED_INFORMATION: u32 = 0x2000;
    pub const ALL_ACCESS: u32 = 0x001F_FFFF;

    /// Stripped from handles opened to protected processes by untrusted callers.
    pub const DENIED_MASK: u32 = TERMINATE
        | CREATE_THREAD
        | SET_SESSIONID
        | VM_OPERATION
        | VM_READ
        | VM_WRITE
        | DUP_HANDLE
        | CREATE_PROCESS
        | SET_QUOTA
        | SET_INFORMATION
        | QUERY_INFORMATION
        | SUSPEND_RESUME
        | SET_LIMITED_INFORMATION;

    /// Granted rights worth reporting as a process-open event.
    pub const DETECTED_MASK: u32 = TERMINATE
        | CREATE_THREAD
        | SET_SESSIONID
        | VM_OPERATION
        | VM_WRITE
        | CREATE_PROCESS
        | SET_QUOTA
        | SET_INFORMATION
        | SUSPEND_RESUME;

    pub const GENERIC_MAPPING: super::GenericMapping = super::GenericMapping {
        read: 0x0002_1410,
        write: 0x0002_0BEA,
        execute: 0x0012_1001,
        all: ALL_ACCESS,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenericMapping {
    pub read: u32,
    pub write: u32,
    pub execute: u32,
    pub all: u32,
}

impl GenericMapping {
    /// Replaces generic bits with the specific rights they stand for.
    pub fn expand(&self, mut mask: u32) -> u32 {
        for (generic, specific) in [
            (GENERIC_READ, self.read),
            (GENERIC_WRITE, self.write),
            (GENERIC_EXECUTE, self.execute),
            (GENERIC_ALL, self.all),
        ] {
            if mask & generic != 0 {
                mask = (mask & !generic) | specific;
            }
        }
        mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generic_write_expands_to_file_write_rights() {
        let expanded = file::GENERIC_MAPPING.expand(GENERIC_WRITE);
        assert_eq!(expanded, 0x0012_0116);
        assert_ne!(expanded & file::WRITE_MASK, 0);
        assert_eq!(file::GENERIC_MAPPING.expand(GENERIC_READ) & file::WRITE_MASK, 0);
    }

    #[test]
    fn specific_bits_survive_expansion() {
        let mask = process::TERMINATE | GENERIC_READ;
        let expanded = process::GENERIC_MAPPING.expand(mask);
        assert_eq!(expanded, process::TERMINATE | 0x0002_1410);
        assert_eq!(process::GENERIC_MAPPING.expand(GENERIC_ALL), process::ALL_ACCESS);
    }
}

//! Process and module descriptors reported by the guest backend

use super::error::{VmiError, VmiResult};
use super::{GuestProcessId, MemorySpan};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Bitness of a guest process. Exactly one flag is set on a valid descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ProcessFlags {
    pub is_x86: bool,
    pub is_x64: bool,
}

impl ProcessFlags {
    pub const X86: Self = ProcessFlags {
        is_x86: true,
        is_x64: false,
    };

    pub const X64: Self = ProcessFlags {
        is_x86: false,
        is_x64: true,
    };

    pub const fn is_valid(&self) -> bool {
        self.is_x86 != self.is_x64
    }

    /// Returns the flags unchanged, or `InvalidFlags` when both or neither bit is set
    pub fn validate(self) -> VmiResult<Self> {
        if self.is_valid() {
            Ok(self)
        } else {
            Err(VmiError::invalid_flags(self))
        }
    }

    /// Pointer size in bytes
    pub fn pointer_size(&self) -> VmiResult<usize> {
        let flags = self.validate()?;
        Ok(if flags.is_x64 { 8 } else { 4 })
    }
}

impl fmt::Display for ProcessFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.is_x86, self.is_x64) {
            (true, false) => write!(f, "x86"),
            (false, true) => write!(f, "x64"),
            _ => write!(f, "invalid"),
        }
    }
}

/// Raw description of a living guest process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessDescriptor {
    pub pid: u64,
    pub name: String,
    pub flags: ProcessFlags,
    pub parent: Option<GuestProcessId>,
}

impl ProcessDescriptor {
    pub fn new(pid: u64, name: impl Into<String>, flags: ProcessFlags) -> Self {
        ProcessDescriptor {
            pid,
            name: name.into(),
            flags,
            parent: None,
        }
    }

    pub fn with_parent(mut self, parent: GuestProcessId) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Checks if the process name matches
    pub fn name_matches(&self, name: &str, case_insensitive: bool) -> bool {
        if case_insensitive {
            self.name.eq_ignore_ascii_case(name)
        } else {
            self.name == name
        }
    }

    /// Whether two descriptors name the same guest process
    pub fn same_process(&self, other: &ProcessDescriptor) -> bool {
        self.pid == other.pid && self.name == other.name && self.flags == other.flags
    }
}

impl fmt::Display for ProcessDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Process [{}] {} ({})", self.pid, self.name, self.flags)
    }
}

/// Raw description of a loaded module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    pub name: String,
    pub span: MemorySpan,
}

impl ModuleDescriptor {
    pub fn new(name: impl Into<String>, span: MemorySpan) -> Self {
        ModuleDescriptor {
            name: name.into(),
            span,
        }
    }
}

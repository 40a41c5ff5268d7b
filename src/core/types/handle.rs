//! Opaque identifiers handed out to callers
//!
//! Handles are issued by the registry and are never guest virtual addresses.
//! Their byte encoding (little-endian, rendered as hex by `Display`) exists
//! only so a binding layer can marshal them; inside the core they are plain
//! `Eq + Hash` values.

use super::error::{VmiError, VmiResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Internal guest identifier of a process (e.g. the kernel object address)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GuestProcessId(pub u64);

/// Internal guest identifier of a module inside its process
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GuestModuleId(pub u64);

/// Identifier of a breakpoint planted by the guest backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BreakpointId(pub u64);

impl fmt::Display for GuestProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "guest-proc:{:#x}", self.0)
    }
}

impl fmt::Display for GuestModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "guest-mod:{:#x}", self.0)
    }
}

impl fmt::Display for BreakpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bp#{}", self.0)
    }
}

/// Opaque handle to one guest process
///
/// Valid while the process is alive; after exit every copy fails to resolve
/// and no later process ever receives the same value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProcessHandle(u64);

impl ProcessHandle {
    pub(crate) const fn new(value: u64) -> Self {
        ProcessHandle(value)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> VmiResult<Self> {
        let raw: [u8; 8] = bytes
            .try_into()
            .map_err(|_| VmiError::invalid_handle_bytes("process", 8, bytes.len()))?;
        Ok(ProcessHandle(u64::from_le_bytes(raw)))
    }
}

impl fmt::Display for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.to_bytes()))
    }
}

impl FromStr for ProcessHandle {
    type Err = VmiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim()).map_err(|e| VmiError::InvalidHandle(e.to_string()))?;
        Self::from_bytes(&bytes)
    }
}

/// Opaque handle to one module, scoped to its owning process
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ModuleHandle {
    process: ProcessHandle,
    index: u64,
}

impl ModuleHandle {
    pub(crate) const fn new(process: ProcessHandle, index: u64) -> Self {
        ModuleHandle { process, index }
    }

    /// The process this module belongs to
    pub const fn process(&self) -> ProcessHandle {
        self.process
    }

    pub const fn index(&self) -> u64 {
        self.index
    }

    pub fn to_bytes(&self) -> [u8; 16] {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&self.process.to_bytes());
        bytes[8..].copy_from_slice(&self.index.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> VmiResult<Self> {
        if bytes.len() != 16 {
            return Err(VmiError::invalid_handle_bytes("module", 16, bytes.len()));
        }
        let process = ProcessHandle::from_bytes(&bytes[..8])?;
        let mut index = [0u8; 8];
        index.copy_from_slice(&bytes[8..]);
        Ok(ModuleHandle {
            process,
            index: u64::from_le_bytes(index),
        })
    }
}

impl fmt::Display for ModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.to_bytes()))
    }
}

impl FromStr for ModuleHandle {
    type Err = VmiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim()).map_err(|e| VmiError::InvalidHandle(e.to_string()))?;
        Self::from_bytes(&bytes)
    }
}

/// Identifier returned by every subscribe call, monotonically increasing
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub(crate) const fn new(value: u64) -> Self {
        SubscriptionId(value)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_handle_bytes() {
        let handle = ProcessHandle::new(0x0102);
        assert_eq!(handle.to_bytes(), [0x02, 0x01, 0, 0, 0, 0, 0, 0]);
        assert_eq!(handle.to_string(), "0201000000000000");
        assert_eq!("0201000000000000".parse::<ProcessHandle>().unwrap(), handle);
    }

    #[test]
    fn test_process_handle_rejects_bad_length() {
        let result = ProcessHandle::from_bytes(&[1, 2, 3]);
        assert!(matches!(result, Err(VmiError::InvalidHandle(_))));
        assert!("zz".parse::<ProcessHandle>().is_err());
    }

    #[test]
    fn test_module_handle_scoped_to_process() {
        let a = ModuleHandle::new(ProcessHandle::new(1), 7);
        let b = ModuleHandle::new(ProcessHandle::new(2), 7);
        assert_ne!(a, b);
        assert_eq!(a.process(), ProcessHandle::new(1));

        let parsed = ModuleHandle::from_bytes(&a.to_bytes()).unwrap();
        assert_eq!(parsed, a);
        assert_eq!(a.to_string().parse::<ModuleHandle>().unwrap(), a);
    }

    #[test]
    fn test_subscription_id_ordering() {
        assert!(SubscriptionId::new(1) < SubscriptionId::new(2));
        assert_eq!(SubscriptionId::new(3).to_string(), "sub#3");
    }
}

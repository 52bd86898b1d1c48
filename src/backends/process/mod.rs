// Process enumeration trait for platform-specific implementations
//
// The reconciliation loop only ever asks for a complete snapshot; partial
// failures on individual processes (races with exit, permission errors) are
// absorbed by the implementation.

use crate::error::SnapshotError;
use crate::process::ProcessSnapshot;

/// Source of point-in-time process metadata
pub trait ProcessProvider: Send {
    /// Enumerate every visible process. Only a failure to enumerate at all
    /// is an error.
    fn snapshot(&mut self) -> Result<ProcessSnapshot, SnapshotError>;
}

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use linux::LinuxProcessProvider;

/// Factory function to create the platform-specific provider
#[cfg(target_os = "linux")]
pub fn create_process_provider() -> Box<dyn ProcessProvider> {
    Box::new(LinuxProcessProvider::new())
}

impl<P: ProcessProvider + ?Sized> ProcessProvider for Box<P> {
    fn snapshot(&mut self) -> Result<ProcessSnapshot, SnapshotError> {
        (**self).snapshot()
    }
}

//! Inter-process communication over named OS resources.
//!
//! Every semaphore and shared-memory buffer the runtime creates is visible
//! to other processes under a fixed name prefix. The prefix is part of the
//! external contract: a controller process publishing commands must build
//! its names the same way.

mod semaphore;
mod shm;
mod topic;

pub use semaphore::NamedSemaphore;
pub use shm::{BufferGuard, SharedBuffer};
pub use topic::{SharedMemoryTopic, TopicMessage};

/// Namespace prefix for every named semaphore and shared-memory region.
pub const NAME_PREFIX: &str = "openrobot_ocm_";

/// Build the OS-visible name for a runtime resource.
pub fn prefixed(name: &str) -> String {
    format!("{NAME_PREFIX}{name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_is_stable() {
        // Cross-process visibility depends on this exact literal.
        assert_eq!(prefixed("cmd"), "openrobot_ocm_cmd");
    }
}

//! Error types
//!
//! Every fallible operation returns a small per-concern error enum. All
//! failures are synchronous return values; the kernel does not panic on a
//! caller's mistake.

/// Error type for operations that require a context in which the CPU Lock is
/// inactive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BadContextError {
    /// The CPU Lock was already active.
    BadContext,
}

/// Error type for [`zync`](crate::zync::zync) and its wrappers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZyncError {
    /// The CPU Lock was already active.
    BadContext,
    /// The demand could not be met before the timeout expired. Also returned
    /// for an unmet demand with a zero timeout.
    Timeout,
    /// The wait was cancelled by [`reset`](crate::zync::reset).
    Interrupted,
    /// The pair's control block has not been allocated yet.
    NoAccess,
}

impl From<BadContextError> for ZyncError {
    fn from(_: BadContextError) -> Self {
        Self::BadContext
    }
}

/// Error type for [`ZyncPair::init`](crate::zync::ZyncPair::init).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairInitError {
    /// The CPU Lock was already active.
    BadContext,
    /// The backing pool has no free control-block slot.
    NoMemory,
}

impl From<BadContextError> for PairInitError {
    fn from(_: BadContextError) -> Self {
        Self::BadContext
    }
}

/// Error type for the usage-accounting operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageError {
    /// The CPU Lock was already active.
    BadContext,
    /// The thread has no usage record, or the CPU index is out of range.
    BadParam,
}

impl From<BadContextError> for UsageError {
    fn from(_: BadContextError) -> Self {
        Self::BadContext
    }
}

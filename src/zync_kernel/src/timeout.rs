//! Relative timeouts
//!
//! Timeouts are expressed in kernel ticks. Their conversion to a concrete
//! deadline is the port's business ([`PortThreading::deadline_after`]).
//!
//! [`PortThreading::deadline_after`]: crate::PortThreading::deadline_after

/// Unsigned integer type representing a duration in kernel ticks.
pub type UTicks = u32;

/// A relative timeout for a blocking operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Fail with a timeout status instead of blocking.
    NoWait,
    /// Block for up to the specified number of ticks.
    Ticks(UTicks),
    /// Block until the demand is met or the wait is cancelled.
    Forever,
}

impl Timeout {
    /// Whether the operation is not allowed to block at all.
    #[inline]
    pub fn is_no_wait(self) -> bool {
        matches!(self, Self::NoWait)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_wait_classification() {
        assert!(Timeout::NoWait.is_no_wait());
        assert!(!Timeout::Ticks(0).is_no_wait());
        assert!(!Timeout::Ticks(42).is_no_wait());
        assert!(!Timeout::Forever.is_no_wait());
    }
}

//! Communicator seam
//!
//! The ring coordinator and the cluster context only talk to peers through
//! this trait. Every blocking call takes a deadline and reports
//! [`RingForgeError::CollectiveTimeout`](crate::error::RingForgeError::CollectiveTimeout)
//! when it passes.

use crate::error::ForgeResult;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Message tag; values at or above [`RESERVED_TAG_BASE`] belong to collectives
pub type Tag = u64;

pub const RESERVED_TAG_BASE: Tag = Tag::MAX - 15;
pub const BARRIER_ARRIVE_TAG: Tag = RESERVED_TAG_BASE;
pub const BARRIER_RELEASE_TAG: Tag = RESERVED_TAG_BASE + 1;
pub const BROADCAST_TAG: Tag = RESERVED_TAG_BASE + 2;

/// Shared stop flag for the receives of one exchange.
///
/// Clones observe the same flag. Once set it stays set; waits that see it
/// fail with `ExchangeCancelled`.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Point-to-point and collective operations among `world_size` ranks
pub trait Communicator: Send + Sync {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Queue `data` for `dest`; does not wait for the receiver
    fn send(&self, dest: usize, tag: Tag, data: Vec<f32>) -> ForgeResult<()>;

    /// Wait for the next message from `src` carrying `tag`
    fn recv(&self, src: usize, tag: Tag, timeout: Duration) -> ForgeResult<Vec<f32>>;

    /// [`recv`](Self::recv) that also gives up once `cancel` is set
    fn recv_cancellable(
        &self,
        src: usize,
        tag: Tag,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> ForgeResult<Vec<f32>>;

    /// Block until every rank has entered the barrier
    fn barrier(&self, timeout: Duration) -> ForgeResult<()>;

    /// Replace `data` on every rank with the root's copy
    fn broadcast(&self, data: &mut Vec<f32>, root: usize, timeout: Duration) -> ForgeResult<()>;

    /// Tell peers this rank is leaving; later calls fail
    fn shutdown(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_token_is_shared_by_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
        assert!(!CancelToken::new().is_cancelled());
    }
}

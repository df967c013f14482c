//! Confirmation step between reserving capacity and activating it

use async_trait::async_trait;
use gpupool_core::{PoolResult, Reservation};

/// Receives newly placed reservations before they become active
///
/// An error or a timeout leaves the reservation `Failed` and frees its
/// capacity.
#[async_trait]
pub trait WorkloadDispatcher: Send + Sync {
    /// Accept a pending reservation
    async fn confirm(&self, reservation: &Reservation) -> PoolResult<()>;

    /// Get the dispatcher name
    fn name(&self) -> &'static str;
}

/// Accepts every reservation immediately
pub struct ImmediateDispatcher;

#[async_trait]
impl WorkloadDispatcher for ImmediateDispatcher {
    async fn confirm(&self, _reservation: &Reservation) -> PoolResult<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "immediate"
    }
}

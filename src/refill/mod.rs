//! Refill core: phase catalog, per-asset coordinators and reconciliation
//!
//! A refill is driven through five phases:
//! 1. wallet_confirm - the trigger transaction is signed and broadcast
//! 2. monad_confirm - the trigger is mined and its outbound message id read
//! 3. avalanche_confirm - the helper chain answers the request
//! 4. ccip_response - the answer lands back on the faucet
//! 5. monad_refill - the faucet clears its in-flight flag
//!
//! The reconciler runs beside the coordinators and corrects them against the
//! faucet's flag.

pub mod catalog;
pub mod coordinator;
pub mod monitor;
pub mod reconcile;

#[cfg(test)]
pub(crate) mod testing;

pub use catalog::PhaseCatalog;
pub use coordinator::{ChainSet, RefillCoordinator, StartOutcome};
pub use reconcile::Reconciler;

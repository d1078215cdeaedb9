//! Failure detector contract.

use crate::types::ServerId;

/// Liveness oracle shared between the driver's owner and the FSM.
///
/// The driver itself never consults it; it is handed to the FSM factory at
/// construction, where it informs election and pre-vote decisions. How
/// liveness is established is out of scope.
pub trait FailureDetector {
    fn is_alive(&self, server: ServerId) -> bool;
}

//! Asynchronous fetch pipeline: the bounded pending queue and the per-cycle
//! request selector that feeds it.

pub mod pending;
pub mod selector;

pub use pending::{FetchState, PendingPage, PendingQueue};
pub use selector::{PageSelector, SelectionOutcome};

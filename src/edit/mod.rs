pub mod apply;
pub mod change;
pub mod ledger;

pub use apply::AppliedBatch;
pub use change::{BatchId, Change, ChangeBatch};
pub use ledger::{Ledger, Origin};

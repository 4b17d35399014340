pub mod bulk_payout;

pub use bulk_payout::{BulkPayoutWorker, BulkPayoutWorkerConfig};

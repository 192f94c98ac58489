pub mod exit;
pub mod fills;
pub mod retry;
pub mod router;

pub use exit::{ExitExecutor, ExitReason, ExitResult, PendingExitRegistry};
pub use fills::{accumulate_fill, is_fully_filled, progress_event, FillProgress, FILL_COMPLETE_RATIO};
pub use retry::{retry_with_backoff, RetryPolicy};
pub use router::OrderRouter;

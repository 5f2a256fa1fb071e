pub mod detail;
pub mod diff;
pub mod http;
pub mod orchestrator;
pub mod parse;
pub mod queue_worker;
pub mod scanner;
pub mod scheduler;

pub use detail::{DetailScraper, HttpDetailScraper};
pub use diff::{DiffDetector, DiffOptions, DiffOutcome, PriceChange, RemovalVerification};
pub use http::{FetchedPage, HeadResponse, HttpPageFetcher, PageFetcher};
pub use orchestrator::{TierOrchestrator, TierResult};
pub use parse::ListingPageParser;
pub use queue_worker::{QueueProcessResult, QueueWorker};
pub use scanner::{ManifestScanner, ScanResult};
pub use scheduler::{ScheduleStatus, Scheduler, TierScheduleStatus};

pub use pincali_core::{Result, SyncError};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Soft-cancellation handle shared between the scheduler and a running tier.
/// Cancellation is cooperative: the scanner checks it between pages and the
/// queue worker between items; in-flight requests finish naturally.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolve once cancellation is requested.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

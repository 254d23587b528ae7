pub mod config;
pub mod downloader;
pub mod limiter;
pub mod models;
pub mod monitor;
pub mod multipart;
pub mod observer;
pub mod range_check;
pub mod resuming;
pub mod saver;
pub mod state_manager;
pub mod transport;

#[cfg(test)]
mod testing;

/// Convenient type alias exposing common structs.
pub mod prelude {
    pub use crate::config::{DownloadOptions, RetryPolicy};
    pub use crate::limiter::Throttling;
    pub use crate::models::{
        ByteChunkEvent, DownloadRange, PartState, PartStatus, SessionSnapshot, SessionStatus,
    };
    pub use crate::monitor::{ProgressMonitor, SpeedMonitor};
    pub use crate::multipart::{MultiPartDownload, SessionError};
    pub use crate::observer::{
        DownloadEvent, DownloadObserver, ObserverError, ObserverId, SessionInfo, StopReason,
    };
    pub use crate::range_check::{ProbeRangeChecker, RangeCheckError, RangeChecker, RangeInfo};
    pub use crate::resuming::{ResumingDownloader, ResumingDownloaderBuilder};
    pub use crate::saver::FileSaver;
    pub use crate::state_manager::{ResumeRecord, ResumeStore, StateError};
    pub use crate::transport::{HttpRequestIssuer, RangeResponse, RequestIssuer, ResponseMeta};
}

pub mod clock;
pub mod downloader;
pub mod paths;
pub mod queue;
pub mod reconciler;
pub mod retry;
pub mod storage;

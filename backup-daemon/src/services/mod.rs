pub mod scheduler;
pub mod storage_watch;

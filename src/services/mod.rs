pub mod listing;
pub mod progress;
pub mod storage_client;

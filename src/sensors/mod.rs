mod service;

pub use service::{HistoryPage, SensorService, HISTORY_PAGE_SIZE};

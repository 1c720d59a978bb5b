mod cache;
mod jobs;
mod repository;
mod retention;
mod schema;
mod store;
mod tasks;

pub use cache::ResponseCache;
pub use jobs::JobTracker;
pub use repository::{CategoryInsert, Repository};
pub use retention::RetentionManager;
pub use store::CategoryStore;
pub use tasks::TaskQueue;

pub(crate) use repository::{fmt_ts, json_column, parse_datetime, ts_column};

#[cfg(test)]
pub(crate) use repository::test_support;

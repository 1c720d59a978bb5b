mod categories;
mod ingest;

pub use categories::CategoryService;
pub use ingest::IngestService;

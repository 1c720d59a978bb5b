pub const SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- categories table
CREATE TABLE IF NOT EXISTS categories (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    owner_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    derived_summary TEXT,
    derived_subreddits TEXT NOT NULL DEFAULT '[]',
    derived_handles TEXT NOT NULL DEFAULT '[]',
    active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_categories_owner ON categories(owner_id, active);
CREATE UNIQUE INDEX IF NOT EXISTS idx_categories_active_name ON categories(owner_id, name) WHERE active = 1;

-- feed_items table
CREATE TABLE IF NOT EXISTS feed_items (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    category_id INTEGER NOT NULL REFERENCES categories(id) ON DELETE CASCADE,
    source TEXT NOT NULL,
    source_name TEXT NOT NULL,
    title TEXT NOT NULL,
    summary TEXT,
    content TEXT,
    url TEXT,
    image_url TEXT,
    engagement_score REAL,
    published_at TEXT,
    fetched_at TEXT NOT NULL,
    is_relevant INTEGER NOT NULL DEFAULT 1,
    relevance_reason TEXT,
    raw_payload TEXT
);

CREATE INDEX IF NOT EXISTS idx_feed_items_category ON feed_items(category_id, is_relevant, published_at DESC);
CREATE INDEX IF NOT EXISTS idx_feed_items_source ON feed_items(source, category_id);
CREATE INDEX IF NOT EXISTS idx_feed_items_fetched_at ON feed_items(fetched_at);

-- content_cache table
CREATE TABLE IF NOT EXISTS content_cache (
    cache_key TEXT PRIMARY KEY,
    source TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL,
    expires_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_content_cache_expires ON content_cache(expires_at);

-- ingestion_jobs table
CREATE TABLE IF NOT EXISTS ingestion_jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    parameters TEXT,
    started_at TEXT,
    completed_at TEXT,
    items_created INTEGER NOT NULL DEFAULT 0,
    items_updated INTEGER NOT NULL DEFAULT 0,
    error TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_ingestion_jobs_created ON ingestion_jobs(created_at DESC);

-- tasks table (work queue and task status)
CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    spec TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    result TEXT,
    error TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status, created_at);
"#;

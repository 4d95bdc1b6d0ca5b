pub const SCHEMA: &str = r#"
-- Boards: one row per configured source
CREATE TABLE IF NOT EXISTS boards (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    url TEXT NOT NULL UNIQUE,
    display_name TEXT NOT NULL,
    created_at TEXT NOT NULL,
    last_crawled_at TEXT
);

-- Pins: never deleted, only status-transitioned
CREATE TABLE IF NOT EXISTS pins (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    board_id INTEGER NOT NULL,
    pin_id TEXT NOT NULL,
    source_url TEXT NOT NULL,
    title TEXT NOT NULL DEFAULT '',
    description TEXT NOT NULL DEFAULT '',
    image_url TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'new',  -- new/downloaded/download_failed/labeled
    first_seen TEXT NOT NULL,
    last_seen TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    UNIQUE (board_id, pin_id),
    FOREIGN KEY (board_id) REFERENCES boards(id)
);

CREATE INDEX IF NOT EXISTS idx_pins_status ON pins(status);
CREATE INDEX IF NOT EXISTS idx_pins_pin_id ON pins(pin_id);

-- Images: one full image + thumbnail per pin
CREATE TABLE IF NOT EXISTS images (
    pin_ref INTEGER PRIMARY KEY,
    local_path TEXT NOT NULL,
    thumbnail_path TEXT NOT NULL,
    checksum TEXT NOT NULL,
    byte_size INTEGER NOT NULL,
    verified INTEGER NOT NULL DEFAULT 0,
    downloaded_at TEXT NOT NULL,
    FOREIGN KEY (pin_ref) REFERENCES pins(id)
);

-- Labels: at most one current label per pin
CREATE TABLE IF NOT EXISTS labels (
    pin_ref INTEGER PRIMARY KEY,
    categories TEXT NOT NULL,  -- JSON array
    types TEXT NOT NULL,       -- JSON array
    colors TEXT NOT NULL,      -- JSON array
    styles TEXT NOT NULL,      -- JSON array
    materials TEXT NOT NULL,   -- JSON array
    confidence REAL NOT NULL,
    parsed INTEGER NOT NULL DEFAULT 1,
    raw_response_digest TEXT NOT NULL,
    image_checksum TEXT NOT NULL,
    created_at TEXT NOT NULL,
    FOREIGN KEY (pin_ref) REFERENCES pins(id)
);

-- Run reports: append-only
CREATE TABLE IF NOT EXISTS run_reports (
    run_id TEXT PRIMARY KEY,
    started_at TEXT NOT NULL,
    ended_at TEXT,
    report TEXT NOT NULL  -- JSON document
);
"#;

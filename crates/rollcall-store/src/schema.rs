/// Idempotent schema. Embedding blobs are little-endian `f32`.
pub(crate) const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS staff (
    staff_id    TEXT PRIMARY KEY,
    name        TEXT NOT NULL,
    employee_id TEXT,
    added_at    TEXT NOT NULL,
    is_active   INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS staff_embeddings (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    staff_id  TEXT NOT NULL REFERENCES staff (staff_id) ON DELETE CASCADE,
    embedding BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS customers (
    customer_id TEXT PRIMARY KEY,
    name        TEXT,
    added_at    TEXT NOT NULL,
    is_active   INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS customer_embeddings (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    customer_id TEXT NOT NULL REFERENCES customers (customer_id) ON DELETE CASCADE,
    embedding   BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS staff_attendance (
    id                     INTEGER PRIMARY KEY AUTOINCREMENT,
    staff_id               TEXT NOT NULL,
    date                   TEXT NOT NULL,
    check_in_time          TEXT,
    check_out_time         TEXT,
    hours_worked           REAL,
    status                 TEXT,
    late_minutes           INTEGER NOT NULL DEFAULT 0,
    recognition_confidence REAL NOT NULL DEFAULT 0,
    checkout_confidence    REAL,
    UNIQUE (staff_id, date)
);

CREATE TABLE IF NOT EXISTS staff_checkins (
    id                     INTEGER PRIMARY KEY AUTOINCREMENT,
    staff_id               TEXT NOT NULL,
    date                   TEXT NOT NULL,
    check_time             TEXT NOT NULL,
    status                 TEXT NOT NULL,
    late_minutes           INTEGER NOT NULL,
    recognition_confidence REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS unknown_entries (
    id                     INTEGER PRIMARY KEY AUTOINCREMENT,
    track_id               INTEGER NOT NULL,
    entry_type             TEXT NOT NULL,
    detection_time         TEXT NOT NULL,
    date                   TEXT NOT NULL,
    image                  BLOB NOT NULL,
    face_bbox              TEXT,
    person_bbox            TEXT,
    face_detected          INTEGER NOT NULL DEFAULT 0,
    detection_confidence   REAL NOT NULL,
    recognition_confidence REAL NOT NULL,
    reason                 TEXT NOT NULL,
    system_mode            TEXT NOT NULL,
    is_processed           INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_unknown_entries_date
    ON unknown_entries (date DESC, detection_time DESC);
CREATE INDEX IF NOT EXISTS idx_unknown_entries_track_id
    ON unknown_entries (track_id);
CREATE INDEX IF NOT EXISTS idx_staff_checkins_date
    ON staff_checkins (date, staff_id);
";

//! Store schema
//!
//! Uniqueness constraints carry the idempotence guarantees: one message row
//! per (account, provider id), one open and one sent reply per message, one
//! marker per (task, slot).

pub(crate) const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    provider TEXT NOT NULL,
    external_key TEXT NOT NULL,
    alias TEXT,
    address TEXT,
    cap_mail INTEGER NOT NULL DEFAULT 0,
    cap_calendar INTEGER NOT NULL DEFAULT 0,
    cap_contacts INTEGER NOT NULL DEFAULT 0,
    secret_ref TEXT,
    status TEXT NOT NULL DEFAULT 'active',
    status_detail TEXT,
    disabled INTEGER NOT NULL DEFAULT 0,
    bootstrap_pending INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (provider, external_key)
);

CREATE TABLE IF NOT EXISTS cursors (
    account_id INTEGER NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
    capability TEXT NOT NULL,
    position TEXT,
    page_size INTEGER,
    last_success_at TEXT,
    consecutive_failures INTEGER NOT NULL DEFAULT 0,
    state TEXT NOT NULL DEFAULT 'idle',
    last_error TEXT,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (account_id, capability)
);

CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id INTEGER NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
    provider_message_id TEXT NOT NULL,
    from_addr TEXT NOT NULL DEFAULT '',
    to_addr TEXT NOT NULL DEFAULT '',
    subject TEXT NOT NULL DEFAULT '',
    snippet TEXT NOT NULL DEFAULT '',
    body_text TEXT NOT NULL DEFAULT '',
    received_at TEXT NOT NULL,
    source TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (account_id, provider_message_id)
);

CREATE TABLE IF NOT EXISTS message_analysis (
    message_id INTEGER PRIMARY KEY REFERENCES messages(id) ON DELETE CASCADE,
    tag TEXT NOT NULL,
    confidence REAL NOT NULL,
    summary TEXT NOT NULL DEFAULT '',
    suggest_reply INTEGER NOT NULL DEFAULT 0,
    suggestion TEXT NOT NULL DEFAULT '',
    reasons TEXT NOT NULL DEFAULT '[]',
    source TEXT NOT NULL,
    written_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS reply_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    message_id INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
    state TEXT NOT NULL,
    compose_mode TEXT,
    subject TEXT NOT NULL DEFAULT '',
    body TEXT NOT NULL DEFAULT '',
    revision_count INTEGER NOT NULL DEFAULT 0,
    from_addr TEXT,
    to_addr TEXT,
    not_ready_reason TEXT,
    send_mode TEXT,
    provider_send_id TEXT,
    last_error TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    sent_at TEXT
);

CREATE TABLE IF NOT EXISTS secrets (
    name TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS job_slots (
    task_kind TEXT NOT NULL,
    slot_id TEXT NOT NULL,
    executed_at TEXT NOT NULL,
    result TEXT,
    PRIMARY KEY (task_kind, slot_id)
);

CREATE TABLE IF NOT EXISTS calendar_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id INTEGER NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
    provider_event_id TEXT NOT NULL,
    title TEXT NOT NULL DEFAULT '',
    starts_at TEXT,
    ends_at TEXT,
    location TEXT NOT NULL DEFAULT '',
    updated_at TEXT NOT NULL,
    UNIQUE (account_id, provider_event_id)
);

CREATE INDEX IF NOT EXISTS idx_messages_received ON messages(received_at);
CREATE INDEX IF NOT EXISTS idx_messages_provider_id ON messages(provider_message_id);
CREATE INDEX IF NOT EXISTS idx_reply_state ON reply_queue(state);
CREATE UNIQUE INDEX IF NOT EXISTS idx_reply_open_per_message
    ON reply_queue(message_id) WHERE state IN ('drafting', 'pending_send', 'sending');
CREATE UNIQUE INDEX IF NOT EXISTS idx_reply_sent_per_message
    ON reply_queue(message_id) WHERE state = 'sent';
"#;

use rusqlite::Connection;

use crate::error::EngineError;

pub fn initialize_schema(conn: &Connection) -> Result<(), EngineError> {
    conn.execute_batch("
        -- Mailboxes known to the engine. Rows are created on first reference
        -- and never hard-deleted; permanently unresolvable addresses go to
        -- invalid_mailboxes instead.
        CREATE TABLE IF NOT EXISTS mailboxes (
            email          TEXT PRIMARY KEY,
            endpoint       TEXT,                -- NULL until discovery resolves it
            grouping_key   TEXT,
            updated_at     INTEGER NOT NULL     -- unix epoch ms
        );

        -- Negative cache: the directory reported 'unknown user'.
        -- Rows are removed only by external administrative action.
        CREATE TABLE IF NOT EXISTS invalid_mailboxes (
            email      TEXT PRIMARY KEY,
            marked_at  INTEGER NOT NULL
        );

        -- Subscriber systems. Local systems are administered directly;
        -- remote ones are expanded from the directory.
        CREATE TABLE IF NOT EXISTS systems (
            group_name    TEXT PRIMARY KEY,
            callback_url  TEXT,
            is_local      INTEGER NOT NULL DEFAULT 0
        );

        -- Reconciled to match the latest group expansion.
        CREATE TABLE IF NOT EXISTS system_mailboxes (
            group_name  TEXT NOT NULL REFERENCES systems(group_name) ON DELETE CASCADE,
            email       TEXT NOT NULL,
            PRIMARY KEY (group_name, email)
        );

        CREATE INDEX IF NOT EXISTS idx_system_mailboxes_email ON system_mailboxes(email);

        -- Incremental sync cursors. A NULL cursor means 'never synchronized':
        -- the next sync call performs a full resync.
        CREATE TABLE IF NOT EXISTS sync_state (
            email       TEXT NOT NULL,
            folder      TEXT NOT NULL,
            cursor      TEXT,
            updated_at  INTEGER NOT NULL,
            PRIMARY KEY (email, folder)
        );

        -- Append-only change log. The UNIQUE constraint carries the dedup
        -- invariant: no two rows share (ts, email, item_id).
        CREATE TABLE IF NOT EXISTS notifications (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            ts           INTEGER NOT NULL,    -- unix epoch ms
            email        TEXT NOT NULL,
            folder       TEXT NOT NULL,
            item_id      TEXT NOT NULL,
            change_type  TEXT NOT NULL,       -- 'created' | 'updated' | 'deleted'
            details      TEXT,                -- JSON, optional raw event metadata
            UNIQUE (ts, email, item_id)
        );

        CREATE INDEX IF NOT EXISTS idx_notifications_mailbox ON notifications(email, folder, ts);
        CREATE INDEX IF NOT EXISTS idx_notifications_ts      ON notifications(ts);
    ")?;
    Ok(())
}

//! DDL for every ember database.
//!
//! All statements are `IF NOT EXISTS` so they can run on every connection a
//! pool opens. Timestamps are unix seconds in INTEGER columns; `created_at`
//! is written once by the insert and never touched by an upsert.

/// `core.db`: users, groups, memberships, bans, invitations, plugin toggles.
pub const CORE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS biz_user (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id         TEXT    NOT NULL UNIQUE,
    user_name       TEXT    NOT NULL DEFAULT '',
    permission      INTEGER NOT NULL DEFAULT 1,
    status          TEXT    NOT NULL DEFAULT 'NORMAL',
    is_self_ignore  INTEGER NOT NULL DEFAULT 0,
    remark          TEXT,
    created_at      INTEGER NOT NULL,
    updated_at      INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS biz_group (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    group_id          TEXT    NOT NULL UNIQUE,
    group_name        TEXT    NOT NULL DEFAULT '',
    status            TEXT    NOT NULL DEFAULT 'UNAUTHORIZED',
    last_operator_id  TEXT,
    created_at        INTEGER NOT NULL,
    updated_at        INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS biz_group_member (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    group_id    TEXT    NOT NULL,
    user_id     TEXT    NOT NULL,
    group_card  TEXT    NOT NULL DEFAULT '',
    permission  INTEGER NOT NULL DEFAULT 1,
    created_at  INTEGER NOT NULL,
    updated_at  INTEGER NOT NULL,
    UNIQUE (group_id, user_id)
);
CREATE INDEX IF NOT EXISTS idx_member_user ON biz_group_member (user_id);

CREATE TABLE IF NOT EXISTS biz_group_plugin_setting (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    group_id          TEXT    NOT NULL,
    plugin_name       TEXT    NOT NULL,
    is_enabled        INTEGER NOT NULL DEFAULT 1,
    last_operator_id  TEXT,
    created_at        INTEGER NOT NULL,
    updated_at        INTEGER NOT NULL,
    UNIQUE (group_id, plugin_name)
);

CREATE TABLE IF NOT EXISTS sys_blacklist (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    target_user_id  TEXT    NOT NULL,
    group_id        TEXT    NOT NULL DEFAULT 'GLOBAL',
    operator_id     TEXT    NOT NULL,
    ban_expiry      INTEGER,
    reason          TEXT,
    created_at      INTEGER NOT NULL,
    updated_at      INTEGER NOT NULL,
    UNIQUE (target_user_id, group_id)
);

CREATE TABLE IF NOT EXISTS biz_invitation (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    group_id    TEXT    NOT NULL UNIQUE,
    inviter_id  TEXT    NOT NULL,
    flag        TEXT    NOT NULL,
    status      TEXT    NOT NULL DEFAULT 'PENDING',
    created_at  INTEGER NOT NULL,
    updated_at  INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_invitation_inviter ON biz_invitation (inviter_id);
CREATE INDEX IF NOT EXISTS idx_invitation_flag ON biz_invitation (flag);

CREATE TABLE IF NOT EXISTS biz_invitation_message (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    invitation_id  INTEGER NOT NULL REFERENCES biz_invitation (id) ON DELETE CASCADE,
    message_id     TEXT    NOT NULL,
    created_at     INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_invitation_message ON biz_invitation_message (message_id);
"#;

/// `log_YYYYMM.db`: the audit trail.
pub const LOG_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sys_audit_log (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    target_id     TEXT,
    context_type  TEXT    NOT NULL,
    context_id    TEXT,
    operator_id   TEXT,
    category      TEXT    NOT NULL,
    action        TEXT    NOT NULL,
    summary       TEXT,
    meta_data     TEXT,
    created_at    INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_audit_context ON sys_audit_log (context_type, context_id, created_at);
CREATE INDEX IF NOT EXISTS idx_audit_operator ON sys_audit_log (operator_id, created_at);
CREATE INDEX IF NOT EXISTS idx_audit_target ON sys_audit_log (target_id, created_at);
"#;

/// `snapshot_YYYYMM.db`: history of names and cards.
pub const SNAPSHOT_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS obs_user_snapshot (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id     TEXT    NOT NULL,
    group_id    TEXT    NOT NULL,
    event_type  TEXT    NOT NULL,
    content     TEXT    NOT NULL,
    created_at  INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_user_snapshot ON obs_user_snapshot (user_id, group_id, created_at);

CREATE TABLE IF NOT EXISTS obs_group_snapshot (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    group_id    TEXT    NOT NULL,
    event_type  TEXT    NOT NULL DEFAULT 'GROUPNAME',
    content     TEXT    NOT NULL,
    created_at  INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_group_snapshot ON obs_group_snapshot (group_id, created_at);
"#;

/// `logs_YYYY_MM.db`: one row per chat message.
pub const MESSAGE_LOG_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS message_log (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    group_id    TEXT    NOT NULL,
    user_id     TEXT    NOT NULL,
    created_at  INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_message_group_time ON message_log (group_id, created_at);
CREATE INDEX IF NOT EXISTS idx_message_user_time ON message_log (group_id, user_id, created_at);
"#;

/// `summary.db`: per-day message counts with a 24-slot hourly histogram.
pub const SUMMARY_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS message_daily_summary (
    group_id       TEXT    NOT NULL,
    user_id        TEXT    NOT NULL,
    record_date    INTEGER NOT NULL,
    msg_count      INTEGER NOT NULL DEFAULT 0,
    hourly_counts  TEXT    NOT NULL DEFAULT '[]',
    PRIMARY KEY (group_id, user_id, record_date)
);
CREATE INDEX IF NOT EXISTS idx_summary_date ON message_daily_summary (group_id, record_date);
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name")
            .unwrap();
        stmt.query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<String>, _>>()
            .unwrap()
    }

    #[test]
    fn test_core_schema_tables() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(CORE_SCHEMA).unwrap();
        assert_eq!(
            table_names(&conn),
            [
                "biz_group",
                "biz_group_member",
                "biz_group_plugin_setting",
                "biz_invitation",
                "biz_invitation_message",
                "biz_user",
                "sys_blacklist",
            ]
        );
    }

    #[test]
    fn test_every_schema_is_idempotent() {
        for ddl in [
            CORE_SCHEMA,
            LOG_SCHEMA,
            SNAPSHOT_SCHEMA,
            MESSAGE_LOG_SCHEMA,
            SUMMARY_SCHEMA,
        ] {
            let conn = Connection::open_in_memory().unwrap();
            conn.execute_batch(ddl).unwrap();
            conn.execute_batch(ddl).unwrap();
        }
    }

    #[test]
    fn test_member_natural_key_is_unique() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(CORE_SCHEMA).unwrap();
        let insert = "INSERT INTO biz_group_member (group_id, user_id, created_at, updated_at) VALUES ('g', 'u', 0, 0)";
        conn.execute(insert, []).unwrap();
        assert!(conn.execute(insert, []).is_err());
    }
}

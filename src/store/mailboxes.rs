use chrono::Utc;
use rusqlite::params;

use super::DbPool;
use crate::error::EngineError;
use crate::remote::Affinity;

#[derive(Debug, Clone)]
pub struct Mailbox {
    pub email: String,
    pub affinity: Option<Affinity>,
}

/// Create the mailbox row if it does not exist yet. Affinity stays NULL
/// until discovery resolves it.
pub fn ensure_mailbox(pool: &DbPool, email: &str) -> Result<(), EngineError> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT OR IGNORE INTO mailboxes (email, updated_at) VALUES (?1, ?2)",
        params![email, Utc::now().timestamp_millis()],
    )?;
    Ok(())
}

pub fn get_mailbox(pool: &DbPool, email: &str) -> Result<Option<Mailbox>, EngineError> {
    let conn = pool.get()?;
    let result = conn.query_row(
        "SELECT email, endpoint, grouping_key FROM mailboxes WHERE email = ?1",
        params![email],
        |row| {
            let endpoint: Option<String> = row.get(1)?;
            let grouping_key: Option<String> = row.get(2)?;
            Ok(Mailbox {
                email: row.get(0)?,
                affinity: match (endpoint, grouping_key) {
                    (Some(endpoint), Some(grouping_key)) => Some(Affinity {
                        endpoint,
                        grouping_key,
                    }),
                    _ => None,
                },
            })
        },
    );
    match result {
        Ok(mailbox) => Ok(Some(mailbox)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(EngineError::Database(e.to_string())),
    }
}

pub fn set_affinity(pool: &DbPool, email: &str, affinity: &Affinity) -> Result<(), EngineError> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO mailboxes (email, endpoint, grouping_key, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(email) DO UPDATE SET
             endpoint = excluded.endpoint,
             grouping_key = excluded.grouping_key,
             updated_at = excluded.updated_at",
        params![
            email,
            affinity.endpoint,
            affinity.grouping_key,
            Utc::now().timestamp_millis()
        ],
    )?;
    Ok(())
}

/// Forget where a mailbox lives so the next discovery round re-resolves it.
pub fn clear_affinity(pool: &DbPool, email: &str) -> Result<(), EngineError> {
    let conn = pool.get()?;
    conn.execute(
        "UPDATE mailboxes SET endpoint = NULL, grouping_key = NULL, updated_at = ?2
         WHERE email = ?1",
        params![email, Utc::now().timestamp_millis()],
    )?;
    Ok(())
}

pub fn mark_invalid(pool: &DbPool, email: &str) -> Result<(), EngineError> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT OR IGNORE INTO invalid_mailboxes (email, marked_at) VALUES (?1, ?2)",
        params![email, Utc::now().timestamp_millis()],
    )?;
    Ok(())
}

pub fn is_invalid(pool: &DbPool, email: &str) -> Result<bool, EngineError> {
    let conn = pool.get()?;
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM invalid_mailboxes WHERE email = ?1",
        params![email],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Mailboxes still lacking an affinity, excluding the negative cache.
pub fn unresolved(pool: &DbPool) -> Result<Vec<String>, EngineError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT email FROM mailboxes
         WHERE endpoint IS NULL
           AND email NOT IN (SELECT email FROM invalid_mailboxes)
         ORDER BY email",
    )?;
    let rows = stmt.query_map([], |row| row.get(0))?;
    let mut emails = Vec::new();
    for row in rows {
        emails.push(row?);
    }
    Ok(emails)
}

/// Known, non-invalid mailboxes with a resolved affinity, ordered by
/// (endpoint, grouping key, email) so batching can group by affinity with a
/// single pass.
pub fn subscribable(pool: &DbPool) -> Result<Vec<(String, Affinity)>, EngineError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT email, endpoint, grouping_key FROM mailboxes
         WHERE endpoint IS NOT NULL AND grouping_key IS NOT NULL
           AND email NOT IN (SELECT email FROM invalid_mailboxes)
         ORDER BY endpoint, grouping_key, email",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            Affinity {
                endpoint: row.get(1)?,
                grouping_key: row.get(2)?,
            },
        ))
    })?;
    let mut mailboxes = Vec::new();
    for row in rows {
        mailboxes.push(row?);
    }
    Ok(mailboxes)
}

use chrono::Utc;
use rusqlite::params;

use super::DbPool;
use crate::error::EngineError;

/// A (mailbox, folder) pair that has never been synchronized, with the
/// backend endpoint its mailbox resolved to.
#[derive(Debug, Clone)]
pub struct BaselineTarget {
    pub email: String,
    pub folder: String,
    pub endpoint: String,
}

/// Returns `None` when the pair was never synchronized (missing row or NULL
/// cursor).
pub fn get_cursor(pool: &DbPool, email: &str, folder: &str) -> Result<Option<String>, EngineError> {
    let conn = pool.get()?;
    let result = conn.query_row(
        "SELECT cursor FROM sync_state WHERE email = ?1 AND folder = ?2",
        params![email, folder],
        |row| row.get::<_, Option<String>>(0),
    );
    match result {
        Ok(cursor) => Ok(cursor),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(EngineError::Database(e.to_string())),
    }
}

/// Upsert the cursor. `None` degrades the pair to 'never synchronized' so
/// the next sync call performs a full resync.
pub fn set_cursor(
    pool: &DbPool,
    email: &str,
    folder: &str,
    cursor: Option<&str>,
) -> Result<(), EngineError> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO sync_state (email, folder, cursor, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(email, folder) DO UPDATE SET
             cursor = excluded.cursor,
             updated_at = excluded.updated_at",
        params![email, folder, cursor, Utc::now().timestamp_millis()],
    )?;
    Ok(())
}

/// Subscribable mailboxes lacking a cursor for any of the given folders.
pub fn targets_lacking_cursor(
    pool: &DbPool,
    folders: &[String],
) -> Result<Vec<BaselineTarget>, EngineError> {
    let conn = pool.get()?;
    let mut targets = Vec::new();
    let mut stmt = conn.prepare(
        "SELECT m.email, m.endpoint FROM mailboxes m
         WHERE m.endpoint IS NOT NULL
           AND m.email NOT IN (SELECT email FROM invalid_mailboxes)
           AND m.email NOT IN (
               SELECT email FROM sync_state WHERE folder = ?1 AND cursor IS NOT NULL
           )
         ORDER BY m.email",
    )?;
    for folder in folders {
        let rows = stmt.query_map(params![folder], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (email, endpoint) = row?;
            targets.push(BaselineTarget {
                email,
                folder: folder.clone(),
                endpoint,
            });
        }
    }
    Ok(targets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::Affinity;
    use crate::store;
    use crate::store::mailboxes;

    #[test]
    fn test_cursor_roundtrip_and_degrade() {
        let pool = store::open_in_memory().unwrap();
        assert!(get_cursor(&pool, "a@x.example", "Inbox").unwrap().is_none());

        set_cursor(&pool, "a@x.example", "Inbox", Some("c1")).unwrap();
        assert_eq!(
            get_cursor(&pool, "a@x.example", "Inbox").unwrap().as_deref(),
            Some("c1")
        );

        // degrading to 'unknown' forces a full resync next round
        set_cursor(&pool, "a@x.example", "Inbox", None).unwrap();
        assert!(get_cursor(&pool, "a@x.example", "Inbox").unwrap().is_none());
    }

    #[test]
    fn test_targets_lacking_cursor() {
        let pool = store::open_in_memory().unwrap();
        let affinity = Affinity {
            endpoint: "https://b1".into(),
            grouping_key: "g1".into(),
        };
        mailboxes::set_affinity(&pool, "a@x.example", &affinity).unwrap();
        mailboxes::set_affinity(&pool, "b@x.example", &affinity).unwrap();
        set_cursor(&pool, "a@x.example", "Inbox", Some("c1")).unwrap();

        let folders = vec!["Inbox".to_string(), "Calendar".to_string()];
        let targets = targets_lacking_cursor(&pool, &folders).unwrap();
        let pairs: Vec<(String, String)> = targets
            .into_iter()
            .map(|t| (t.email, t.folder))
            .collect();

        // a@ has an Inbox cursor already, everything else still needs one
        assert_eq!(
            pairs,
            vec![
                ("b@x.example".to_string(), "Inbox".to_string()),
                ("a@x.example".to_string(), "Calendar".to_string()),
                ("b@x.example".to_string(), "Calendar".to_string()),
            ]
        );
    }
}

use rusqlite::params;

use super::DbPool;
use crate::error::EngineError;

#[derive(Debug, Clone)]
pub struct System {
    pub group_name: String,
    pub callback_url: Option<String>,
    pub is_local: bool,
}

/// Register (or update) a subscriber system. Local systems are administered
/// directly through `add_member`/`remove_member`; remote ones are expanded
/// from the directory.
pub fn register_system(
    pool: &DbPool,
    group_name: &str,
    callback_url: Option<&str>,
    is_local: bool,
) -> Result<(), EngineError> {
    if let Some(callback) = callback_url {
        url::Url::parse(callback)
            .map_err(|e| EngineError::InvalidInput(format!("bad callback URL {}: {}", callback, e)))?;
    }
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO systems (group_name, callback_url, is_local)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(group_name) DO UPDATE SET
             callback_url = excluded.callback_url,
             is_local = excluded.is_local",
        params![group_name, callback_url, is_local],
    )?;
    Ok(())
}

pub fn get_system(pool: &DbPool, group_name: &str) -> Result<Option<System>, EngineError> {
    let conn = pool.get()?;
    let result = conn.query_row(
        "SELECT group_name, callback_url, is_local FROM systems WHERE group_name = ?1",
        params![group_name],
        |row| {
            Ok(System {
                group_name: row.get(0)?,
                callback_url: row.get(1)?,
                is_local: row.get(2)?,
            })
        },
    );
    match result {
        Ok(system) => Ok(Some(system)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(EngineError::Database(e.to_string())),
    }
}

/// Systems whose membership is maintained by directory expansion.
pub fn remote_systems(pool: &DbPool) -> Result<Vec<System>, EngineError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT group_name, callback_url, is_local FROM systems
         WHERE is_local = 0 ORDER BY group_name",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(System {
            group_name: row.get(0)?,
            callback_url: row.get(1)?,
            is_local: row.get(2)?,
        })
    })?;
    let mut systems = Vec::new();
    for row in rows {
        systems.push(row?);
    }
    Ok(systems)
}

pub fn members(pool: &DbPool, group_name: &str) -> Result<Vec<String>, EngineError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT email FROM system_mailboxes WHERE group_name = ?1 ORDER BY email",
    )?;
    let rows = stmt.query_map(params![group_name], |row| row.get(0))?;
    let mut emails = Vec::new();
    for row in rows {
        emails.push(row?);
    }
    Ok(emails)
}

pub fn add_member(pool: &DbPool, group_name: &str, email: &str) -> Result<(), EngineError> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT OR IGNORE INTO system_mailboxes (group_name, email) VALUES (?1, ?2)",
        params![group_name, email],
    )?;
    Ok(())
}

pub fn remove_member(pool: &DbPool, group_name: &str, email: &str) -> Result<(), EngineError> {
    let conn = pool.get()?;
    conn.execute(
        "DELETE FROM system_mailboxes WHERE group_name = ?1 AND email = ?2",
        params![group_name, email],
    )?;
    Ok(())
}

/// Distinct, non-null callback URLs of every system the mailbox belongs to.
pub fn callback_urls_for_mailbox(pool: &DbPool, email: &str) -> Result<Vec<String>, EngineError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT DISTINCT s.callback_url
         FROM systems s
         JOIN system_mailboxes sm ON sm.group_name = s.group_name
         WHERE sm.email = ?1 AND s.callback_url IS NOT NULL
         ORDER BY s.callback_url",
    )?;
    let rows = stmt.query_map(params![email], |row| row.get(0))?;
    let mut urls = Vec::new();
    for row in rows {
        urls.push(row?);
    }
    Ok(urls)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store;

    #[test]
    fn test_register_and_membership_roundtrip() {
        let pool = store::open_in_memory().unwrap();
        register_system(&pool, "treasury", Some("http://cb.example/wake"), false).unwrap();
        add_member(&pool, "treasury", "a@x.example").unwrap();
        add_member(&pool, "treasury", "b@x.example").unwrap();
        add_member(&pool, "treasury", "a@x.example").unwrap(); // idempotent

        assert_eq!(
            members(&pool, "treasury").unwrap(),
            vec!["a@x.example", "b@x.example"]
        );

        remove_member(&pool, "treasury", "a@x.example").unwrap();
        assert_eq!(members(&pool, "treasury").unwrap(), vec!["b@x.example"]);
    }

    #[test]
    fn test_register_rejects_bad_callback_url() {
        let pool = store::open_in_memory().unwrap();
        let result = register_system(&pool, "treasury", Some("not a url"), true);
        assert!(matches!(result, Err(EngineError::InvalidInput(_))));
    }

    #[test]
    fn test_callback_urls_distinct_and_non_null() {
        let pool = store::open_in_memory().unwrap();
        register_system(&pool, "treasury", Some("http://cb.example/wake"), false).unwrap();
        register_system(&pool, "audit", Some("http://cb.example/wake"), false).unwrap();
        register_system(&pool, "silent", None, true).unwrap();
        for group in ["treasury", "audit", "silent"] {
            add_member(&pool, group, "a@x.example").unwrap();
        }

        let urls = callback_urls_for_mailbox(&pool, "a@x.example").unwrap();
        assert_eq!(urls, vec!["http://cb.example/wake"]);
    }

    #[test]
    fn test_remote_systems_excludes_local() {
        let pool = store::open_in_memory().unwrap();
        register_system(&pool, "local-desk", None, true).unwrap();
        register_system(&pool, "branch-ops", None, false).unwrap();

        let remote = remote_systems(&pool).unwrap();
        assert_eq!(remote.len(), 1);
        assert_eq!(remote[0].group_name, "branch-ops");
    }
}

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter};
use serde::{Deserialize, Serialize};

use super::DbPool;
use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Created,
    Updated,
    Deleted,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Created => "created",
            ChangeType::Updated => "updated",
            ChangeType::Deleted => "deleted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "created" => Some(ChangeType::Created),
            "updated" => Some(ChangeType::Updated),
            "deleted" => Some(ChangeType::Deleted),
            _ => None,
        }
    }
}

/// One row of the append-only change log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationRecord {
    pub timestamp: DateTime<Utc>,
    pub email: String,
    pub folder: String,
    pub item_id: String,
    pub change_type: ChangeType,
    /// Optional raw event metadata, serialized JSON
    pub details: Option<String>,
}

pub fn exists(
    pool: &DbPool,
    timestamp: DateTime<Utc>,
    email: &str,
    item_id: &str,
) -> Result<bool, EngineError> {
    let conn = pool.get()?;
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM notifications WHERE ts = ?1 AND email = ?2 AND item_id = ?3",
        params![timestamp.timestamp_millis(), email, item_id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Insert records in one transaction. `INSERT OR IGNORE` against the
/// UNIQUE(ts, email, item_id) index closes the race with concurrent
/// ingestion; returns the number of rows actually written.
pub fn insert_batch(pool: &DbPool, records: &[NotificationRecord]) -> Result<usize, EngineError> {
    if records.is_empty() {
        return Ok(0);
    }
    let mut conn = pool.get()?;
    let tx = conn.transaction()?;
    let mut inserted = 0;
    {
        let mut stmt = tx.prepare(
            "INSERT OR IGNORE INTO notifications (ts, email, folder, item_id, change_type, details)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        for record in records {
            inserted += stmt.execute(params![
                record.timestamp.timestamp_millis(),
                record.email,
                record.folder,
                record.item_id,
                record.change_type.as_str(),
                record.details,
            ])?;
        }
    }
    tx.commit()?;
    Ok(inserted)
}

/// Filter for the upward query surface. `skip`/`take` paginate; the rest
/// narrow the result.
#[derive(Debug, Clone, Default)]
pub struct ChangeFilter {
    /// Restrict to mailboxes belonging to this subscriber system
    pub system: Option<String>,
    pub mailbox: Option<String>,
    pub folder: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub skip: Option<u64>,
    pub take: Option<u64>,
}

fn build_where(filter: &ChangeFilter, sql: &mut String, values: &mut Vec<Value>) {
    if let Some(system) = &filter.system {
        values.push(Value::Text(system.clone()));
        sql.push_str(&format!(
            " AND n.email IN (SELECT email FROM system_mailboxes WHERE group_name = ?{})",
            values.len()
        ));
    }
    if let Some(mailbox) = &filter.mailbox {
        values.push(Value::Text(mailbox.clone()));
        sql.push_str(&format!(" AND n.email = ?{}", values.len()));
    }
    if let Some(folder) = &filter.folder {
        values.push(Value::Text(folder.clone()));
        sql.push_str(&format!(" AND n.folder = ?{}", values.len()));
    }
    if let Some(start) = filter.start {
        values.push(Value::Integer(start.timestamp_millis()));
        sql.push_str(&format!(" AND n.ts >= ?{}", values.len()));
    }
    if let Some(end) = filter.end {
        values.push(Value::Integer(end.timestamp_millis()));
        sql.push_str(&format!(" AND n.ts < ?{}", values.len()));
    }
}

/// Change log query, ordered by (timestamp, email, item_id).
pub fn get_changes(
    pool: &DbPool,
    filter: &ChangeFilter,
) -> Result<Vec<NotificationRecord>, EngineError> {
    let conn = pool.get()?;
    let mut sql = String::from(
        "SELECT n.ts, n.email, n.folder, n.item_id, n.change_type, n.details
         FROM notifications n WHERE 1 = 1",
    );
    let mut values: Vec<Value> = Vec::new();
    build_where(filter, &mut sql, &mut values);
    sql.push_str(" ORDER BY n.ts, n.email, n.item_id");
    sql.push_str(&format!(
        " LIMIT {} OFFSET {}",
        filter.take.map(|t| t as i64).unwrap_or(-1),
        filter.skip.unwrap_or(0)
    ));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(values), |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, Option<String>>(5)?,
        ))
    })?;

    let mut records = Vec::new();
    for row in rows {
        let (ts, email, folder, item_id, change_type, details) = row?;
        let change_type = ChangeType::parse(&change_type)
            .ok_or_else(|| EngineError::Database(format!("bad change_type: {}", change_type)))?;
        records.push(NotificationRecord {
            timestamp: DateTime::from_timestamp_millis(ts).unwrap_or(DateTime::UNIX_EPOCH),
            email,
            folder,
            item_id,
            change_type,
            details,
        });
    }
    Ok(records)
}

/// Grouped change counts per (mailbox, folder).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeStats {
    pub email: String,
    pub folder: String,
    pub count: i64,
}

pub fn get_change_stats(
    pool: &DbPool,
    filter: &ChangeFilter,
) -> Result<Vec<ChangeStats>, EngineError> {
    let conn = pool.get()?;
    let mut sql = String::from(
        "SELECT n.email, n.folder, COUNT(*) FROM notifications n WHERE 1 = 1",
    );
    let mut values: Vec<Value> = Vec::new();
    build_where(filter, &mut sql, &mut values);
    sql.push_str(" GROUP BY n.email, n.folder ORDER BY n.email, n.folder");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(values), |row| {
        Ok(ChangeStats {
            email: row.get(0)?,
            folder: row.get(1)?,
            count: row.get(2)?,
        })
    })?;
    let mut stats = Vec::new();
    for row in rows {
        stats.push(row?);
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store;
    use crate::store::groups;

    fn record(ts_ms: i64, email: &str, folder: &str, item: &str) -> NotificationRecord {
        NotificationRecord {
            timestamp: DateTime::from_timestamp_millis(ts_ms).unwrap(),
            email: email.to_string(),
            folder: folder.to_string(),
            item_id: item.to_string(),
            change_type: ChangeType::Created,
            details: None,
        }
    }

    #[test]
    fn test_duplicate_key_persists_exactly_once() {
        let pool = store::open_in_memory().unwrap();
        let r = record(1000, "a@x.example", "Inbox", "item-1");

        assert_eq!(insert_batch(&pool, &[r.clone()]).unwrap(), 1);
        assert_eq!(insert_batch(&pool, &[r.clone()]).unwrap(), 0);
        assert!(exists(&pool, r.timestamp, &r.email, &r.item_id).unwrap());

        let all = get_changes(&pool, &ChangeFilter::default()).unwrap();
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn test_same_item_different_timestamp_is_a_new_row() {
        let pool = store::open_in_memory().unwrap();
        insert_batch(
            &pool,
            &[
                record(1000, "a@x.example", "Inbox", "item-1"),
                record(2000, "a@x.example", "Inbox", "item-1"),
            ],
        )
        .unwrap();
        assert_eq!(get_changes(&pool, &ChangeFilter::default()).unwrap().len(), 2);
    }

    #[test]
    fn test_get_changes_ordering_and_pagination() {
        let pool = store::open_in_memory().unwrap();
        insert_batch(
            &pool,
            &[
                record(3000, "b@x.example", "Inbox", "i3"),
                record(1000, "a@x.example", "Inbox", "i1"),
                record(2000, "a@x.example", "Inbox", "i2"),
            ],
        )
        .unwrap();

        let all = get_changes(&pool, &ChangeFilter::default()).unwrap();
        let items: Vec<&str> = all.iter().map(|r| r.item_id.as_str()).collect();
        assert_eq!(items, vec!["i1", "i2", "i3"]);

        let page = get_changes(
            &pool,
            &ChangeFilter {
                skip: Some(1),
                take: Some(1),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].item_id, "i2");
    }

    #[test]
    fn test_filter_by_system_and_time_range() {
        let pool = store::open_in_memory().unwrap();
        groups::register_system(&pool, "treasury", None, false).unwrap();
        groups::add_member(&pool, "treasury", "a@x.example").unwrap();
        insert_batch(
            &pool,
            &[
                record(1000, "a@x.example", "Inbox", "i1"),
                record(2000, "a@x.example", "Inbox", "i2"),
                record(1500, "b@x.example", "Inbox", "i3"),
            ],
        )
        .unwrap();

        let filtered = get_changes(
            &pool,
            &ChangeFilter {
                system: Some("treasury".into()),
                start: Some(DateTime::from_timestamp_millis(1500).unwrap()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].item_id, "i2");
    }

    #[test]
    fn test_change_stats_grouping() {
        let pool = store::open_in_memory().unwrap();
        insert_batch(
            &pool,
            &[
                record(1000, "a@x.example", "Inbox", "i1"),
                record(2000, "a@x.example", "Inbox", "i2"),
                record(3000, "a@x.example", "Calendar", "i3"),
                record(4000, "b@x.example", "Inbox", "i4"),
            ],
        )
        .unwrap();

        let stats = get_change_stats(&pool, &ChangeFilter::default()).unwrap();
        assert_eq!(
            stats,
            vec![
                ChangeStats {
                    email: "a@x.example".into(),
                    folder: "Calendar".into(),
                    count: 1
                },
                ChangeStats {
                    email: "a@x.example".into(),
                    folder: "Inbox".into(),
                    count: 2
                },
                ChangeStats {
                    email: "b@x.example".into(),
                    folder: "Inbox".into(),
                    count: 1
                },
            ]
        );
    }
}

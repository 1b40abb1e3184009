use rusqlite::{params, Connection};

use crate::error::AppError;
use crate::models::bookmark::BookmarkTag;

fn tag_from_row(url: String, tags_json: &str) -> Result<BookmarkTag, serde_json::Error> {
    let tags = serde_json::from_str(tags_json)?;
    Ok(BookmarkTag { url, tags })
}

/// A stored record whose tag column is not a JSON string array is an error.
pub fn get_tag(conn: &Connection, url: &str) -> Result<Option<BookmarkTag>, AppError> {
    let mut stmt = conn.prepare("SELECT url, tags FROM bookmark_tags WHERE url = ?1")?;

    let row: Option<(String, String)> = stmt
        .query_row(params![url], |row| Ok((row.get(0)?, row.get(1)?)))
        .optional()?;

    match row {
        Some((url, tags_json)) => Ok(Some(tag_from_row(url, &tags_json)?)),
        None => Ok(None),
    }
}

/// Every readable record; records with an unparseable tag column are logged
/// and skipped, while SQLite errors abort the read.
pub fn get_all_tags(conn: &Connection) -> Result<Vec<BookmarkTag>, AppError> {
    let mut stmt = conn.prepare("SELECT url, tags FROM bookmark_tags ORDER BY url ASC")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;

    let mut records = Vec::new();
    for row in rows {
        let (url, tags_json) = row?;
        match tag_from_row(url.clone(), &tags_json) {
            Ok(record) => records.push(record),
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "skipping tag record with corrupt tag list");
            }
        }
    }

    Ok(records)
}

pub fn put_tag(conn: &Connection, record: &BookmarkTag) -> Result<(), AppError> {
    let tags_json = serde_json::to_string(&record.tags)?;
    conn.execute(
        "INSERT INTO bookmark_tags (url, tags, updated_at) VALUES (?1, ?2, CURRENT_TIMESTAMP)
         ON CONFLICT(url) DO UPDATE SET tags = excluded.tags, updated_at = CURRENT_TIMESTAMP",
        params![record.url, tags_json],
    )?;
    Ok(())
}

pub fn delete_tag(conn: &Connection, url: &str) -> Result<usize, AppError> {
    let count = conn.execute("DELETE FROM bookmark_tags WHERE url = ?1", params![url])?;
    Ok(count)
}

/// Writes every record inside one transaction; either all land or none do.
pub fn batch_put_tags(conn: &mut Connection, records: &[BookmarkTag]) -> Result<(), AppError> {
    let tx = conn.transaction()?;
    for record in records {
        put_tag(&tx, record)?;
    }
    tx.commit()?;
    Ok(())
}

pub fn batch_delete_tags(conn: &mut Connection, urls: &[String]) -> Result<usize, AppError> {
    let tx = conn.transaction()?;
    let mut count = 0;
    for url in urls {
        count += delete_tag(&tx, url)?;
    }
    tx.commit()?;
    Ok(count)
}

pub fn clear_tags(conn: &Connection) -> Result<usize, AppError> {
    let count = conn.execute("DELETE FROM bookmark_tags", [])?;
    Ok(count)
}

pub fn get_setting(conn: &Connection, key: &str) -> Result<Option<String>, AppError> {
    let mut stmt = conn.prepare("SELECT value FROM settings WHERE key = ?1")?;
    let value = stmt
        .query_row(params![key], |row| row.get(0))
        .optional()?;
    Ok(value)
}

pub fn set_setting(conn: &Connection, key: &str, value: &str) -> Result<(), AppError> {
    conn.execute(
        "INSERT INTO settings (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

// Needed for rusqlite optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>, rusqlite::Error>;
}

impl<T> OptionalExt<T> for Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>, rusqlite::Error> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

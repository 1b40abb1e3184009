use std::sync::Mutex;

use rusqlite::Connection;

use crate::data::{migrations, repository};
use crate::error::AppError;
use crate::models::bookmark::BookmarkTag;

/// Keyed URL → tags persistence. Every call, batches included, is atomic at
/// this boundary; callers get no cross-call transaction.
pub trait TagStore: Send + Sync {
    fn get(&self, url: &str) -> Result<Option<BookmarkTag>, AppError>;
    fn get_all(&self) -> Result<Vec<BookmarkTag>, AppError>;
    fn put(&self, record: &BookmarkTag) -> Result<(), AppError>;
    fn delete(&self, url: &str) -> Result<(), AppError>;
    fn batch_put(&self, records: &[BookmarkTag]) -> Result<(), AppError>;
    fn batch_delete(&self, urls: &[String]) -> Result<(), AppError>;
    fn clear(&self) -> Result<(), AppError>;
}

pub struct SqliteTagStore {
    conn: Mutex<Connection>,
}

impl SqliteTagStore {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    pub fn open_in_memory() -> Result<Self, AppError> {
        let conn = Connection::open_in_memory()?;
        migrations::run_migrations(&conn)?;
        Ok(Self::new(conn))
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, AppError>,
    ) -> Result<T, AppError> {
        let mut conn = self
            .conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut conn)
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<String>, AppError> {
        self.with_conn(|conn| repository::get_setting(conn, key))
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<(), AppError> {
        self.with_conn(|conn| repository::set_setting(conn, key, value))
    }
}

impl TagStore for SqliteTagStore {
    fn get(&self, url: &str) -> Result<Option<BookmarkTag>, AppError> {
        self.with_conn(|conn| repository::get_tag(conn, url))
    }

    fn get_all(&self) -> Result<Vec<BookmarkTag>, AppError> {
        self.with_conn(|conn| repository::get_all_tags(conn))
    }

    fn put(&self, record: &BookmarkTag) -> Result<(), AppError> {
        self.with_conn(|conn| repository::put_tag(conn, record))
    }

    fn delete(&self, url: &str) -> Result<(), AppError> {
        self.with_conn(|conn| repository::delete_tag(conn, url).map(|_| ()))
    }

    fn batch_put(&self, records: &[BookmarkTag]) -> Result<(), AppError> {
        if records.is_empty() {
            return Ok(());
        }
        self.with_conn(|conn| repository::batch_put_tags(conn, records))
    }

    fn batch_delete(&self, urls: &[String]) -> Result<(), AppError> {
        if urls.is_empty() {
            return Ok(());
        }
        self.with_conn(|conn| repository::batch_delete_tags(conn, urls).map(|_| ()))
    }

    fn clear(&self) -> Result<(), AppError> {
        self.with_conn(|conn| repository::clear_tags(conn).map(|_| ()))
    }
}

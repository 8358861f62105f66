//! The URL frontier: a durable work queue keyed by URL.
//!
//! Every URL the archiver has seen lives in one SQLite table together
//! with its processing status. The table survives process restarts, so a
//! crawl resumed with the same `--database` picks up exactly where it
//! left off. All mutations are serialized behind one connection; the
//! claim operation ([`Frontier::get_and_update`]) is a single critical
//! section so two workers can never observe the same `todo` row.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension, Row};
use webtrawl_core::{Error, LinkType, Result, Status, UrlRecord};

const SCHEMA: &str = r"
    CREATE TABLE IF NOT EXISTS urls
    (
        url TEXT PRIMARY KEY,
        status TEXT NOT NULL,
        try_count INTEGER NOT NULL DEFAULT 0,
        level INTEGER NOT NULL DEFAULT 0,
        top_url TEXT,
        status_code INTEGER,
        referrer TEXT,
        inline INTEGER NOT NULL DEFAULT 0,
        link_type TEXT,
        url_encoding TEXT,
        post_data BLOB,
        filename TEXT
    );

    CREATE INDEX IF NOT EXISTS url_status_index ON urls (status);
";

/// Attributes applied to a batch of URLs by [`Frontier::add`].
///
/// `None` fields are left untouched, which is what keeps discovery from
/// clobbering rows that already finished: a re-discovered URL gets fresh
/// `referrer`/`level` hints but its status survives.
#[derive(Debug, Clone, Default)]
pub struct AddDefaults {
    pub level: Option<u32>,
    pub referrer: Option<String>,
    pub top_url: Option<String>,
    pub inline: Option<bool>,
    pub link_type: Option<LinkType>,
    pub url_encoding: Option<String>,
    pub post_data: Option<Vec<u8>>,
}

/// Field updates for [`Frontier::update`]. `None` fields are untouched.
#[derive(Debug, Clone, Default)]
pub struct UpdateFields {
    pub status: Option<Status>,
    pub status_code: Option<u16>,
    pub filename: Option<String>,
    pub link_type: Option<LinkType>,
}

pub struct Frontier {
    conn: Mutex<Connection>,
}

impl Frontier {
    /// Open or create the frontier at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(db_err)?;
        Self::initialize(conn)
    }

    /// An in-memory frontier, the default when no `--database` is given.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::initialize(conn)
    }

    fn initialize(conn: Connection) -> Result<Self> {
        // WAL keeps the claim/update path durable without blocking readers.
        // In-memory databases reject WAL; ignore the pragma result there.
        let _ = conn.pragma_update(None, "journal_mode", "WAL");
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert `urls` that are not yet present, then apply `defaults` to
    /// every supplied URL. One transaction: a seed batch never partially
    /// applies. Pre-existing rows keep their status and try count.
    pub fn add(&self, urls: &[String], defaults: &AddDefaults) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(db_err)?;
        {
            let mut insert = tx
                .prepare_cached("INSERT OR IGNORE INTO urls (url, status) VALUES (?1, ?2)")
                .map_err(db_err)?;
            for url in urls {
                insert
                    .execute(params![url, Status::Todo.as_str()])
                    .map_err(db_err)?;
            }
        }
        for url in urls {
            if let Some(level) = defaults.level {
                tx.execute(
                    "UPDATE urls SET level = ?1 WHERE url = ?2",
                    params![level, url],
                )
                .map_err(db_err)?;
            }
            if let Some(referrer) = &defaults.referrer {
                tx.execute(
                    "UPDATE urls SET referrer = ?1 WHERE url = ?2",
                    params![referrer, url],
                )
                .map_err(db_err)?;
            }
            if let Some(top_url) = &defaults.top_url {
                tx.execute(
                    "UPDATE urls SET top_url = ?1 WHERE url = ?2",
                    params![top_url, url],
                )
                .map_err(db_err)?;
            }
            if let Some(inline) = defaults.inline {
                tx.execute(
                    "UPDATE urls SET inline = ?1 WHERE url = ?2",
                    params![inline as i64, url],
                )
                .map_err(db_err)?;
            }
            if let Some(link_type) = defaults.link_type {
                tx.execute(
                    "UPDATE urls SET link_type = ?1 WHERE url = ?2",
                    params![link_type.as_str(), url],
                )
                .map_err(db_err)?;
            }
            if let Some(encoding) = &defaults.url_encoding {
                tx.execute(
                    "UPDATE urls SET url_encoding = ?1 WHERE url = ?2",
                    params![encoding, url],
                )
                .map_err(db_err)?;
            }
            if let Some(post_data) = &defaults.post_data {
                tx.execute(
                    "UPDATE urls SET post_data = ?1 WHERE url = ?2",
                    params![post_data, url],
                )
                .map_err(db_err)?;
            }
        }
        tx.commit().map_err(db_err)
    }

    /// Atomically claim one row with `from` status (optionally bounded by
    /// `level < max_level`), transition it to `to`, and return the row as
    /// transitioned. `Error::NotFound` when nothing matches. Rows are
    /// claimed in insertion order.
    pub fn get_and_update(
        &self,
        from: Status,
        to: Status,
        max_level: Option<u32>,
    ) -> Result<UrlRecord> {
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(db_err)?;
        let url: Option<String> = match max_level {
            None => tx
                .query_row(
                    "SELECT url FROM urls WHERE status = ?1 ORDER BY rowid LIMIT 1",
                    params![from.as_str()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?,
            Some(max_level) => tx
                .query_row(
                    "SELECT url FROM urls WHERE status = ?1 AND level < ?2 \
                     ORDER BY rowid LIMIT 1",
                    params![from.as_str(), max_level],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?,
        };
        let url = url.ok_or(Error::NotFound)?;
        tx.execute(
            "UPDATE urls SET status = ?1 WHERE url = ?2",
            params![to.as_str(), url],
        )
        .map_err(db_err)?;
        let record = tx
            .query_row("SELECT * FROM urls WHERE url = ?1", params![url], record_from_row)
            .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        Ok(record)
    }

    /// Set fields on one row, optionally bumping `try_count` by one.
    pub fn update(
        &self,
        url: &str,
        increment_try_count: bool,
        fields: &UpdateFields,
    ) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(db_err)?;
        if increment_try_count {
            tx.execute(
                "UPDATE urls SET try_count = try_count + 1 WHERE url = ?1",
                params![url],
            )
            .map_err(db_err)?;
        }
        if let Some(status) = fields.status {
            tx.execute(
                "UPDATE urls SET status = ?1 WHERE url = ?2",
                params![status.as_str(), url],
            )
            .map_err(db_err)?;
        }
        if let Some(code) = fields.status_code {
            tx.execute(
                "UPDATE urls SET status_code = ?1 WHERE url = ?2",
                params![code, url],
            )
            .map_err(db_err)?;
        }
        if let Some(filename) = &fields.filename {
            tx.execute(
                "UPDATE urls SET filename = ?1 WHERE url = ?2",
                params![filename, url],
            )
            .map_err(db_err)?;
        }
        if let Some(link_type) = fields.link_type {
            tx.execute(
                "UPDATE urls SET link_type = ?1 WHERE url = ?2",
                params![link_type.as_str(), url],
            )
            .map_err(db_err)?;
        }
        tx.commit().map_err(db_err)
    }

    /// Return every `in_progress` row to `todo`. Runs once at startup to
    /// repair rows left dangling by a killed process, never concurrently
    /// with workers.
    pub fn release(&self) -> Result<()> {
        self.lock()
            .execute(
                "UPDATE urls SET status = ?1 WHERE status = ?2",
                params![Status::Todo.as_str(), Status::InProgress.as_str()],
            )
            .map(|_| ())
            .map_err(db_err)
    }

    /// Delete one row. Only the hook-driven replace path uses this.
    pub fn remove_one(&self, url: &str) -> Result<()> {
        self.lock()
            .execute("DELETE FROM urls WHERE url = ?1", params![url])
            .map(|_| ())
            .map_err(db_err)
    }

    pub fn count(&self) -> Result<u64> {
        self.lock()
            .query_row("SELECT count(rowid) FROM urls", [], |row| row.get::<_, i64>(0))
            .map(|n| n as u64)
            .map_err(db_err)
    }

    pub fn count_by_status(&self, status: Status) -> Result<u64> {
        self.lock()
            .query_row(
                "SELECT count(rowid) FROM urls WHERE status = ?1",
                params![status.as_str()],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as u64)
            .map_err(db_err)
    }

    /// Indexed lookup by URL.
    pub fn get(&self, url: &str) -> Result<UrlRecord> {
        self.lock()
            .query_row(
                "SELECT * FROM urls WHERE url = ?1",
                params![url],
                record_from_row,
            )
            .optional()
            .map_err(db_err)?
            .ok_or(Error::NotFound)
    }

    /// Snapshot of every row, in insertion order.
    pub fn snapshot(&self) -> Result<Vec<UrlRecord>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT * FROM urls ORDER BY rowid")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], record_from_row)
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        Ok(rows)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<UrlRecord> {
    let status: String = row.get("status")?;
    let link_type: Option<String> = row.get("link_type")?;
    let status_code: Option<i64> = row.get("status_code")?;
    Ok(UrlRecord {
        url: row.get("url")?,
        status: Status::parse(&status).unwrap_or(Status::Todo),
        try_count: row.get("try_count")?,
        level: row.get("level")?,
        top_url: row.get("top_url")?,
        status_code: status_code.map(|code| code as u16),
        referrer: row.get("referrer")?,
        inline: row.get::<_, i64>("inline")? != 0,
        link_type: link_type.as_deref().and_then(LinkType::parse),
        url_encoding: row.get("url_encoding")?,
        post_data: row.get("post_data")?,
        filename: row.get("filename")?,
    })
}

fn db_err(err: rusqlite::Error) -> Error {
    Error::Database(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn frontier() -> Frontier {
        Frontier::open_in_memory().unwrap()
    }

    #[test]
    fn add_is_idempotent_and_preserves_terminal_status() {
        let table = frontier();
        let urls = vec!["http://example.com/".to_string()];
        table.add(&urls, &AddDefaults::default()).unwrap();
        table
            .update(
                "http://example.com/",
                false,
                &UpdateFields {
                    status: Some(Status::Done),
                    ..Default::default()
                },
            )
            .unwrap();

        // Re-discovery updates hints but must not revert the status.
        table
            .add(
                &urls,
                &AddDefaults {
                    referrer: Some("http://example.com/other".to_string()),
                    level: Some(3),
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(table.count().unwrap(), 1);
        let record = table.get("http://example.com/").unwrap();
        assert_eq!(record.status, Status::Done);
        assert_eq!(record.level, 3);
        assert_eq!(
            record.referrer.as_deref(),
            Some("http://example.com/other")
        );
    }

    #[test]
    fn get_and_update_claims_in_insertion_order() {
        let table = frontier();
        let urls: Vec<String> = (0..3)
            .map(|i| format!("http://example.com/{i}"))
            .collect();
        table.add(&urls, &AddDefaults::default()).unwrap();

        let first = table
            .get_and_update(Status::Todo, Status::InProgress, None)
            .unwrap();
        assert_eq!(first.url, "http://example.com/0");
        assert_eq!(first.status, Status::InProgress);
    }

    #[test]
    fn get_and_update_respects_level_bound() {
        let table = frontier();
        table
            .add(
                &["http://example.com/deep".to_string()],
                &AddDefaults {
                    level: Some(5),
                    ..Default::default()
                },
            )
            .unwrap();

        let err = table
            .get_and_update(Status::Todo, Status::InProgress, Some(5))
            .unwrap_err();
        assert!(matches!(err, Error::NotFound));
        assert!(table
            .get_and_update(Status::Todo, Status::InProgress, Some(6))
            .is_ok());
    }

    #[test]
    fn release_repairs_dangling_rows() {
        let table = frontier();
        table
            .add(&["http://example.com/".to_string()], &AddDefaults::default())
            .unwrap();
        table
            .get_and_update(Status::Todo, Status::InProgress, None)
            .unwrap();
        assert_eq!(table.count_by_status(Status::InProgress).unwrap(), 1);

        table.release().unwrap();
        assert_eq!(table.count_by_status(Status::InProgress).unwrap(), 0);
        assert_eq!(table.count_by_status(Status::Todo).unwrap(), 1);
    }

    #[test]
    fn try_count_increments_at_most_once_per_update() {
        let table = frontier();
        table
            .add(&["http://example.com/".to_string()], &AddDefaults::default())
            .unwrap();
        table
            .update(
                "http://example.com/",
                true,
                &UpdateFields {
                    status: Some(Status::Error),
                    ..Default::default()
                },
            )
            .unwrap();
        table
            .update("http://example.com/", false, &UpdateFields::default())
            .unwrap();
        assert_eq!(table.get("http://example.com/").unwrap().try_count, 1);
    }

    #[test]
    fn remove_one_deletes_the_row() {
        let table = frontier();
        table
            .add(&["http://example.com/".to_string()], &AddDefaults::default())
            .unwrap();
        table.remove_one("http://example.com/").unwrap();
        assert!(matches!(
            table.get("http://example.com/"),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn concurrent_dispatch_never_duplicates() {
        let table = Arc::new(frontier());
        let urls: Vec<String> = (0..2000)
            .map(|i| format!("http://example.com/{i}"))
            .collect();
        table.add(&urls, &AddDefaults::default()).unwrap();

        let mut handles = Vec::new();
        for _ in 0..32 {
            let table = Arc::clone(&table);
            handles.push(std::thread::spawn(move || {
                let mut claimed = Vec::new();
                loop {
                    match table.get_and_update(Status::Todo, Status::InProgress, None) {
                        Ok(record) => claimed.push(record.url),
                        Err(Error::NotFound) => break,
                        Err(err) => panic!("unexpected: {err}"),
                    }
                }
                claimed
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for url in handle.join().unwrap() {
                assert!(seen.insert(url), "url dispatched twice");
            }
        }
        assert_eq!(seen.len(), 2000);
        assert_eq!(table.count().unwrap(), 2000);
    }
}

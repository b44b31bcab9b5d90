use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::entry::{is_valid_entry_id, AccessLogEntry};

/// Outcome of a startup consistency pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Image files with no entry, removed.
    pub orphan_images: usize,
    /// Entries whose image file was missing, removed.
    pub dangling_entries: usize,
}

/// Durable newest-first access log backed by SQLite plus one JPEG per entry.
///
/// Every operation runs under the connection mutex, so the recording path and
/// the delete/clear paths never interleave their read-modify-write. Reads
/// always go to the database; nothing is cached in memory.
pub struct AccessLogStore {
    conn: Mutex<Connection>,
    images_dir: PathBuf,
    max_entries: usize,
}

impl AccessLogStore {
    pub fn open(db_path: &str, images_dir: impl AsRef<Path>, max_entries: usize) -> Result<Self> {
        let images_dir = images_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&images_dir)
            .with_context(|| format!("create images directory {}", images_dir.display()))?;
        let conn = Connection::open(db_path)
            .with_context(|| format!("open access log database {}", db_path))?;
        let store = Self {
            conn: Mutex::new(conn),
            images_dir,
            max_entries: max_entries.max(1),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<()> {
        self.lock()?.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS access_log (
              seq INTEGER PRIMARY KEY AUTOINCREMENT,
              id TEXT NOT NULL UNIQUE,
              created_at INTEGER NOT NULL,
              timestamp TEXT NOT NULL,
              labels_json TEXT NOT NULL,
              count INTEGER NOT NULL,
              image TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("access log lock poisoned"))
    }

    pub fn images_dir(&self) -> &Path {
        &self.images_dir
    }

    /// Persist the snapshot, then the entry. The image is removed again if the
    /// row cannot be written, so no entry ever exists without its image.
    pub fn insert(&self, entry: &AccessLogEntry, jpeg: &[u8]) -> Result<()> {
        if !is_valid_entry_id(&entry.id) {
            return Err(anyhow!("invalid access log entry id '{}'", entry.id));
        }
        let mut conn = self.lock()?;
        let image_path = self.images_dir.join(&entry.image);
        write_image(&image_path, jpeg)?;

        let labels_json = serde_json::to_string(&entry.labels)?;
        let created_at = chrono::Utc::now().timestamp();
        let inserted = conn.execute(
            r#"
            INSERT INTO access_log(id, created_at, timestamp, labels_json, count, image)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                entry.id,
                created_at,
                entry.timestamp,
                labels_json,
                entry.count as i64,
                entry.image
            ],
        );
        if let Err(err) = inserted {
            remove_image(&image_path)?;
            return Err(anyhow::Error::new(err).context(format!("insert entry {}", entry.id)));
        }

        self.prune_locked(&mut conn)?;
        Ok(())
    }

    /// Newest-first entries, at most `limit`. Rows that fail to decode are skipped.
    pub fn list(&self, limit: usize) -> Result<Vec<AccessLogEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, labels_json, count, image FROM access_log ORDER BY seq DESC LIMIT ?1",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut rows = stmt.query(params![limit])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            match entry_from_row(row) {
                Ok(entry) => out.push(entry),
                Err(err) => log::warn!("access log: skipping corrupt row: {}", err),
            }
        }
        Ok(out)
    }

    pub fn get(&self, id: &str) -> Result<Option<AccessLogEntry>> {
        if !is_valid_entry_id(id) {
            return Ok(None);
        }
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, labels_json, count, image FROM access_log WHERE id = ?1",
        )?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => entry_from_row(row).map(Some),
            None => Ok(None),
        }
    }

    /// Path of the snapshot for `id`, if the entry exists and its file is present.
    pub fn image_path(&self, id: &str) -> Result<Option<PathBuf>> {
        let Some(entry) = self.get(id)? else {
            return Ok(None);
        };
        let path = self.images_dir.join(entry.image);
        Ok(path.is_file().then_some(path))
    }

    /// Remove one entry, then its image. `Ok(false)` when no such entry exists.
    pub fn delete(&self, id: &str) -> Result<bool> {
        if !is_valid_entry_id(id) {
            return Ok(false);
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let image: Option<String> = tx
            .query_row(
                "SELECT image FROM access_log WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(image) = image else {
            return Ok(false);
        };
        tx.execute("DELETE FROM access_log WHERE id = ?1", params![id])?;
        tx.commit()?;
        self.discard_image(&image);
        Ok(true)
    }

    /// Remove every entry and image. Returns the number of entries removed.
    pub fn clear(&self) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let images = {
            let mut stmt = tx.prepare("SELECT image FROM access_log")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        let removed = tx.execute("DELETE FROM access_log", [])?;
        tx.commit()?;
        for image in &images {
            self.discard_image(image);
        }
        Ok(removed)
    }

    pub fn len(&self) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM access_log", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Bring the database and the images directory back in line: drop entries
    /// whose image is gone and delete images no entry refers to.
    pub fn reconcile(&self) -> Result<ReconcileReport> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let rows = {
            let mut stmt = tx.prepare("SELECT id, image FROM access_log")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        let mut report = ReconcileReport::default();
        let mut referenced = HashSet::new();
        for (id, image) in rows {
            if self.images_dir.join(&image).is_file() {
                referenced.insert(image);
            } else {
                tx.execute("DELETE FROM access_log WHERE id = ?1", params![id])?;
                report.dangling_entries += 1;
            }
        }
        tx.commit()?;

        for dir_entry in std::fs::read_dir(&self.images_dir)
            .with_context(|| format!("read images directory {}", self.images_dir.display()))?
        {
            let path = dir_entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(id) = name.strip_suffix(".jpg") else {
                continue;
            };
            if is_valid_entry_id(id) && !referenced.contains(name) && self.discard_image(name) {
                report.orphan_images += 1;
            }
        }

        if report != ReconcileReport::default() {
            log::warn!(
                "access log reconciled: {} orphan images, {} dangling entries removed",
                report.orphan_images,
                report.dangling_entries
            );
        }
        Ok(report)
    }

    /// Remove an image whose entry is already gone. A file that cannot be
    /// removed stays behind as an orphan for the next `reconcile`.
    fn discard_image(&self, image: &str) -> bool {
        match remove_image(&self.images_dir.join(image)) {
            Ok(()) => true,
            Err(err) => {
                log::warn!("access log: orphan image left behind: {:#}", err);
                false
            }
        }
    }

    fn prune_locked(&self, conn: &mut Connection) -> Result<()> {
        let tx = conn.transaction()?;
        let stale = {
            let mut stmt = tx.prepare(
                "SELECT id, image FROM access_log ORDER BY seq DESC LIMIT -1 OFFSET ?1",
            )?;
            let rows = stmt.query_map(params![self.max_entries as i64], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        if stale.is_empty() {
            return Ok(());
        }
        for (id, _) in &stale {
            tx.execute("DELETE FROM access_log WHERE id = ?1", params![id])?;
        }
        tx.commit()?;
        for (_, image) in &stale {
            self.discard_image(image);
        }
        log::debug!("access log: pruned {} entries beyond retention", stale.len());
        Ok(())
    }
}

fn entry_from_row(row: &rusqlite::Row<'_>) -> Result<AccessLogEntry> {
    let labels_json: String = row.get(2)?;
    let count: i64 = row.get(3)?;
    Ok(AccessLogEntry {
        id: row.get(0)?,
        timestamp: row.get(1)?,
        labels: serde_json::from_str(&labels_json).context("decode labels")?,
        count: usize::try_from(count).map_err(|_| anyhow!("negative count {}", count))?,
        image: row.get(4)?,
    })
}

/// Write via a temporary name so a crash never leaves a truncated image.
fn write_image(path: &Path, jpeg: &[u8]) -> Result<()> {
    let tmp = path.with_extension("jpg.tmp");
    std::fs::write(&tmp, jpeg).with_context(|| format!("write snapshot {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("store snapshot {}", path.display()))?;
    Ok(())
}

fn remove_image(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(anyhow::Error::new(err).context(format!("remove {}", path.display()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_log::{image_file_name, new_entry_id};
    use tempfile::TempDir;

    fn open_store(dir: &TempDir, max_entries: usize) -> AccessLogStore {
        let db = dir.path().join("log.db");
        AccessLogStore::open(&db.to_string_lossy(), dir.path().join("images"), max_entries)
            .unwrap()
    }

    fn entry(label: &str) -> AccessLogEntry {
        let id = new_entry_id();
        AccessLogEntry {
            image: image_file_name(&id),
            id,
            timestamp: "2024-05-01T12:00:00+00:00".to_string(),
            labels: vec![label.to_string()],
            count: 1,
        }
    }

    #[test]
    fn list_is_newest_first_and_limited() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 100);
        let first = entry("person");
        let second = entry("face");
        store.insert(&first, b"one").unwrap();
        store.insert(&second, b"two").unwrap();

        let all = store.list(100).unwrap();
        assert_eq!(all, vec![second.clone(), first]);
        assert_eq!(store.list(1).unwrap(), vec![second]);
    }

    #[test]
    fn retention_cap_drops_oldest_with_image() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 2);
        let entries: Vec<_> = (0..3).map(|_| entry("person")).collect();
        for e in &entries {
            store.insert(e, b"jpeg").unwrap();
        }
        assert_eq!(store.len().unwrap(), 2);
        assert!(!store.images_dir().join(&entries[0].image).exists());
        assert!(store.images_dir().join(&entries[2].image).exists());
    }

    #[test]
    fn corrupt_rows_are_skipped_on_read() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 100);
        let good = entry("person");
        store.insert(&good, b"jpeg").unwrap();
        store
            .lock()
            .unwrap()
            .execute(
                "INSERT INTO access_log(id, created_at, timestamp, labels_json, count, image) VALUES ('x', 0, 't', 'not json', 1, 'x.jpg')",
                [],
            )
            .unwrap();
        assert_eq!(store.list(10).unwrap(), vec![good]);
    }

    #[test]
    fn invalid_ids_are_not_found() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 100);
        assert!(!store.delete("../log.db").unwrap());
        assert!(store.image_path("../log.db").unwrap().is_none());
        assert!(dir.path().join("log.db").exists());
    }

    /// A directory squatting on the image name cannot be removed with
    /// `remove_file`, standing in for any undeletable snapshot.
    fn make_unremovable(store: &AccessLogStore, e: &AccessLogEntry) -> PathBuf {
        let path = store.images_dir().join(&e.image);
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("keep"), b"x").unwrap();
        path
    }

    #[test]
    fn clear_never_leaves_entries_without_images() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 100);
        let a = entry("person");
        let b = entry("face");
        store.insert(&a, b"one").unwrap();
        store.insert(&b, b"two").unwrap();
        let stuck = make_unremovable(&store, &b);

        assert_eq!(store.clear().unwrap(), 2);
        assert!(store.is_empty().unwrap());
        assert!(!store.images_dir().join(&a.image).exists());
        assert!(stuck.exists());
    }

    #[test]
    fn delete_commits_even_when_image_removal_fails() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 100);
        let a = entry("person");
        store.insert(&a, b"one").unwrap();
        make_unremovable(&store, &a);

        assert!(store.delete(&a.id).unwrap());
        assert!(store.get(&a.id).unwrap().is_none());
        assert!(!store.delete(&a.id).unwrap());
    }

    #[test]
    fn prune_drops_row_when_image_is_stuck() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 1);
        let old = entry("person");
        store.insert(&old, b"one").unwrap();
        make_unremovable(&store, &old);
        let new = entry("person");
        store.insert(&new, b"two").unwrap();

        assert_eq!(store.list(10).unwrap(), vec![new.clone()]);
        for e in store.list(10).unwrap() {
            assert!(store.images_dir().join(&e.image).is_file());
        }
    }

    #[test]
    fn reconcile_removes_orphans_and_dangling_entries() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 100);
        let kept = entry("person");
        let dangling = entry("person");
        store.insert(&kept, b"jpeg").unwrap();
        store.insert(&dangling, b"jpeg").unwrap();
        std::fs::remove_file(store.images_dir().join(&dangling.image)).unwrap();
        let orphan = store.images_dir().join(image_file_name(&new_entry_id()));
        std::fs::write(&orphan, b"stray").unwrap();

        let report = store.reconcile().unwrap();
        assert_eq!(
            report,
            ReconcileReport {
                orphan_images: 1,
                dangling_entries: 1
            }
        );
        assert!(!orphan.exists());
        assert_eq!(store.list(10).unwrap(), vec![kept]);
    }
}

//! SQLite-backed media library index for Lightbox.
//!
//! One database per library, holding a row for every image, video, and
//! folder under the library root. The scanner walks the filesystem, detects
//! additions, changes, and removals against the stored rows, and bumps the
//! `updated_at` stamp of every ancestor folder of a change so incremental
//! generation can find folders whose composites went stale.
//!
//! Uses WAL mode so the thumbnail engine can read while a scan writes.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{debug, info, instrument, warn};

use thumbnail_engine::{IndexError, MediaFile, MediaIndex, MediaKind};

/// Key under which the engine's last completed run start is stored.
const LAST_RUN_KEY: &str = "last_generation_run";

/// Outcome of one library scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub files: u64,
    pub folders: u64,
    pub removed: u64,
}

/// Library index handle. Queries are short and run under a connection
/// mutex; the scanner batches its writes in one transaction.
pub struct SqliteIndex {
    conn: Mutex<Connection>,
}

struct ExistingRow {
    kind: String,
    mtime_us: i64,
    size: i64,
    updated_at_us: i64,
}

struct FileSeen {
    rel: String,
    name: String,
    kind: MediaKind,
    mtime_us: i64,
    size: i64,
}

struct FolderSeen {
    rel: String,
    name: String,
}

#[derive(Default)]
struct WalkState {
    files: Vec<FileSeen>,
    folders: Vec<FolderSeen>,
}

impl SqliteIndex {
    /// Open or create an index database. Creates the parent directory if
    /// needed.
    pub fn open(db_path: &Path) -> Result<SqliteIndex> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating index dir {}", parent.display()))?;
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("opening index database {}", db_path.display()))?;

        // WAL mode for concurrent read/write
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA synchronous=NORMAL;")?;

        let index = SqliteIndex {
            conn: Mutex::new(conn),
        };
        index.create_tables()?;
        Ok(index)
    }

    // -- Schema --

    fn create_tables(&self) -> Result<()> {
        self.conn.lock().execute_batch(
            "
            CREATE TABLE IF NOT EXISTS media_files (
                path TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                parent TEXT NOT NULL DEFAULT '',
                kind TEXT NOT NULL,
                mtime_us INTEGER NOT NULL DEFAULT 0,
                size INTEGER NOT NULL DEFAULT 0,
                updated_at_us INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS engine_meta (
                key TEXT PRIMARY KEY,
                value TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_media_parent ON media_files(parent);
            CREATE INDEX IF NOT EXISTS idx_media_kind ON media_files(kind);
            CREATE INDEX IF NOT EXISTS idx_media_updated ON media_files(updated_at_us);
            ",
        )?;
        Ok(())
    }

    // -- Metadata --

    pub fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO engine_meta (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let result = self
            .conn
            .lock()
            .query_row(
                "SELECT value FROM engine_meta WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(result)
    }

    /// Total indexed rows, any kind.
    pub fn count(&self) -> Result<u64> {
        let n: i64 = self
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM media_files", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    // -- Scanning --

    /// Walk the library and converge the index on what is actually on disk.
    /// A file counts as changed when its mtime or size moved; changes and
    /// removals stamp every ancestor folder so composite previews refresh.
    #[instrument(skip(self))]
    pub fn scan_library(&self, root: &Path) -> Result<ScanSummary> {
        let mut state = WalkState::default();
        walk_dir(root, "", &mut state)
            .with_context(|| format!("walking library root {}", root.display()))?;

        let existing = self.load_rows()?;
        let now_us = Utc::now().timestamp_micros();

        let seen: HashSet<&str> = state
            .files
            .iter()
            .map(|f| f.rel.as_str())
            .chain(state.folders.iter().map(|f| f.rel.as_str()))
            .collect();
        let removed: Vec<String> = existing
            .keys()
            .filter(|path| !seen.contains(path.as_str()))
            .cloned()
            .collect();

        // Ancestor folders of any change get this scan's stamp.
        let mut bumped: HashSet<String> = HashSet::new();
        for rel in &removed {
            bump_ancestors(rel, &mut bumped);
        }

        let mut file_rows = Vec::with_capacity(state.files.len());
        for file in &state.files {
            let kind_str = file.kind.to_string();
            let changed = match existing.get(&file.rel) {
                Some(row) => {
                    row.mtime_us != file.mtime_us
                        || row.size != file.size
                        || row.kind != kind_str
                }
                None => true,
            };
            if changed {
                bump_ancestors(&file.rel, &mut bumped);
            }
            let updated_at_us = if changed {
                now_us
            } else {
                existing[&file.rel].updated_at_us
            };
            file_rows.push((file, kind_str, updated_at_us));
        }

        let tx_summary = {
            let conn = self.conn.lock();
            let tx = conn.unchecked_transaction()?;
            for (file, kind_str, updated_at_us) in &file_rows {
                conn.execute(
                    "INSERT OR REPLACE INTO media_files
                     (path, name, parent, kind, mtime_us, size, updated_at_us)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        file.rel,
                        file.name,
                        parent_rel(&file.rel),
                        kind_str,
                        file.mtime_us,
                        file.size,
                        updated_at_us,
                    ],
                )?;
            }
            for folder in &state.folders {
                let updated_at_us = if bumped.contains(&folder.rel) {
                    now_us
                } else {
                    match existing.get(&folder.rel) {
                        Some(row) => row.updated_at_us,
                        None => now_us,
                    }
                };
                conn.execute(
                    "INSERT OR REPLACE INTO media_files
                     (path, name, parent, kind, mtime_us, size, updated_at_us)
                     VALUES (?1, ?2, ?3, 'folder', 0, 0, ?4)",
                    params![folder.rel, folder.name, parent_rel(&folder.rel), updated_at_us],
                )?;
            }
            for rel in &removed {
                conn.execute("DELETE FROM media_files WHERE path = ?1", params![rel])?;
            }
            tx.commit()?;
            ScanSummary {
                files: state.files.len() as u64,
                folders: state.folders.len() as u64,
                removed: removed.len() as u64,
            }
        };

        info!(
            "library scan: {} files, {} folders, {} removed",
            tx_summary.files, tx_summary.folders, tx_summary.removed
        );
        Ok(tx_summary)
    }

    fn load_rows(&self) -> Result<HashMap<String, ExistingRow>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT path, kind, mtime_us, size, updated_at_us FROM media_files")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                ExistingRow {
                    kind: row.get(1)?,
                    mtime_us: row.get(2)?,
                    size: row.get(3)?,
                    updated_at_us: row.get(4)?,
                },
            ))
        })?;
        let mut map = HashMap::new();
        for row in rows {
            let (path, existing) = row?;
            map.insert(path, existing);
        }
        Ok(map)
    }

    fn query_files(
        &self,
        sql: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<MediaFile>, IndexError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql).map_err(index_err)?;
        let rows = stmt
            .query_map(args, |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(index_err)?;
        let mut files = Vec::new();
        for row in rows {
            let (path, name, kind) = row.map_err(index_err)?;
            files.push(MediaFile {
                rel_path: path,
                name,
                kind: kind.parse()?,
            });
        }
        Ok(files)
    }
}

#[async_trait]
impl MediaIndex for SqliteIndex {
    async fn files_in_folder(
        &self,
        folder: &str,
        limit: usize,
    ) -> Result<Vec<MediaFile>, IndexError> {
        self.query_files(
            "SELECT path, name, kind FROM media_files
             WHERE parent = ?1 AND kind IN ('image', 'video')
             ORDER BY CASE kind WHEN 'image' THEN 0 ELSE 1 END, path
             LIMIT ?2",
            &[&folder, &(limit as i64)],
        )
    }

    async fn subfolders(&self, folder: &str) -> Result<Vec<MediaFile>, IndexError> {
        self.query_files(
            "SELECT path, name, kind FROM media_files
             WHERE parent = ?1 AND kind = 'folder'
             ORDER BY path",
            &[&folder],
        )
    }

    async fn files_updated_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<MediaFile>, IndexError> {
        self.query_files(
            "SELECT path, name, kind FROM media_files
             WHERE kind IN ('image', 'video') AND updated_at_us > ?1
             ORDER BY path",
            &[&since.timestamp_micros()],
        )
    }

    async fn folders_updated_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<MediaFile>, IndexError> {
        self.query_files(
            "SELECT path, name, kind FROM media_files
             WHERE kind = 'folder' AND updated_at_us > ?1
             ORDER BY path",
            &[&since.timestamp_micros()],
        )
    }

    async fn files_needing_thumbnails(&self) -> Result<Vec<MediaFile>, IndexError> {
        // Folders come last so their composites sample freshly generated
        // children.
        self.query_files(
            "SELECT path, name, kind FROM media_files
             WHERE kind IN ('image', 'video', 'folder')
             ORDER BY CASE kind WHEN 'folder' THEN 1 ELSE 0 END, path",
            &[],
        )
    }

    async fn all_paths(&self) -> Result<Vec<String>, IndexError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT path FROM media_files")
            .map_err(index_err)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(index_err)?;
        let mut paths = Vec::new();
        for row in rows {
            paths.push(row.map_err(index_err)?);
        }
        Ok(paths)
    }

    async fn last_run(&self) -> Result<Option<DateTime<Utc>>, IndexError> {
        let value = self
            .get_meta(LAST_RUN_KEY)
            .map_err(|e| IndexError::new(e.to_string()))?;
        match value {
            Some(text) => {
                let micros: i64 = text
                    .parse()
                    .map_err(|_| IndexError::new(format!("bad run marker: {text}")))?;
                Ok(DateTime::from_timestamp_micros(micros))
            }
            None => Ok(None),
        }
    }

    async fn set_last_run(&self, at: DateTime<Utc>) -> Result<(), IndexError> {
        self.set_meta(LAST_RUN_KEY, &at.timestamp_micros().to_string())
            .map_err(|e| IndexError::new(e.to_string()))
    }
}

fn index_err(e: rusqlite::Error) -> IndexError {
    IndexError::new(e.to_string())
}

/// Containing folder of a relative path, `""` for top-level entries.
fn parent_rel(rel: &str) -> &str {
    match rel.rsplit_once('/') {
        Some((parent, _)) => parent,
        None => "",
    }
}

fn bump_ancestors(rel: &str, bumped: &mut HashSet<String>) {
    let mut current = parent_rel(rel);
    while !current.is_empty() {
        bumped.insert(current.to_string());
        current = parent_rel(current);
    }
}

/// Collect media files and folders under `dir`. Hidden entries, symlinks,
/// and unclassifiable files are skipped; entry order is sorted for
/// deterministic scans.
fn walk_dir(dir: &Path, rel: &str, state: &mut WalkState) -> Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)?.collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = match entry.file_name().into_string() {
            Ok(name) => name,
            Err(raw) => {
                warn!("skipping non-UTF8 name {:?} in {}", raw, dir.display());
                continue;
            }
        };
        if name.starts_with('.') {
            continue;
        }
        let child_rel = if rel.is_empty() {
            name.clone()
        } else {
            format!("{rel}/{name}")
        };
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            state.folders.push(FolderSeen {
                rel: child_rel.clone(),
                name,
            });
            walk_dir(&entry.path(), &child_rel, state)?;
        } else if file_type.is_file() {
            let kind = MediaKind::from_path(Path::new(&name));
            if kind == MediaKind::Other {
                debug!("ignoring {child_rel}");
                continue;
            }
            let meta = entry.metadata()?;
            let mtime_us = meta
                .modified()
                .map(|t| DateTime::<Utc>::from(t).timestamp_micros())
                .unwrap_or(0);
            state.files.push(FileSeen {
                rel: child_rel,
                name,
                kind,
                mtime_us,
                size: meta.len() as i64,
            });
        }
    }
    Ok(())
}

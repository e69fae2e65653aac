use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum DbError {
    #[error("failed to read database {path}: {source}")]
    Read {
        path: PathBuf,
        source: io::Error,
    },
    #[error("malformed database {path}: {detail}")]
    Malformed { path: PathBuf, detail: String },
    #[error("failed to write database {path}: {source}")]
    Write {
        path: PathBuf,
        source: io::Error,
    },
}

/// One remembered file: mtime in unix seconds, byte size, and the cached
/// content checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbEntry {
    pub mtime: i64,
    pub size: u64,
    pub checksum: u64,
}

/// The persisted state of one-shot mode: every fingerprinted file keyed by
/// its working-directory-relative path, plus the canonical command line.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct FileDb {
    pub files: BTreeMap<PathBuf, DbEntry>,
    pub cmd: Vec<String>,
}

/// On-disk shape. All numeric members are encoded as strings:
/// `{"files":[{"p":...,"t":...,"s":...,"c":...}],"cmd":[...]}`.
#[derive(Debug, Serialize, Deserialize)]
struct FileRecord {
    p: String,
    t: String,
    s: String,
    c: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Document {
    files: Vec<FileRecord>,
    cmd: Vec<String>,
}

impl FileDb {
    pub fn new(cmd: Vec<String>) -> Self {
        Self {
            files: BTreeMap::new(),
            cmd,
        }
    }

    /// Load the database at `path`. An absent file is a normal first run;
    /// a malformed file is reported and treated as empty. Neither aborts
    /// the invocation.
    pub fn load(path: &Path) -> FileDb {
        match Self::try_load(path) {
            Ok(db) => db,
            Err(DbError::Read { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                debug!("no database at {}; starting empty", path.display());
                FileDb::default()
            }
            Err(err) => {
                warn!("{err}; treating database as empty");
                FileDb::default()
            }
        }
    }

    pub fn try_load(path: &Path) -> Result<FileDb, DbError> {
        let content = fs::read_to_string(path).map_err(|source| DbError::Read {
            path: path.to_owned(),
            source,
        })?;
        let document: Document =
            serde_json::from_str(&content).map_err(|err| DbError::Malformed {
                path: path.to_owned(),
                detail: err.to_string(),
            })?;

        let mut files = BTreeMap::new();
        for record in document.files {
            let entry = DbEntry {
                mtime: parse_number(path, "t", &record.t)?,
                size: parse_number(path, "s", &record.s)?,
                checksum: parse_number(path, "c", &record.c)?,
            };
            files.insert(PathBuf::from(record.p), entry);
        }
        Ok(FileDb {
            files,
            cmd: document.cmd,
        })
    }

    fn to_document(&self) -> Document {
        Document {
            files: self
                .files
                .iter()
                .map(|(path, entry)| FileRecord {
                    p: path.to_string_lossy().into_owned(),
                    t: entry.mtime.to_string(),
                    s: entry.size.to_string(),
                    c: entry.checksum.to_string(),
                })
                .collect(),
            cmd: self.cmd.clone(),
        }
    }

    /// Serialize into a temporary file next to `db_path`, so the later
    /// rename stays on one filesystem and the swap is atomic against
    /// concurrent invocations.
    pub fn write_temp(&self, db_path: &Path) -> Result<NamedTempFile, DbError> {
        let dir = db_path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let write_err = |source: io::Error| DbError::Write {
            path: db_path.to_owned(),
            source,
        };

        let mut temp = NamedTempFile::new_in(dir).map_err(write_err)?;
        serde_json::to_writer(&mut temp, &self.to_document())
            .map_err(|err| write_err(io::Error::other(err)))?;
        temp.flush().map_err(write_err)?;
        Ok(temp)
    }

    /// Atomically replace the database with the prepared temp file.
    pub fn commit(temp: NamedTempFile, db_path: &Path) -> Result<(), DbError> {
        temp.persist(db_path)
            .map(drop)
            .map_err(|err| DbError::Write {
                path: db_path.to_owned(),
                source: err.error,
            })
    }
}

fn parse_number<T: std::str::FromStr>(path: &Path, field: &str, raw: &str) -> Result<T, DbError> {
    raw.parse().map_err(|_| DbError::Malformed {
        path: path.to_owned(),
        detail: format!("field `{field}` is not numeric: `{raw}`"),
    })
}

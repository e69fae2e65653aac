use std::fs::{self, File};
use std::hash::Hasher;
use std::io::{self, Read};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use twox_hash::XxHash64;

const HASH_SEED: u64 = 0;
const READ_CHUNK: usize = 64 * 1024;

/// What we remember about a file between invocations: its mtime (whole
/// seconds), size, and a content checksum computed lazily on first use and
/// cached afterwards. A zero-length file has checksum `0` without any
/// read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub path: PathBuf,
    pub mtime: i64,
    pub size: u64,
    checksum: Option<u64>,
}

impl Fingerprint {
    pub fn of_file(path: &Path) -> io::Result<Self> {
        let metadata = fs::metadata(path)?;
        Ok(Self {
            path: path.to_owned(),
            mtime: metadata.mtime(),
            size: metadata.len(),
            checksum: None,
        })
    }

    pub fn checksum(&mut self) -> io::Result<u64> {
        if let Some(checksum) = self.checksum {
            return Ok(checksum);
        }
        let checksum = if self.size == 0 {
            0
        } else {
            hash_file(&self.path)?
        };
        self.checksum = Some(checksum);
        Ok(checksum)
    }

    pub fn cached_checksum(&self) -> Option<u64> {
        self.checksum
    }
}

/// 64-bit non-cryptographic content hash, streamed in chunks.
pub fn hash_file(path: &Path) -> io::Result<u64> {
    let mut file = File::open(path)?;
    let mut hasher = XxHash64::with_seed(HASH_SEED);
    let mut buffer = [0u8; READ_CHUNK];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.write(&buffer[..read]);
    }
    Ok(hasher.finish())
}

pub fn hash_bytes(bytes: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(HASH_SEED);
    hasher.write(bytes);
    hasher.finish()
}

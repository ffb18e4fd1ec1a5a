//! SHA-256 content digests.
//!
//! The local digest is taken once, when a file is registered, and is the
//! reference every later remote verification compares against.

use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Lower-case hex SHA-256 digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checksum(pub String);

impl Checksum {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse a digest as printed by `sha256sum`; case-insensitive.
    pub fn parse_hex(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.len() != 64 || !raw.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        Some(Self(raw.to_ascii_lowercase()))
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for Checksum {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Checksum {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Stream a reader through SHA-256.
pub fn hash_reader<R: Read>(mut reader: R) -> io::Result<Checksum> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(Checksum(hex::encode(hasher.finalize())))
}

/// Hash the file at `path`.
pub fn hash_file(path: &Path) -> io::Result<Checksum> {
    let file = File::open(path)?;
    hash_reader(BufReader::new(file))
}

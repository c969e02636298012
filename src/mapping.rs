//! Mapping of peer identities to local accounts.
//!
//! # Examples
//!
//! ```rust
//! use gss_channel::{GridMap, IdentityMapper};
//!
//! let map = GridMap::parse(
//!     "# users\n\"/C=CH/O=Example Grid/CN=Jane Doe\" jdoe,grid001\n",
//! )
//! .unwrap();
//! assert_eq!(map.map("/C=CH/O=Example Grid/CN=Jane Doe").unwrap(), "jdoe");
//! ```

use std::fs;
use std::path::{Path, PathBuf};

/// Default location of the grid-mapfile.
pub const DEFAULT_GRIDMAP_PATH: &str = "/etc/grid-security/grid-mapfile";

/// Errors mapping a peer identity.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum MappingError {
    /// No local account is associated with the peer.
    #[error("could not get mapping for {0}")]
    NotFound(String),

    /// The mapping source could not be read.
    #[error("could not read mapping file {path}: {source}")]
    Read {
        /// Mapping file path.
        path: PathBuf,
        /// I/O error.
        source: std::io::Error,
    },

    /// A mapping file line is malformed.
    #[error("malformed mapping entry at line {line}: {reason}")]
    Parse {
        /// 1-based line number.
        line: usize,
        /// What is wrong with it.
        reason: &'static str,
    },
}

/// Maps a peer display name (DN) to a local account.
pub trait IdentityMapper: Send + Sync {
    /// Returns the local account for `peer`.
    fn map(&self, peer: &str) -> Result<String, MappingError>;
}

impl<F> IdentityMapper for F
where
    F: Fn(&str) -> Option<String> + Send + Sync,
{
    fn map(&self, peer: &str) -> Result<String, MappingError> {
        self(peer).ok_or_else(|| MappingError::NotFound(peer.to_owned()))
    }
}

/// A mapper that knows no account.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMapping;

impl IdentityMapper for NoMapping {
    fn map(&self, peer: &str) -> Result<String, MappingError> {
        Err(MappingError::NotFound(peer.to_owned()))
    }
}

/// A parsed grid-mapfile: `"<DN>" account[,account...]` per line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GridMap {
    entries: Vec<(String, Vec<String>)>,
}

impl GridMap {
    /// Parses grid-mapfile contents. Blank lines and `#` comments are skipped.
    pub fn parse(contents: &str) -> Result<Self, MappingError> {
        let mut entries = Vec::new();
        for (index, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let parse_error = |reason| MappingError::Parse {
                line: index + 1,
                reason,
            };

            let (dn, rest) = split_dn(line).ok_or_else(|| parse_error("unterminated quoted name"))?;
            let accounts: Vec<String> = rest
                .split(',')
                .map(str::trim)
                .filter(|account| !account.is_empty())
                .map(str::to_owned)
                .collect();
            if dn.is_empty() {
                return Err(parse_error("empty distinguished name"));
            }
            if accounts.is_empty() {
                return Err(parse_error("no local account"));
            }
            entries.push((dn, accounts));
        }
        Ok(Self { entries })
    }

    /// Reads and parses a grid-mapfile.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, MappingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| MappingError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents)
    }

    /// Returns the first account listed for `dn`.
    pub fn lookup(&self, dn: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(entry, _)| entry == dn)
            .and_then(|(_, accounts)| accounts.first())
            .map(String::as_str)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the map has no entry.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl IdentityMapper for GridMap {
    fn map(&self, peer: &str) -> Result<String, MappingError> {
        self.lookup(peer)
            .map(str::to_owned)
            .ok_or_else(|| MappingError::NotFound(peer.to_owned()))
    }
}

/// A grid-mapfile re-read on every lookup, so edits apply to the next connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridMapFile {
    path: PathBuf,
}

impl GridMapFile {
    /// Uses the grid-mapfile at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Default for GridMapFile {
    fn default() -> Self {
        Self::new(DEFAULT_GRIDMAP_PATH)
    }
}

impl IdentityMapper for GridMapFile {
    fn map(&self, peer: &str) -> Result<String, MappingError> {
        GridMap::load(&self.path)?.map(peer)
    }
}

/// Splits a line into its DN (quotes and escapes removed) and the remainder.
fn split_dn(line: &str) -> Option<(String, &str)> {
    let Some(quoted) = line.strip_prefix('"') else {
        let end = line.find(char::is_whitespace).unwrap_or(line.len());
        return Some((line[..end].to_owned(), &line[end..]));
    };

    let mut dn = String::new();
    let mut chars = quoted.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '\\' => dn.push(chars.next()?.1),
            '"' => return Some((dn, &quoted[i + 1..])),
            _ => dn.push(c),
        }
    }
    None
}

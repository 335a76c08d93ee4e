//! Galera cluster state derived from the restore tool's metadata.
//!
//! `xtrabackup_galera_info` holds a single line `<uuid>:<seqno>` (newer
//! tools emit `<uuid>:<n>:<seqno>`). The uuid is everything before the
//! first colon and the sequence marker everything after the last one.

use std::fmt;

/// Metadata file written by the restore tool, directly under the data dir.
pub const GALERA_INFO_FILE: &str = "xtrabackup_galera_info";

/// State file read by the engine at startup.
pub const GRASTATE_FILE: &str = "grastate.dat";

const GRASTATE_VERSION: &str = "2.1";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed galera metadata: {0:?}")]
pub struct MalformedMetadata(pub String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GaleraState {
    pub uuid: String,
    pub seqno: i64,
    pub safe_to_bootstrap: bool,
}

impl GaleraState {
    /// Parse the restore tool's metadata line.
    ///
    /// An unparsable sequence marker is kept as `-1`; it is discarded by
    /// [`GaleraState::for_validation`] anyway.
    pub fn from_metadata(content: &str) -> Result<Self, MalformedMetadata> {
        let line = content.trim();
        let (uuid, rest) = line
            .split_once(':')
            .ok_or_else(|| MalformedMetadata(line.to_string()))?;
        let uuid = uuid.trim();
        if uuid.is_empty() {
            return Err(MalformedMetadata(line.to_string()));
        }
        let marker = rest.rsplit(':').next().unwrap_or(rest).trim();
        Ok(Self {
            uuid: uuid.to_string(),
            seqno: marker.parse().unwrap_or(-1),
            safe_to_bootstrap: false,
        })
    }

    /// A validation restore is never a live rejoin: the sequence number is
    /// reset and bootstrap forced on.
    pub fn for_validation(self) -> Self {
        Self {
            seqno: -1,
            safe_to_bootstrap: true,
            ..self
        }
    }

    /// Serialize as `grastate.dat` content.
    pub fn render(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for GaleraState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "# GALERA saved state")?;
        writeln!(f, "version: {GRASTATE_VERSION}")?;
        writeln!(f, "uuid: {}", self.uuid)?;
        writeln!(f, "seqno: {}", self.seqno)?;
        writeln!(f, "safe_to_bootstrap: {}", u8::from(self.safe_to_bootstrap))
    }
}

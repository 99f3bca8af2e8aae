//! Hash-chained audit log
//!
//! Each committed event becomes one JSON line. Every line carries the SHA-256
//! of its own content plus the previous line's hash, so any edit or deletion
//! in the middle of the file breaks the chain and is caught by [`HashChainAuditLog::verify`].

use crate::collaborators::{AuditEntry, AuditSink, CollaboratorError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// One line of the audit file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainedEntry {
    /// Audit payload
    pub entry: AuditEntry,
    /// Hash of the previous line ("" for the first)
    pub previous_hash: String,
    /// Hash of this line
    pub hash: String,
}

impl ChainedEntry {
    fn seal(entry: AuditEntry, previous_hash: String) -> Result<Self, CollaboratorError> {
        let hash = Self::compute_hash(&entry, &previous_hash)?;
        Ok(Self {
            entry,
            previous_hash,
            hash,
        })
    }

    fn compute_hash(entry: &AuditEntry, previous_hash: &str) -> Result<String, CollaboratorError> {
        let mut hasher = Sha256::new();
        hasher.update(previous_hash.as_bytes());
        hasher.update(serde_json::to_string(entry)?.as_bytes());
        Ok(hex::encode(hasher.finalize()))
    }

    /// Hash matches content
    pub fn verify_hash(&self) -> bool {
        Self::compute_hash(&self.entry, &self.previous_hash)
            .map(|hash| hash == self.hash)
            .unwrap_or(false)
    }
}

struct LogState {
    file: File,
    last_hash: String,
}

/// Append-only JSONL audit file with a hash chain
pub struct HashChainAuditLog {
    path: PathBuf,
    state: Mutex<LogState>,
}

impl std::fmt::Debug for HashChainAuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashChainAuditLog").field("path", &self.path).finish()
    }
}

impl HashChainAuditLog {
    /// Open (or create) the log and resume the chain from its last line
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CollaboratorError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let last_hash = Self::last_hash(&path)?;
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            path,
            state: Mutex::new(LogState { file, last_hash }),
        })
    }

    fn last_hash(path: &Path) -> Result<String, CollaboratorError> {
        if !path.exists() {
            return Ok(String::new());
        }

        let reader = BufReader::new(File::open(path)?);
        match reader.lines().last() {
            Some(line) => {
                let entry: ChainedEntry = serde_json::from_str(&line?)?;
                Ok(entry.hash)
            }
            None => Ok(String::new()),
        }
    }

    /// Walk the file and check every hash and link; returns the entry count
    pub fn verify(&self) -> Result<usize, CollaboratorError> {
        let reader = BufReader::new(File::open(&self.path)?);
        let mut previous_hash = String::new();
        let mut count = 0;

        for (i, line) in reader.lines().enumerate() {
            let entry: ChainedEntry = serde_json::from_str(&line?)?;

            if !entry.verify_hash() {
                return Err(CollaboratorError::Rejected(format!(
                    "Audit hash mismatch at line {}",
                    i + 1
                )));
            }
            if entry.previous_hash != previous_hash {
                return Err(CollaboratorError::Rejected(format!(
                    "Audit chain broken at line {}",
                    i + 1
                )));
            }

            previous_hash = entry.hash;
            count += 1;
        }

        Ok(count)
    }
}

impl AuditSink for HashChainAuditLog {
    fn append(&self, entry: &AuditEntry) -> Result<(), CollaboratorError> {
        let mut state = self.state.lock();

        let chained = ChainedEntry::seal(entry.clone(), state.last_hash.clone())?;
        let mut line = serde_json::to_string(&chained)?;
        line.push('\n');

        state.file.write_all(line.as_bytes())?;
        state.file.flush()?;
        state.last_hash = chained.hash;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EngineEvent;
    use chrono::Utc;
    use uuid::Uuid;

    fn entry() -> AuditEntry {
        AuditEntry {
            service: "credit-engine".to_string(),
            action: "group_terminated".to_string(),
            recorded_at: Utc::now(),
            event: EngineEvent::GroupTerminated {
                group_id: Uuid::new_v4(),
                at: Utc::now(),
            },
        }
    }

    #[test]
    fn test_chain_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let log = HashChainAuditLog::open(dir.path().join("audit.jsonl")).unwrap();
        for _ in 0..3 {
            log.append(&entry()).unwrap();
        }
        assert_eq!(log.verify().unwrap(), 3);
    }

    #[test]
    fn test_chain_resumes_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        {
            let log = HashChainAuditLog::open(&path).unwrap();
            log.append(&entry()).unwrap();
        }
        let log = HashChainAuditLog::open(&path).unwrap();
        log.append(&entry()).unwrap();
        assert_eq!(log.verify().unwrap(), 2);
    }

    #[test]
    fn test_tampering_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = HashChainAuditLog::open(&path).unwrap();
        log.append(&entry()).unwrap();
        log.append(&entry()).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let tampered = content.replacen("group_terminated", "credit_issued", 1);
        std::fs::write(&path, tampered).unwrap();

        assert!(log.verify().is_err());
    }
}

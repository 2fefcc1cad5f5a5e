use std::{
    fs::{OpenOptions, create_dir_all, rename},
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
};

use schema::{AttendanceEvent, Branch, DeadLetteredEvent, Employee, QuarantinedEvent, SyncStatus};
use serde::{Deserialize, Serialize};

use crate::StoreError;

const SNAPSHOT_HEADER: &str = "PUNCHHUB-SNAP\t1";

/// One durable state transition. Rows are logged in their post-mutation
/// shape so replay is a plain overwrite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub(crate) enum PersistedRecord {
    Branch(Branch),
    Event(AttendanceEvent),
    Employee(Employee),
    SyncStatus(SyncStatus),
    Queued(QuarantinedEvent),
    Dequeued { queue_id: u64 },
    DeadLettered(DeadLetteredEvent),
    QueueSequence { next_queue_id: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalCheckpointStats {
    pub snapshot_records: usize,
    pub truncated_wal_records: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CheckpointPolicy {
    pub max_wal_records: Option<usize>,
    pub max_wal_bytes: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WalReplayStats {
    pub snapshot_records: usize,
    pub wal_records: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalWritePolicy {
    pub sync_every_records: usize,
}

impl Default for WalWritePolicy {
    fn default() -> Self {
        Self {
            sync_every_records: 1,
        }
    }
}

pub struct FileWal {
    path: PathBuf,
    wal_records: usize,
    sync_every_records: usize,
    unsynced_records: usize,
}

impl FileWal {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with_policy(path, WalWritePolicy::default())
    }

    pub fn open_with_policy(
        path: impl AsRef<Path>,
        policy: WalWritePolicy,
    ) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            create_dir_all(parent)?;
        }
        OpenOptions::new().create(true).append(true).open(&path)?;
        let wal_records = count_non_empty_lines(&path)?;
        Ok(Self {
            path,
            wal_records,
            sync_every_records: policy.sync_every_records.max(1),
            unsynced_records: 0,
        })
    }

    pub fn snapshot_path(&self) -> PathBuf {
        let mut path = self.path.clone().into_os_string();
        path.push(".snapshot");
        PathBuf::from(path)
    }

    pub fn wal_size_bytes(&self) -> Result<u64, StoreError> {
        Ok(std::fs::metadata(&self.path)?.len())
    }

    pub(crate) fn append_record(&mut self, record: &PersistedRecord) -> Result<(), StoreError> {
        let line = record_to_line(record)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")?;
        self.wal_records += 1;
        self.unsynced_records += 1;
        if self.unsynced_records >= self.sync_every_records {
            file.sync_data()?;
            self.unsynced_records = 0;
        }
        Ok(())
    }

    fn flush_pending_sync(&mut self) -> Result<(), StoreError> {
        if self.unsynced_records == 0 {
            return Ok(());
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.sync_data()?;
        self.unsynced_records = 0;
        Ok(())
    }

    pub(crate) fn should_checkpoint(&self, policy: &CheckpointPolicy) -> Result<bool, StoreError> {
        if let Some(max_wal_records) = policy.max_wal_records
            && max_wal_records > 0
            && self.wal_records >= max_wal_records
        {
            return Ok(true);
        }
        if let Some(max_wal_bytes) = policy.max_wal_bytes
            && max_wal_bytes > 0
            && self.wal_size_bytes()? >= max_wal_bytes
        {
            return Ok(true);
        }
        Ok(false)
    }

    pub(crate) fn replay_records_with_stats(
        &self,
    ) -> Result<(Vec<PersistedRecord>, WalReplayStats), StoreError> {
        let snapshot_records = self.replay_snapshot_records()?;
        let wal_records = read_record_lines(&self.path)?;
        let stats = WalReplayStats {
            snapshot_records: snapshot_records.len(),
            wal_records: wal_records.len(),
        };
        let mut out = snapshot_records;
        out.extend(wal_records);
        Ok((out, stats))
    }

    fn replay_snapshot_records(&self) -> Result<Vec<PersistedRecord>, StoreError> {
        let snapshot_path = self.snapshot_path();
        if !snapshot_path.exists() {
            return Ok(Vec::new());
        }
        let file = OpenOptions::new().read(true).open(&snapshot_path)?;
        let mut lines = BufReader::new(file).lines();
        let header = loop {
            match lines.next() {
                Some(line) => {
                    let line = line?;
                    if line.trim().is_empty() {
                        continue;
                    }
                    break line;
                }
                None => return Err(StoreError::Parse("snapshot file is empty".to_string())),
            }
        };
        if header != SNAPSHOT_HEADER {
            return Err(StoreError::Parse(
                "snapshot file has invalid header".to_string(),
            ));
        }
        let mut out = Vec::new();
        for line in lines {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            out.push(line_to_record(&line)?);
        }
        Ok(out)
    }

    fn write_snapshot_records(&self, records: &[PersistedRecord]) -> Result<(), StoreError> {
        let snapshot_path = self.snapshot_path();
        let mut tmp_path = snapshot_path.clone().into_os_string();
        tmp_path.push(".tmp");
        let tmp_path = PathBuf::from(tmp_path);

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        writeln!(file, "{SNAPSHOT_HEADER}")?;
        for record in records {
            writeln!(file, "{}", record_to_line(record)?)?;
        }
        file.sync_all()?;
        rename(tmp_path, snapshot_path)?;
        Ok(())
    }

    fn truncate_wal(&mut self) -> Result<(), StoreError> {
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        self.wal_records = 0;
        self.unsynced_records = 0;
        Ok(())
    }

    pub(crate) fn compact_with_snapshot(
        &mut self,
        snapshot_records: &[PersistedRecord],
    ) -> Result<WalCheckpointStats, StoreError> {
        let truncated_wal_records = self.wal_records;
        self.flush_pending_sync()?;
        self.write_snapshot_records(snapshot_records)?;
        self.truncate_wal()?;
        Ok(WalCheckpointStats {
            snapshot_records: snapshot_records.len(),
            truncated_wal_records,
        })
    }
}

impl Drop for FileWal {
    fn drop(&mut self) {
        let _ = self.flush_pending_sync();
    }
}

fn record_to_line(record: &PersistedRecord) -> Result<String, StoreError> {
    serde_json::to_string(record).map_err(|err| StoreError::Parse(err.to_string()))
}

fn line_to_record(line: &str) -> Result<PersistedRecord, StoreError> {
    serde_json::from_str(line).map_err(|err| StoreError::Parse(format!("bad WAL line: {err}")))
}

fn read_record_lines(path: &Path) -> Result<Vec<PersistedRecord>, StoreError> {
    let file = OpenOptions::new().read(true).open(path)?;
    let mut out = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        out.push(line_to_record(&line)?);
    }
    Ok(out)
}

fn count_non_empty_lines(path: &Path) -> Result<usize, StoreError> {
    let file = OpenOptions::new().read(true).open(path)?;
    let mut count = 0usize;
    for line in BufReader::new(file).lines() {
        if !line?.trim().is_empty() {
            count += 1;
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wal_sync_every_records_clamps_to_minimum_one() {
        let dir = tempfile::tempdir().unwrap();
        let wal = FileWal::open_with_policy(
            dir.path().join("punchhub.wal"),
            WalWritePolicy {
                sync_every_records: 0,
            },
        )
        .unwrap();
        assert_eq!(wal.sync_every_records, 1);
        assert_eq!(wal.unsynced_records, 0);
    }
}

//! Snapshot codec
//!
//! A snapshot is a gzip stream of records, each one
//! `key-len:u64-LE, key, value-len:u64-LE, value`. There is no header, count or
//! checksum; the end of the stream ends the snapshot. Record order follows the
//! store's iteration order and carries no meaning.

use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use thiserror::Error;

use crate::resp;
use crate::state_machine::StateMachine;
use crate::store::{Item, LocalStore, StoreError};

/// Keys tagged with this byte are the ones the export utility turns into SET
/// commands; the marker is stripped on the way out.
pub const EXPORT_KEY_MARKER: u8 = b'k';

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot io error: {0}")]
    Io(#[from] io::Error),
    #[error("truncated snapshot record")]
    Truncated,
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The restored data is in place but the store could not be opened on it.
    #[error("store could not be reopened after restore: {0}")]
    Reopen(#[source] StoreError),
}

fn write_record<W: Write>(writer: &mut W, key: &[u8], value: &[u8]) -> io::Result<()> {
    writer.write_all(&(key.len() as u64).to_le_bytes())?;
    writer.write_all(key)?;
    writer.write_all(&(value.len() as u64).to_le_bytes())?;
    writer.write_all(value)
}

/// Iterates the records of a decompressed snapshot stream.
pub struct RecordReader<R: Read> {
    reader: R,
    done: bool,
}

impl<R: Read> RecordReader<R> {
    pub fn new(reader: R) -> Self {
        RecordReader {
            reader,
            done: false,
        }
    }

    /// Reads a length prefix. `None` means the stream ended cleanly before it.
    fn read_len(&mut self) -> Result<Option<u64>, SnapshotError> {
        let mut buf = [0u8; 8];
        let mut filled = 0;
        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        match filled {
            0 => Ok(None),
            8 => Ok(Some(u64::from_le_bytes(buf))),
            _ => Err(SnapshotError::Truncated),
        }
    }

    fn read_bytes(&mut self, len: u64) -> Result<Vec<u8>, SnapshotError> {
        // Grow as data arrives instead of trusting the prefix for the allocation.
        let mut buf = Vec::new();
        (&mut self.reader).take(len).read_to_end(&mut buf)?;
        if buf.len() as u64 != len {
            return Err(SnapshotError::Truncated);
        }
        Ok(buf)
    }

    fn read_record(&mut self) -> Result<Option<Item>, SnapshotError> {
        let Some(key_len) = self.read_len()? else {
            return Ok(None);
        };
        let key = self.read_bytes(key_len)?;
        let value_len = self.read_len()?.ok_or(SnapshotError::Truncated)?;
        let value = self.read_bytes(value_len)?;
        Ok(Some((key, value)))
    }
}

impl<R: Read> Iterator for RecordReader<R> {
    type Item = Result<Item, SnapshotError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let record = self.read_record().transpose();
        if !matches!(record, Some(Ok(_))) {
            self.done = true;
        }
        record
    }
}

/// Concatenated gzip members are one snapshot; every member is read.
fn decode<R: Read>(reader: R) -> RecordReader<BufReader<MultiGzDecoder<R>>> {
    RecordReader::new(BufReader::new(MultiGzDecoder::new(reader)))
}

fn sibling(dir: &Path, suffix: &str) -> PathBuf {
    let mut name = dir
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_else(|| "store".into());
    name.push(suffix);
    dir.with_file_name(name)
}

/// Moves `staging` into place at `dir`. On failure the previous contents of
/// `dir` are put back.
fn swap_dirs(dir: &Path, staging: &Path) -> io::Result<()> {
    let retired = sibling(dir, ".retired");
    if retired.exists() {
        fs::remove_dir_all(&retired)?;
    }
    fs::rename(dir, &retired)?;
    if let Err(e) = fs::rename(staging, dir) {
        fs::rename(&retired, dir)?;
        return Err(e);
    }
    if let Err(e) = fs::remove_dir_all(&retired) {
        log::warn!("failed to remove {}: {}", retired.display(), e);
    }
    Ok(())
}

impl<S: LocalStore> StateMachine<S> {
    /// Writes every key/value pair to `writer` as a compressed snapshot and
    /// returns the number of records written.
    ///
    /// Holds the shared lock for the whole scan: reads carry on, writes wait.
    pub fn snapshot<W: Write>(&self, writer: W) -> Result<u64, SnapshotError> {
        let slot = self.store.read().map_err(|_| StoreError::Poisoned)?;
        let store = slot.as_ref().ok_or(StoreError::Closed)?;

        let mut encoder = GzEncoder::new(writer, Compression::default());
        let mut records = 0u64;
        for item in store.items() {
            let (key, value) = item?;
            write_record(&mut encoder, &key, &value)?;
            records += 1;
        }
        encoder.finish()?.flush()?;

        log::debug!("snapshot: wrote {} records", records);
        Ok(records)
    }

    /// Replaces the whole key space with the contents of a snapshot and returns
    /// the number of records restored.
    ///
    /// Records are staged into a fresh store next to the live one, which is only
    /// swapped out once the snapshot decoded completely. A failed restore leaves
    /// the current data untouched.
    pub fn restore<R: Read>(&self, reader: R) -> Result<u64, SnapshotError> {
        let mut slot = self.store.write().map_err(|_| StoreError::Poisoned)?;
        if slot.is_none() {
            return Err(StoreError::Closed.into());
        }

        let staging = sibling(&self.dir, ".restore");
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        let records = match Self::stage(&staging, reader) {
            Ok(records) => records,
            Err(e) => {
                if let Err(cleanup) = fs::remove_dir_all(&staging) {
                    log::warn!("failed to remove {}: {}", staging.display(), cleanup);
                }
                return Err(e);
            }
        };

        if let Some(current) = slot.take() {
            if let Err(e) = current.close() {
                log::warn!("closing store before restore: {}", e);
            }
        }
        let swapped = swap_dirs(&self.dir, &staging);
        let reopened = S::open(&self.dir).map_err(|e| {
            log::error!("reopening store at {} after restore: {}", self.dir.display(), e);
            SnapshotError::Reopen(e)
        })?;
        *slot = Some(reopened);
        if let Err(e) = swapped {
            if let Err(cleanup) = fs::remove_dir_all(&staging) {
                log::warn!("failed to remove {}: {}", staging.display(), cleanup);
            }
            return Err(e.into());
        }

        log::info!("restore: loaded {} records into {}", records, self.dir.display());
        Ok(records)
    }

    fn stage<R: Read>(staging: &Path, reader: R) -> Result<u64, SnapshotError> {
        let mut store = S::open(staging)?;
        let mut records = 0u64;
        for record in decode(reader) {
            let (key, value) = record?;
            store.put(&key, &value)?;
            records += 1;
        }
        store.close()?;
        Ok(records)
    }
}

/// Reads the snapshot at `snapshot_path` and writes the SET commands that
/// rebuild it to `writer`. Returns the number of commands written.
pub fn write_commands_from_snapshot<W: Write, P: AsRef<Path>>(
    writer: W,
    snapshot_path: P,
) -> Result<u64, SnapshotError> {
    let file = File::open(snapshot_path)?;
    write_commands(writer, file)
}

/// Only records whose key starts with `EXPORT_KEY_MARKER` are exported, with
/// the marker stripped; everything else is skipped.
pub fn write_commands<W: Write, R: Read>(mut writer: W, reader: R) -> Result<u64, SnapshotError> {
    let mut cmd = Vec::new();
    let mut written = 0u64;
    for record in decode(reader) {
        let (key, value) = record?;
        let Some((&EXPORT_KEY_MARKER, key)) = key.split_first() else {
            continue;
        };
        cmd.clear();
        resp::encode_array(&[&b"SET"[..], key, &value[..]], &mut cmd);
        writer.write_all(&cmd)?;
        written += 1;
    }
    writer.flush()?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::applier::LocalApplier;
    use crate::command::Reply;
    use crate::state_machine::tests::{open, run, BrokenScanStore};
    use crate::store::FileStore;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;
    use std::thread;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn encode(records: &[(&[u8], &[u8])]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        for (key, value) in records {
            write_record(&mut encoder, key, value).unwrap();
        }
        encoder.finish().unwrap()
    }

    fn contents(sm: &StateMachine) -> BTreeMap<Vec<u8>, Vec<u8>> {
        sm.read(|store| store.items().collect::<Result<BTreeMap<_, _>, _>>())
            .unwrap()
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let applier = LocalApplier::new();
        let source_dir = TempDir::new().unwrap();
        let source = open(&source_dir);
        run(&source, &applier, &["SET", "key.1", "value.1"]);
        run(&source, &applier, &["SET", "cc.1", "value.2"]);
        run(&source, &applier, &["SET", "key.2", ""]);
        run(&source, &applier, &["SET", "gone", "x"]);
        run(&source, &applier, &["DEL", "gone"]);

        let mut snapshot = Vec::new();
        assert_eq!(source.snapshot(&mut snapshot).unwrap(), 3);

        let target_dir = TempDir::new().unwrap();
        let target = open(&target_dir);
        run(&target, &applier, &["SET", "stale", "entry"]);
        assert_eq!(target.restore(snapshot.as_slice()).unwrap(), 3);

        assert_eq!(contents(&target), contents(&source));
        assert_eq!(run(&target, &applier, &["GET", "stale"]), Reply::Null);
        assert_eq!(run(&target, &applier, &["GET", "cc.1"]), Reply::Bulk(b"value.2".to_vec()));
    }

    #[test]
    fn test_restore_reads_every_gzip_member() {
        let mut snapshot = encode(&[(b"a", b"1")]);
        snapshot.extend(encode(&[(b"b", b"2"), (b"c", b"3")]));

        let dir = TempDir::new().unwrap();
        let sm = open(&dir);
        assert_eq!(sm.restore(snapshot.as_slice()).unwrap(), 3);
        assert_eq!(contents(&sm).len(), 3);

        let mut out = Vec::new();
        let exported = encode(&[(b"ka", b"1")])
            .into_iter()
            .chain(encode(&[(b"kb", b"2")]))
            .collect::<Vec<u8>>();
        assert_eq!(write_commands(&mut out, exported.as_slice()).unwrap(), 2);
    }

    #[test]
    fn test_restored_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let sm = open(&dir);
        sm.restore(encode(&[(b"a", b"1"), (b"b", b"2")]).as_slice()).unwrap();
        sm.close().unwrap();

        let sm = open(&dir);
        assert_eq!(contents(&sm).len(), 2);
        assert!(!sibling(sm.dir(), ".restore").exists());
        assert!(!sibling(sm.dir(), ".retired").exists());
    }

    #[test]
    fn test_empty_snapshot() {
        let dir = TempDir::new().unwrap();
        let sm = open(&dir);
        let applier = LocalApplier::new();
        run(&sm, &applier, &["SET", "k", "v"]);

        assert_eq!(sm.restore(encode(&[]).as_slice()).unwrap(), 0);
        assert!(contents(&sm).is_empty());
    }

    #[test]
    fn test_truncated_snapshot_keeps_current_state() {
        let dir = TempDir::new().unwrap();
        let sm = open(&dir);
        let applier = LocalApplier::new();
        run(&sm, &applier, &["SET", "keep", "me"]);

        // Second record claims a 100 byte value but carries 3 bytes.
        let mut raw = Vec::new();
        write_record(&mut raw, b"a", b"1").unwrap();
        raw.extend_from_slice(&1u64.to_le_bytes());
        raw.extend_from_slice(b"b");
        raw.extend_from_slice(&100u64.to_le_bytes());
        raw.extend_from_slice(b"abc");
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&raw).unwrap();
        let snapshot = encoder.finish().unwrap();

        let err = sm.restore(snapshot.as_slice()).unwrap_err();
        assert!(matches!(err, SnapshotError::Truncated));
        assert_eq!(run(&sm, &applier, &["GET", "keep"]), Reply::Bulk(b"me".to_vec()));
        assert_eq!(run(&sm, &applier, &["GET", "a"]), Reply::Null);
        assert!(!sibling(sm.dir(), ".restore").exists());
    }

    #[test]
    fn test_partial_length_prefix_is_truncation() {
        let mut raw = Vec::new();
        write_record(&mut raw, b"a", b"1").unwrap();
        raw.extend_from_slice(&[1, 0, 0]);

        let records: Vec<_> = RecordReader::new(raw.as_slice()).collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].as_ref().unwrap(), &(b"a".to_vec(), b"1".to_vec()));
        assert!(matches!(records[1], Err(SnapshotError::Truncated)));
    }

    #[test]
    fn test_export_commands() {
        let snapshot = encode(&[
            (b"kuser:1", b"alice"),
            (b"meta", b"skipped"),
            (b"", b"skipped too"),
            (b"k", b""),
        ]);

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("snapshot");
        fs::write(&path, &snapshot).unwrap();

        let mut out = Vec::new();
        assert_eq!(write_commands_from_snapshot(&mut out, &path).unwrap(), 2);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "*3\r\n$3\r\nSET\r\n$6\r\nuser:1\r\n$5\r\nalice\r\n\
             *3\r\n$3\r\nSET\r\n$0\r\n\r\n$0\r\n\r\n"
        );
    }

    #[test]
    fn test_snapshot_after_close_fails() {
        let dir = TempDir::new().unwrap();
        let sm = open(&dir);
        sm.close().unwrap();

        assert!(matches!(
            sm.snapshot(Vec::new()),
            Err(SnapshotError::Store(StoreError::Closed))
        ));
        assert!(matches!(
            sm.restore(encode(&[]).as_slice()),
            Err(SnapshotError::Store(StoreError::Closed))
        ));
    }

    #[test]
    fn test_scan_error_fails_snapshot() {
        let dir = TempDir::new().unwrap();
        let sm: StateMachine<BrokenScanStore> = StateMachine::new(dir.path().join("data")).unwrap();
        sm.write(|store| {
            store.put(b"a", b"1")?;
            store.put(b"b", b"2")
        })
        .unwrap();

        let err = sm.snapshot(Vec::new()).unwrap_err();
        assert!(matches!(err, SnapshotError::Store(StoreError::Corrupted(_))));
    }

    /// Signals on its first write, then stalls while the snapshot still holds
    /// the shared lock.
    struct StallingWriter {
        started: Option<mpsc::Sender<()>>,
        stall: Duration,
        out: Vec<u8>,
    }

    impl Write for StallingWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if let Some(started) = self.started.take() {
                let _ = started.send(());
                thread::sleep(self.stall);
            }
            self.out.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_snapshot_blocks_writers_not_readers() {
        let dir = TempDir::new().unwrap();
        let sm = open(&dir);
        let applier = LocalApplier::new();
        run(&sm, &applier, &["SET", "k", "v"]);
        let (started_tx, started_rx) = mpsc::channel();

        thread::scope(|scope| {
            let snapshot = scope.spawn(|| {
                sm.snapshot(StallingWriter {
                    started: Some(started_tx),
                    stall: Duration::from_millis(300),
                    out: Vec::new(),
                })
            });

            started_rx.recv().unwrap();
            let start = Instant::now();
            assert_eq!(run(&sm, &applier, &["GET", "k"]), Reply::Bulk(b"v".to_vec()));
            assert!(start.elapsed() < Duration::from_millis(150));

            run(&sm, &applier, &["SET", "k", "w"]);
            assert!(start.elapsed() >= Duration::from_millis(200));
            assert_eq!(snapshot.join().unwrap().unwrap(), 1);
        });
    }

    static REFUSE_REOPEN: AtomicBool = AtomicBool::new(false);

    /// Opens staging directories normally but refuses the live directory while
    /// `REFUSE_REOPEN` is set.
    struct RefusingReopenStore(FileStore);

    impl LocalStore for RefusingReopenStore {
        fn open(dir: &Path) -> Result<Self, StoreError> {
            let staging = dir.to_string_lossy().ends_with(".restore");
            if !staging && REFUSE_REOPEN.load(Ordering::SeqCst) {
                return Err(StoreError::Io(io::Error::new(io::ErrorKind::Other, "device gone")));
            }
            FileStore::open(dir).map(RefusingReopenStore)
        }

        fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
            self.0.put(key, value)
        }

        fn get(&self, key: &[u8]) -> Result<Vec<u8>, StoreError> {
            self.0.get(key)
        }

        fn delete(&mut self, key: &[u8]) -> Result<(), StoreError> {
            self.0.delete(key)
        }

        fn sync(&self) -> Result<(), StoreError> {
            self.0.sync()
        }

        fn items(&self) -> Box<dyn Iterator<Item = Result<Item, StoreError>> + '_> {
            self.0.items()
        }

        fn close(self) -> Result<(), StoreError> {
            self.0.close()
        }
    }

    #[test]
    fn test_reopen_failure_after_restore_is_reported() {
        let dir = TempDir::new().unwrap();
        let sm: StateMachine<RefusingReopenStore> =
            StateMachine::new(dir.path().join("data")).unwrap();

        REFUSE_REOPEN.store(true, Ordering::SeqCst);
        let result = sm.restore(encode(&[(b"a", b"1")]).as_slice());
        REFUSE_REOPEN.store(false, Ordering::SeqCst);

        let err = result.unwrap_err();
        assert!(matches!(err, SnapshotError::Reopen(StoreError::Io(_))));
        assert!(err.to_string().contains("device gone"));
        // The restored data is on disk and opens once the device is back.
        let reopened = open_at(sm.dir());
        assert_eq!(reopened.read(|store| store.get(b"a")).unwrap(), b"1");
    }

    fn open_at(dir: &Path) -> StateMachine {
        StateMachine::new(dir).unwrap()
    }
}

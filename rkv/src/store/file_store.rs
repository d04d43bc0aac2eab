use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use super::datafile::{DataFile, RecordKind};
use super::{Item, LocalStore, Result, StoreError};

const DATA_FILE_NAME: &str = "node.db";

/// Log-structured store: one append-only data file plus an in-memory index of
/// the live record for every key.
pub struct FileStore {
    data: DataFile,
    index: HashMap<Vec<u8>, u64>,
    // Offsets of live records; scanning them in order gives a stable iteration.
    live: BTreeSet<u64>,
    dir: PathBuf,
}

impl FileStore {
    pub fn len(&self) -> usize {
        self.index.len()
    }

    fn load(&mut self) -> Result<()> {
        for record in self.data.replay()? {
            match record.kind {
                RecordKind::Put => {
                    if let Some(old) = self.index.insert(record.key, record.offset) {
                        self.live.remove(&old);
                    }
                    self.live.insert(record.offset);
                }
                RecordKind::Delete => {
                    if let Some(old) = self.index.remove(&record.key) {
                        self.live.remove(&old);
                    }
                }
            }
        }
        Ok(())
    }
}

impl LocalStore for FileStore {
    fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let data = DataFile::open(dir.join(DATA_FILE_NAME))?;

        let mut store = FileStore {
            data,
            index: HashMap::new(),
            live: BTreeSet::new(),
            dir: dir.to_path_buf(),
        };
        store.load()?;
        log::debug!(
            "opened store at {} with {} keys ({} bytes)",
            store.dir.display(),
            store.len(),
            store.data.len()
        );
        Ok(store)
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let offset = self.data.append(RecordKind::Put, key, value)?;
        if let Some(old) = self.index.insert(key.to_vec(), offset) {
            self.live.remove(&old);
        }
        self.live.insert(offset);
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        let offset = self.index.get(key).ok_or(StoreError::KeyNotFound)?;
        let (_, value) = self.data.read_item(*offset)?;
        Ok(value)
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        let Some(old) = self.index.remove(key) else {
            return Ok(());
        };
        self.live.remove(&old);
        self.data.append(RecordKind::Delete, key, &[])?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.data.sync()
    }

    fn items(&self) -> Box<dyn Iterator<Item = Result<Item>> + '_> {
        Box::new(self.live.iter().map(move |offset| self.data.read_item(*offset)))
    }

    fn close(self) -> Result<()> {
        self.data.sync()?;
        log::debug!("closed store at {}", self.dir.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn keys(store: &FileStore) -> Vec<Vec<u8>> {
        store.items().map(|item| item.unwrap().0).collect()
    }

    #[test]
    fn test_put_get_delete() {
        let dir = TempDir::new().unwrap();
        let mut store = FileStore::open(dir.path()).unwrap();

        store.put(b"a", b"1").unwrap();
        store.put(b"a", b"2").unwrap();
        assert_eq!(store.get(b"a").unwrap(), b"2");

        store.delete(b"a").unwrap();
        assert!(matches!(store.get(b"a"), Err(StoreError::KeyNotFound)));
        store.delete(b"a").unwrap();
        store.delete(b"never-written").unwrap();
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_iteration_follows_insertion_order() {
        let dir = TempDir::new().unwrap();
        let mut store = FileStore::open(dir.path()).unwrap();

        store.put(b"key.1", b"value.1").unwrap();
        store.put(b"cc.1", b"value.2").unwrap();
        store.put(b"key.2", b"value.3").unwrap();

        assert_eq!(
            keys(&store),
            vec![b"key.1".to_vec(), b"cc.1".to_vec(), b"key.2".to_vec()]
        );
        let items: Vec<Item> = store.items().map(|item| item.unwrap()).collect();
        assert_eq!(items[1], (b"cc.1".to_vec(), b"value.2".to_vec()));
    }

    #[test]
    fn test_reopen_rebuilds_index() {
        let dir = TempDir::new().unwrap();
        {
            let mut store = FileStore::open(dir.path()).unwrap();
            store.put(b"a", b"1").unwrap();
            store.put(b"b", b"2").unwrap();
            store.put(b"a", b"3").unwrap();
            store.delete(b"b").unwrap();
            store.close().unwrap();
        }

        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(b"a").unwrap(), b"3");
        assert!(matches!(store.get(b"b"), Err(StoreError::KeyNotFound)));
    }

    #[test]
    fn test_empty_key_and_value() {
        let dir = TempDir::new().unwrap();
        let mut store = FileStore::open(dir.path()).unwrap();

        store.put(b"", b"").unwrap();
        assert_eq!(store.get(b"").unwrap(), b"");
        assert_eq!(keys(&store), vec![Vec::<u8>::new()]);
    }
}

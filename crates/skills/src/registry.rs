use std::{
    io::Write,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use {
    chrono::Utc,
    tracing::{debug, info},
};

use crate::{
    error::{Error, Result},
    types::BundleRecord,
};

/// File-backed collection of [`BundleRecord`]s.
///
/// One handle per registry file. Every load-modify-save cycle runs under the
/// handle's mutex, and every save replaces the whole file through a temporary
/// file in the same directory, so readers never see a half-written registry.
/// Share the handle (`Arc<RegistryStore>`) instead of opening the same path
/// twice.
#[derive(Debug)]
pub struct RegistryStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl RegistryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// All records in file order. A missing or empty file is an empty registry.
    pub fn load(&self) -> Result<Vec<BundleRecord>> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::fs("read registry", &self.path, e)),
        };
        if data.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&data)
            .map_err(|e| Error::parse(format!("registry {}", self.path.display()), e))
    }

    /// Replace the registry contents.
    pub fn save(&self, records: &[BundleRecord]) -> Result<()> {
        let _guard = self.guard();
        self.write_atomic(records)
    }

    fn write_atomic(&self, records: &[BundleRecord]) -> Result<()> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir).map_err(|e| Error::fs("create directory", &dir, e))?;

        let data = serde_json::to_string_pretty(records)
            .map_err(|e| Error::parse("registry records", e))?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)
            .map_err(|e| Error::fs("create temporary file in", &dir, e))?;
        tmp.write_all(data.as_bytes())
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| Error::fs("write", tmp.path().to_path_buf(), e))?;
        tmp.persist(&self.path)
            .map_err(|e| Error::fs("replace registry", &self.path, e.error))?;
        debug!(path = %self.path.display(), count = records.len(), "registry saved");
        Ok(())
    }

    /// Run `f` over the records under the lock and save if it succeeds.
    pub fn modify<T>(&self, f: impl FnOnce(&mut Vec<BundleRecord>) -> Result<T>) -> Result<T> {
        let _guard = self.guard();
        let mut records = self.load()?;
        let out = f(&mut records)?;
        self.write_atomic(&records)?;
        Ok(out)
    }

    /// Insert or replace by `id`. Stamps `updated_at`.
    pub fn upsert(&self, mut record: BundleRecord) -> Result<()> {
        validate(&record)?;
        record.updated_at = Utc::now();
        self.modify(|records| {
            check_store_path(records, &record)?;
            match records.iter_mut().find(|r| r.id == record.id) {
                Some(existing) => *existing = record,
                None => records.push(record),
            }
            Ok(())
        })
    }

    /// Replace an existing record. Absence is [`Error::RecordMissing`].
    pub fn update(&self, mut record: BundleRecord) -> Result<()> {
        validate(&record)?;
        record.updated_at = Utc::now();
        self.modify(|records| {
            check_store_path(records, &record)?;
            let slot = records
                .iter_mut()
                .find(|r| r.id == record.id)
                .ok_or_else(|| Error::RecordMissing {
                    id: record.id.clone(),
                })?;
            *slot = record;
            Ok(())
        })
    }

    /// Mutate the record with `id` in place under the lock.
    pub fn update_with<T>(&self, id: &str, f: impl FnOnce(&mut BundleRecord) -> T) -> Result<T> {
        self.modify(|records| {
            let record = records
                .iter_mut()
                .find(|r| r.id == id)
                .ok_or_else(|| Error::RecordMissing { id: id.to_string() })?;
            let out = f(record);
            record.updated_at = Utc::now();
            Ok(out)
        })
    }

    /// [`RegistryStore::update_with`] on the blocking pool, for callers running
    /// inside async worker pools.
    pub async fn update_with_blocking<T, F>(self: &Arc<Self>, id: &str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut BundleRecord) -> T + Send + 'static,
    {
        let this = Arc::clone(self);
        let id = id.to_string();
        match tokio::task::spawn_blocking(move || this.update_with(&id, f)).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => Err(Error::Cancelled),
        }
    }

    /// Delete by `id`. Returns whether a record was removed.
    pub fn remove(&self, id: &str) -> Result<bool> {
        let removed = self.modify(|records| {
            let before = records.len();
            records.retain(|r| r.id != id);
            Ok(records.len() != before)
        })?;
        if removed {
            info!(id, "removed registry record");
        }
        Ok(removed)
    }

    pub fn find_by_name(&self, name: &str) -> Result<BundleRecord> {
        if name.trim().is_empty() {
            return Err(Error::invalid_input("skill name cannot be empty"));
        }
        self.load()?
            .into_iter()
            .find(|r| r.name == name)
            .ok_or_else(|| Error::not_found(format!("skill '{name}'")))
    }

    pub fn find_by_id(&self, id: &str) -> Result<Option<BundleRecord>> {
        Ok(self.load()?.into_iter().find(|r| r.id == id))
    }
}

fn validate(record: &BundleRecord) -> Result<()> {
    if record.id.trim().is_empty() {
        return Err(Error::invalid_input("record id cannot be empty"));
    }
    if record.name.trim().is_empty() {
        return Err(Error::invalid_input("record name cannot be empty"));
    }
    if record.store_path.as_os_str().is_empty() {
        return Err(Error::invalid_input(format!(
            "record '{}' has an empty store path",
            record.id
        )));
    }
    Ok(())
}

/// Two records may not own the same directory or nested directories.
fn check_store_path(records: &[BundleRecord], candidate: &BundleRecord) -> Result<()> {
    let clash = records.iter().find(|r| {
        r.id != candidate.id
            && (r.store_path.starts_with(&candidate.store_path)
                || candidate.store_path.starts_with(&r.store_path))
    });
    match clash {
        Some(other) => Err(Error::conflict(format!(
            "store path {} of '{}' overlaps {} of '{}'",
            candidate.store_path.display(),
            candidate.id,
            other.store_path.display(),
            other.id
        ))),
        None => Ok(()),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{error::ErrorKind, types::LinkedProject},
        std::{collections::BTreeMap, time::Duration},
    };

    fn record(name: &str, store: &Path) -> BundleRecord {
        BundleRecord {
            id: format!("o/r/skills/{name}@main"),
            name: name.to_string(),
            source_ref: format!("https://github.com/o/r/tree/main/skills/{name}"),
            revision: "sha1".into(),
            store_path: store.join(name),
            updated_at: Utc::now(),
            description: None,
            linked_projects: BTreeMap::new(),
        }
    }

    #[test]
    fn missing_file_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let store = RegistryStore::new(tmp.path().join("skills.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn corrupt_file_is_parse_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("skills.json");
        std::fs::write(&path, "{ nope").unwrap();
        let err = RegistryStore::new(path).load().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Parse);
    }

    #[test]
    fn save_then_load_is_stable() {
        let tmp = tempfile::tempdir().unwrap();
        let store = RegistryStore::new(tmp.path().join("nested/skills.json"));
        let mut a = record("a", tmp.path());
        a.linked_projects.insert("/p".into(), LinkedProject {
            symlink_path: "/p/.opencode/skills/a".into(),
            linked_at: Utc::now(),
        });
        let records = vec![a, record("b", tmp.path())];
        store.save(&records).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded, records);
        store.save(&loaded).unwrap();
        assert_eq!(store.load().unwrap(), records);
    }

    #[test]
    fn save_leaves_no_temp_files() {
        let tmp = tempfile::tempdir().unwrap();
        let store = RegistryStore::new(tmp.path().join("skills.json"));
        store.upsert(record("a", tmp.path())).unwrap();
        let names: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("skills.json")]);
    }

    #[test]
    fn upsert_replaces_existing_id() {
        let tmp = tempfile::tempdir().unwrap();
        let store = RegistryStore::new(tmp.path().join("skills.json"));
        store.upsert(record("a", tmp.path())).unwrap();
        assert_eq!(store.load().unwrap().len(), 1);

        let mut again = record("a", tmp.path());
        again.revision = "sha2".into();
        store.upsert(again).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].revision, "sha2");

        store.upsert(record("b", tmp.path())).unwrap();
        assert_eq!(store.load().unwrap().len(), 2);
    }

    #[test]
    fn remove_then_find_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let store = RegistryStore::new(tmp.path().join("skills.json"));
        let rec = record("a", tmp.path());
        store.upsert(rec.clone()).unwrap();
        assert!(store.remove(&rec.id).unwrap());
        assert!(!store.remove(&rec.id).unwrap());
        let err = store.find_by_name("a").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn update_requires_existing_record() {
        let tmp = tempfile::tempdir().unwrap();
        let store = RegistryStore::new(tmp.path().join("skills.json"));
        let err = store.update(record("a", tmp.path())).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RegistryConsistency);
        assert!(store.load().unwrap().is_empty());

        let err = store.update_with("missing", |_| ()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RegistryConsistency);
    }

    #[test]
    fn update_with_mutates_in_place() {
        let tmp = tempfile::tempdir().unwrap();
        let store = RegistryStore::new(tmp.path().join("skills.json"));
        let rec = record("a", tmp.path());
        store.upsert(rec.clone()).unwrap();
        store
            .update_with(&rec.id, |r| r.revision = "sha9".into())
            .unwrap();
        assert_eq!(store.find_by_name("a").unwrap().revision, "sha9");
    }

    #[test]
    fn invalid_records_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let store = RegistryStore::new(tmp.path().join("skills.json"));
        let mut rec = record("a", tmp.path());
        rec.store_path = PathBuf::new();
        assert_eq!(
            store.upsert(rec).unwrap_err().kind(),
            ErrorKind::InvalidInput
        );
        assert_eq!(
            store.find_by_name("").unwrap_err().kind(),
            ErrorKind::InvalidInput
        );
    }

    #[test]
    fn overlapping_store_paths_conflict() {
        let tmp = tempfile::tempdir().unwrap();
        let store = RegistryStore::new(tmp.path().join("skills.json"));
        store.upsert(record("a", tmp.path())).unwrap();

        let mut same = record("b", tmp.path());
        same.store_path = tmp.path().join("a");
        assert_eq!(store.upsert(same).unwrap_err().kind(), ErrorKind::Conflict);

        let mut nested = record("c", tmp.path());
        nested.store_path = tmp.path().join("a").join("c");
        assert_eq!(
            store.upsert(nested).unwrap_err().kind(),
            ErrorKind::Conflict
        );

        // Sibling with a shared string prefix is fine.
        let mut sibling = record("ab", tmp.path());
        sibling.store_path = tmp.path().join("ab");
        store.upsert(sibling).unwrap();
        assert_eq!(store.load().unwrap().len(), 2);
    }

    #[test]
    fn concurrent_upserts_lose_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(RegistryStore::new(tmp.path().join("skills.json")));
        let n = 16;
        std::thread::scope(|scope| {
            for i in 0..n {
                let store = Arc::clone(&store);
                let root = tmp.path().to_path_buf();
                scope.spawn(move || {
                    store.upsert(record(&format!("s{i}"), &root)).unwrap();
                });
            }
        });
        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), n);
        let mut ids: Vec<_> = loaded.iter().map(|r| r.id.clone()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), n);
    }

    #[tokio::test]
    #[allow(clippy::await_holding_lock)]
    async fn blocking_update_leaves_runtime_free() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(RegistryStore::new(tmp.path().join("skills.json")));
        store.upsert(record("demo", tmp.path())).unwrap();

        let guard = store.guard();
        let pending = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                store
                    .update_with_blocking("o/r/skills/demo@main", |r| {
                        r.revision = "sha2".into();
                    })
                    .await
            })
        };
        // The single runtime thread keeps running while the writer waits.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());
        drop(guard);

        pending.await.unwrap().unwrap();
        assert_eq!(store.find_by_name("demo").unwrap().revision, "sha2");
        let err = store
            .update_with_blocking("o/r/skills/nope@main", |_| ())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RegistryConsistency);
    }
}

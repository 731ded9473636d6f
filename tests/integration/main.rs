//! Integration tests for doccache

use doccache::{
    BackendError, CacheConfig, CacheError, CreationPolicy, DocumentBackend, ErrorPolicy,
    OpenMode, ReleasePolicy, ResourceCache, ResourceKey,
};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

/// Cells of a workbook stored as a JSON object
#[derive(Debug, Default)]
struct Sheet {
    cells: BTreeMap<String, String>,
}

/// Backend persisting sheets as JSON files
#[derive(Default)]
struct JsonBackend {
    opens: AtomicUsize,
    saves: AtomicUsize,
    closes: AtomicUsize,
}

impl JsonBackend {
    fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl DocumentBackend for JsonBackend {
    type Handle = Sheet;

    fn open(&self, path: &Path, _mode: OpenMode) -> Result<Sheet, BackendError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(5));
        let content = fs::read_to_string(path)?;
        Ok(Sheet {
            cells: serde_json::from_str(&content)?,
        })
    }

    fn create(&self, _mode: OpenMode) -> Result<Sheet, BackendError> {
        Ok(Sheet::default())
    }

    fn save(&self, sheet: &Sheet, path: &Path) -> Result<(), BackendError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        fs::write(path, serde_json::to_string(&sheet.cells)?)?;
        Ok(())
    }

    fn close(&self, _sheet: Sheet) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

fn write_sheet(path: &Path, cells: &[(&str, &str)]) {
    let cells: BTreeMap<_, _> = cells.iter().copied().collect();
    fs::write(path, serde_json::to_string(&cells).unwrap()).unwrap();
}

fn read_sheet(path: &Path) -> BTreeMap<String, String> {
    serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
}

fn cache(max_size: usize) -> ResourceCache<JsonBackend> {
    let config = CacheConfig {
        max_size,
        ..Default::default()
    };
    ResourceCache::new(JsonBackend::default(), config).unwrap()
}

mod cache_tests {
    use super::*;

    #[test]
    fn capacity_two_evicts_first_of_three() {
        let temp = TempDir::new().unwrap();
        let cache = cache(2);
        let keys: Vec<_> = ["a.json", "b.json", "c.json"]
            .iter()
            .map(|name| ResourceKey::writable(temp.path().join(name)))
            .collect();

        for key in &keys {
            cache.with_resource(key, |_| Ok::<_, CacheError>(())).unwrap();
        }

        let stats = cache.stats();
        assert_eq!(stats.size, 2);
        assert_eq!(stats.evictions, 1);
        assert!(!cache.contains(&keys[0]));
        assert!(cache.contains(&keys[1]));
        assert!(cache.contains(&keys[2]));
    }

    #[test]
    fn edit_is_on_disk_after_release() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("book.json");
        write_sheet(&path, &[("A1", "old")]);
        let cache = cache(4);
        let key = ResourceKey::writable(&path);

        cache
            .with_resource(&key, |doc| {
                doc.handle_mut()?.cells.insert("A1".into(), "Hello".into());
                Ok::<_, CacheError>(())
            })
            .unwrap();

        assert_eq!(read_sheet(&path)["A1"], "Hello");
        assert_eq!(cache.backend().saves(), 1);
        assert!(!cache.stats().context(key.path()).unwrap().is_dirty);
    }

    #[test]
    fn new_document_is_written_on_first_release() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("reports").join("new.json");
        let cache = cache(4);

        cache
            .with_resource(&ResourceKey::writable(&path), |doc| {
                doc.handle_mut()?.cells.insert("B2".into(), "42".into());
                Ok::<_, CacheError>(())
            })
            .unwrap();

        assert_eq!(read_sheet(&path)["B2"], "42");
        assert_eq!(cache.backend().opens(), 0);
    }

    #[test]
    fn repeated_reads_load_once() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("book.json");
        write_sheet(&path, &[("A1", "1")]);
        let cache = cache(4);
        let key = ResourceKey::read_only(&path);

        for _ in 0..5 {
            let value = cache
                .with_resource(&key, |doc| Ok::<_, CacheError>(doc.handle().cells["A1"].clone()))
                .unwrap();
            assert_eq!(value, "1");
        }

        assert_eq!(cache.backend().opens(), 1);
        let stats = cache.stats();
        assert_eq!(stats.hits, 4);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.8).abs() < 1e-9);
    }

    #[test]
    fn read_only_document_rejects_edits() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("book.json");
        write_sheet(&path, &[("A1", "1")]);
        let cache = cache(4);

        let result = cache.with_resource(&ResourceKey::read_only(&path), |doc| {
            doc.handle_mut()?.cells.clear();
            Ok::<_, CacheError>(())
        });

        let err = result.unwrap_err();
        assert!(matches!(err, CacheError::ReadOnly { .. }));
        assert!(err.hint().is_some());
        assert_eq!(read_sheet(&path)["A1"], "1");
        assert_eq!(cache.backend().saves(), 0);
    }

    #[test]
    fn concurrent_callers_share_one_load() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("book.json");
        write_sheet(&path, &[]);
        let cache = cache(4);
        let key = ResourceKey::writable(&path);

        std::thread::scope(|scope| {
            for i in 0..8 {
                let (cache, key) = (&cache, &key);
                scope.spawn(move || {
                    cache
                        .with_resource(key, |doc| {
                            doc.handle_mut()?.cells.insert(format!("A{i}"), i.to_string());
                            Ok::<_, CacheError>(())
                        })
                        .unwrap();
                });
            }
        });

        assert_eq!(cache.backend().opens(), 1);
        assert_eq!(read_sheet(&path).len(), 8);
    }

    #[test]
    fn external_edit_is_picked_up() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("book.json");
        write_sheet(&path, &[("A1", "before")]);
        let cache = cache(4);
        let key = ResourceKey::read_only(&path);
        let read = || {
            cache
                .with_resource(&key, |doc| Ok::<_, CacheError>(doc.handle().cells["A1"].clone()))
                .unwrap()
        };

        assert_eq!(read(), "before");

        let loaded = fs::metadata(&path).unwrap().modified().unwrap();
        write_sheet(&path, &[("A1", "after")]);
        let file = fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_modified(loaded + Duration::from_secs(2)).unwrap();
        drop(file);

        assert_eq!(read(), "after");
        assert_eq!(cache.backend().opens(), 2);
    }

    #[test]
    fn deferred_changes_persist_on_invalidate() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("book.json");
        write_sheet(&path, &[]);
        let config = CacheConfig {
            release: ReleasePolicy::Defer,
            ..Default::default()
        };
        let cache = ResourceCache::new(JsonBackend::default(), config).unwrap();
        let key = ResourceKey::writable(&path);

        for i in 0..3 {
            cache
                .with_resource(&key, |doc| {
                    doc.handle_mut()?.cells.insert(format!("A{i}"), "x".into());
                    Ok::<_, CacheError>(())
                })
                .unwrap();
        }
        assert_eq!(cache.backend().saves(), 0);
        assert!(read_sheet(&path).is_empty());

        assert!(cache.invalidate(&key).unwrap());
        assert_eq!(cache.backend().saves(), 1);
        assert_eq!(read_sheet(&path).len(), 3);
    }

    #[test]
    fn discard_policy_drops_failed_edits() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("book.json");
        write_sheet(&path, &[("A1", "kept")]);
        let config = CacheConfig {
            on_error: ErrorPolicy::Discard,
            ..Default::default()
        };
        let cache = ResourceCache::new(JsonBackend::default(), config).unwrap();
        let key = ResourceKey::writable(&path);

        let result: Result<(), CacheError> = cache.with_resource(&key, |doc| {
            doc.handle_mut()?.cells.insert("A1".into(), "lost".into());
            Err(CacheError::invalid_setting("A1", "validation failed"))
        });
        assert!(result.is_err());

        let value = cache
            .with_resource(&key, |doc| Ok::<_, CacheError>(doc.handle().cells["A1"].clone()))
            .unwrap();
        assert_eq!(value, "kept");
        assert_eq!(cache.backend().saves(), 0);
        assert_eq!(cache.backend().opens(), 2);
    }

    #[test]
    fn missing_file_fails_under_must_exist() {
        let temp = TempDir::new().unwrap();
        let config = CacheConfig {
            creation: CreationPolicy::MustExist,
            ..Default::default()
        };
        let cache = ResourceCache::new(JsonBackend::default(), config).unwrap();
        let key = ResourceKey::writable(temp.path().join("absent.json"));

        let err = cache
            .with_resource(&key, |_| Ok::<_, CacheError>(()))
            .unwrap_err();
        assert!(matches!(err, CacheError::Open { .. }));
        assert!(cache.is_empty());
    }

    #[test]
    fn clear_flushes_everything() {
        let temp = TempDir::new().unwrap();
        let config = CacheConfig {
            release: ReleasePolicy::Defer,
            ..Default::default()
        };
        let cache = ResourceCache::new(JsonBackend::default(), config).unwrap();
        for name in ["a.json", "b.json"] {
            cache
                .with_resource(&ResourceKey::writable(temp.path().join(name)), |doc| {
                    doc.handle_mut()?.cells.insert("A1".into(), name.into());
                    Ok::<_, CacheError>(())
                })
                .unwrap();
        }

        let closed = cache.clear().into_result().unwrap();
        assert_eq!(closed, 2);
        assert!(cache.is_empty());
        assert_eq!(read_sheet(&temp.path().join("b.json"))["A1"], "b.json");
    }
}

mod config_tests {
    use super::*;
    use doccache::ConfigManager;
    use serial_test::serial;

    #[test]
    #[serial]
    fn file_settings_drive_cache() {
        std::env::remove_var(doccache::config::ENV_MAX_SIZE);
        std::env::remove_var(doccache::config::ENV_MAX_AGE_SECS);
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("config.toml");
        fs::write(
            &config_path,
            "[cache]\nmax_size = 1\nmax_age_secs = 0\nrelease = \"close\"\n",
        )
        .unwrap();

        let config = ConfigManager::with_path(config_path).load().unwrap();
        let cache = ResourceCache::new(JsonBackend::default(), config.cache).unwrap();
        let key = ResourceKey::writable(temp.path().join("book.json"));
        cache.with_resource(&key, |_| Ok::<_, CacheError>(())).unwrap();

        let stats = cache.stats();
        assert_eq!(stats.max_size, 1);
        assert_eq!(stats.max_age_secs, None);
        assert!(!stats.contexts[0].is_loaded);
    }
}

mod global_tests {
    use super::*;
    use doccache::global;
    use serial_test::serial;

    #[test]
    #[serial]
    fn default_cache_round_trip() {
        global::shutdown();
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("book.json");
        let key = ResourceKey::writable(&path);

        global::with_resource::<JsonBackend, _, _, _>(&key, |doc| {
            doc.handle_mut()?.cells.insert("A1".into(), "global".into());
            Ok::<_, CacheError>(())
        })
        .unwrap();

        let stats = global::stats().unwrap();
        assert_eq!(stats.size, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(read_sheet(&path)["A1"], "global");

        let status = global::status().unwrap();
        assert_eq!(status["installed"], true);
        assert_eq!(status["cache"]["size"], 1);

        assert!(global::invalidate(&key).unwrap());
        assert_eq!(global::shutdown().attempted, 0);
        assert!(!global::is_installed());
    }
}

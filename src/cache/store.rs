//! Cache store - Query results cached under an explicit key
//!
//! Layout of the cache directory:
//!
//! ```text
//! <cache_dir>/<key>.csv.gz   gzip-compressed CSV from `psql --csv`
//! <cache_dir>/<key>.json     schema side-car (column -> type tag)
//! ```
//!
//! A key is a hit only when both files exist. On a miss the query runs once,
//! the data file is committed first and the side-car last, so an interrupted
//! population looks like a miss on the next call.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::backends::process::Runner;
use crate::backends::psql::{Psql, Query, TableRef};
use crate::cache::lock::KeyLocks;
use crate::cache::schema;
use crate::cache::CacheError;
use crate::core::config::Config;
use crate::core::model::{Schema, Table};
use crate::core::paths::{key_from_file_name, EntryPaths};
use crate::core::table::{decode, DecodeOptions};
use crate::core::template;
use crate::core::util::get_mtime_ms;

/// State of one key found in the cache directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryState {
    /// Data and schema present
    Complete,
    /// Data without schema; the next fetch repopulates it
    Partial,
    /// Schema without data
    Orphan,
}

/// One line of `entries()`
#[derive(Debug, Clone, Serialize)]
pub struct EntryStatus {
    pub key: String,
    pub state: EntryState,

    /// Compressed data size in bytes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,

    /// Data modification time in milliseconds since epoch
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mtime_ms: Option<i64>,
}

pub struct CacheStore<R> {
    cache_dir: PathBuf,
    psql: Psql,
    runner: R,
    locks: KeyLocks,
}

impl<R: Runner> CacheStore<R> {
    pub fn new(config: &Config, runner: R) -> Self {
        Self {
            cache_dir: config.system.cache_dir.clone(),
            psql: Psql::from_config(config),
            runner,
            locks: KeyLocks::new(),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    #[cfg(test)]
    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Return the cached result for `key`, running `query` only on a miss.
    ///
    /// `explicit_schema` decides column types on a miss and is what gets
    /// persisted. On a hit the persisted schema wins and it is ignored.
    pub fn fetch(
        &self,
        query: &Query,
        key: &str,
        explicit_schema: Option<&Schema>,
        options: &DecodeOptions,
    ) -> Result<Table, CacheError> {
        let paths = EntryPaths::new(&self.cache_dir, key)?;

        if paths.is_complete() {
            info!(key, "cache hit");
            return self.read_entry(&paths, options);
        }

        self.locks.with(key, || {
            if paths.is_complete() {
                info!(key, "cache hit after waiting for population");
                return self.read_entry(&paths, options);
            }
            if paths.is_partial() {
                warn!(key, path = %paths.data.display(), "data without schema side-car; repopulating");
            }

            info!(key, "cache miss");
            self.populate(query, &paths, explicit_schema, options)
        })
    }

    /// Render a SQL template file with `params`, then `fetch` it
    pub fn fetch_template(
        &self,
        template_path: &Path,
        params: &BTreeMap<String, String>,
        key: &str,
        explicit_schema: Option<&Schema>,
        options: &DecodeOptions,
    ) -> Result<Table, CacheError> {
        let sql = render_template(template_path, params)?;
        self.fetch(&Query::Sql(sql), key, explicit_schema, options)
    }

    /// Run a statement without caching and return psql's output
    pub fn execute(&self, query: &Query) -> Result<String, CacheError> {
        Ok(self.runner.run(&self.psql.execute_command(query))?)
    }

    /// Render a SQL template file with `params`, then `execute` it
    pub fn execute_template(
        &self,
        template_path: &Path,
        params: &BTreeMap<String, String>,
    ) -> Result<String, CacheError> {
        let sql = render_template(template_path, params)?;
        self.execute(&Query::Sql(sql))
    }

    /// Bulk-load a local CSV file into `target`. Always runs.
    pub fn store(&self, csv_file: &Path, target: &TableRef) -> Result<String, CacheError> {
        info!(file = %csv_file.display(), table = %target, "loading");
        Ok(self.runner.run(&self.psql.copy_command(csv_file, target))?)
    }

    /// Persisted schema of `key`
    pub fn schema_of(&self, key: &str) -> Result<Schema, CacheError> {
        let paths = EntryPaths::new(&self.cache_dir, key)?;
        Ok(schema::load(&paths.schema)?)
    }

    /// Every key with at least one artifact, sorted by key
    pub fn entries(&self) -> Result<Vec<EntryStatus>, CacheError> {
        let dir = match fs::read_dir(&self.cache_dir) {
            Ok(dir) => dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CacheError::io(&self.cache_dir)(e)),
        };

        let mut keys = BTreeSet::new();
        for entry in dir {
            let entry = entry.map_err(CacheError::io(&self.cache_dir))?;
            let name = entry.file_name();
            if let Some(key) = name.to_str().and_then(key_from_file_name) {
                keys.insert(key.to_string());
            }
        }

        let mut statuses = Vec::with_capacity(keys.len());
        for key in keys {
            let paths = EntryPaths::new(&self.cache_dir, &key)?;
            let state = if paths.is_complete() {
                EntryState::Complete
            } else if paths.is_partial() {
                EntryState::Partial
            } else {
                EntryState::Orphan
            };
            let metadata = fs::metadata(&paths.data).ok();
            statuses.push(EntryStatus {
                key,
                state,
                size: metadata.as_ref().map(|m| m.len()),
                mtime_ms: metadata.and_then(|_| get_mtime_ms(&paths.data).ok()),
            });
        }
        Ok(statuses)
    }

    /// Delete both artifacts of `key`. Returns whether anything was removed.
    pub fn forget(&self, key: &str) -> Result<bool, CacheError> {
        let paths = EntryPaths::new(&self.cache_dir, key)?;
        let removed = self.locks.with(key, || {
            let mut removed = false;
            for path in [&paths.schema, &paths.data] {
                match fs::remove_file(path) {
                    Ok(()) => removed = true,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(CacheError::io(path)(e)),
                }
            }
            Ok(removed)
        })?;
        if removed {
            info!(key, "forgot cache entry");
        }
        Ok(removed)
    }

    fn read_entry(&self, paths: &EntryPaths, options: &DecodeOptions) -> Result<Table, CacheError> {
        let schema = schema::load(&paths.schema)?;
        read_gz(&paths.data, Some(&schema), options)
    }

    fn populate(
        &self,
        query: &Query,
        paths: &EntryPaths,
        explicit_schema: Option<&Schema>,
        options: &DecodeOptions,
    ) -> Result<Table, CacheError> {
        fs::create_dir_all(&self.cache_dir).map_err(CacheError::io(&self.cache_dir))?;

        let raw = self.temp_file(".csv")?;
        self.runner
            .run(&self.psql.export_command(query, raw.path()))?;

        let compressed = self.compress(raw)?;
        let table = read_gz(compressed.path(), explicit_schema, options)?;

        compressed
            .as_file()
            .sync_all()
            .map_err(CacheError::io(compressed.path()))?;
        compressed
            .persist(&paths.data)
            .map_err(|e| CacheError::io(&paths.data)(e.error))?;
        debug!(path = %paths.data.display(), "data committed");

        let persisted = explicit_schema.unwrap_or(&table.schema);
        if let Err(e) = schema::persist(&paths.schema, persisted) {
            let _ = fs::remove_file(&paths.data);
            return Err(e.into());
        }
        info!(
            path = %paths.schema.display(),
            columns = persisted.len(),
            rows = table.rows.len(),
            "cache entry written"
        );

        Ok(table)
    }

    /// Gzip `raw` into a new temp file; `raw` is deleted
    fn compress(&self, raw: NamedTempFile) -> Result<NamedTempFile, CacheError> {
        let compressed = self.temp_file(".csv.gz")?;
        let mut input = BufReader::new(File::open(raw.path()).map_err(CacheError::io(raw.path()))?);
        let mut encoder = GzEncoder::new(compressed.as_file(), Compression::default());
        io::copy(&mut input, &mut encoder).map_err(CacheError::io(compressed.path()))?;
        encoder
            .finish()
            .map_err(CacheError::io(compressed.path()))?;

        let raw_path = raw.path().to_path_buf();
        raw.close().map_err(CacheError::io(raw_path))?;
        Ok(compressed)
    }

    /// Hidden temp file in the cache directory, removed on drop
    fn temp_file(&self, suffix: &str) -> Result<NamedTempFile, CacheError> {
        tempfile::Builder::new()
            .suffix(suffix)
            .tempfile_in(&self.cache_dir)
            .map_err(CacheError::io(&self.cache_dir))
    }
}

fn read_gz(
    path: &Path,
    schema: Option<&Schema>,
    options: &DecodeOptions,
) -> Result<Table, CacheError> {
    let file = File::open(path).map_err(CacheError::io(path))?;
    decode(GzDecoder::new(BufReader::new(file)), schema, options).map_err(|source| {
        CacheError::Decode {
            path: path.to_path_buf(),
            source,
        }
    })
}

/// Read a SQL template file and fill in its placeholders
pub fn render_template(
    template_path: &Path,
    params: &BTreeMap<String, String>,
) -> Result<String, CacheError> {
    let text = fs::read_to_string(template_path).map_err(CacheError::io(template_path))?;
    template::render(&text, params).map_err(|source| CacheError::Template {
        path: template_path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::process::ProcessError;
    use crate::core::model::{ColumnType, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    /// Writes canned CSV to the `-o` path of each export command
    struct FakeRunner {
        output: Mutex<String>,
        fail: bool,
        calls: AtomicUsize,
        commands: Mutex<Vec<String>>,
    }

    impl FakeRunner {
        fn new(csv: &str) -> Self {
            Self {
                output: Mutex::new(csv.to_string()),
                fail: false,
                calls: AtomicUsize::new(0),
                commands: Mutex::new(Vec::new()),
            }
        }

        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::new("")
            }
        }

        fn set_output(&self, csv: &str) {
            *self.output.lock().unwrap() = csv.to_string();
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn last_command(&self) -> String {
            self.commands.lock().unwrap().last().cloned().unwrap_or_default()
        }
    }

    impl Runner for FakeRunner {
        fn run(&self, command_line: &str) -> Result<String, ProcessError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.commands.lock().unwrap().push(command_line.to_string());
            if self.fail {
                return Err(ProcessError::Failed {
                    command: command_line.to_string(),
                    code: Some(2),
                    output: "psql: error: connection refused".to_string(),
                });
            }
            if let Some((_, out)) = command_line.rsplit_once(" -o ") {
                let path = out.trim_matches('\'');
                fs::write(path, self.output.lock().unwrap().as_bytes()).unwrap();
            }
            Ok(String::new())
        }
    }

    fn store_in(dir: &Path, runner: FakeRunner) -> CacheStore<FakeRunner> {
        let mut config = Config::default();
        config.system.cache_dir = dir.join("out");
        CacheStore::new(&config, runner)
    }

    fn sql(s: &str) -> Query {
        Query::Sql(s.to_string())
    }

    fn dir_names(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }

    const CSV: &str = "id,name\n1,alice\n2,bob\n";

    #[test]
    fn test_miss_writes_both_artifacts() {
        let temp = tempdir().unwrap();
        let store = store_in(temp.path(), FakeRunner::new(CSV));

        let table = store
            .fetch(&sql("SELECT 1"), "k1", None, &DecodeOptions::default())
            .unwrap();

        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.schema.get("id"), Some(ColumnType::Integer));
        assert_eq!(dir_names(store.cache_dir()), vec!["k1.csv.gz", "k1.json"]);
        assert!(store.runner().last_command().contains("--csv -o"));

        let persisted = store.schema_of("k1").unwrap();
        assert_eq!(persisted, table.schema);
    }

    #[test]
    fn test_second_fetch_is_served_from_disk() {
        let temp = tempdir().unwrap();
        let store = store_in(temp.path(), FakeRunner::new(CSV));
        let options = DecodeOptions::default();

        let first = store.fetch(&sql("SELECT 1"), "k1", None, &options).unwrap();
        store.runner().set_output("other\n9\n");
        let second = store
            .fetch(&sql("SELECT something_else"), "k1", None, &options)
            .unwrap();

        assert_eq!(store.runner().calls(), 1);
        assert_eq!(first, second);
    }

    #[test]
    fn test_explicit_schema_is_persisted_verbatim() {
        let temp = tempdir().unwrap();
        let store = store_in(temp.path(), FakeRunner::new("a,b\n1,2\n"));
        let explicit: Schema = [("a", ColumnType::Integer), ("b", ColumnType::Text)]
            .into_iter()
            .collect();

        let table = store
            .fetch(&sql("SELECT"), "k2", Some(&explicit), &DecodeOptions::default())
            .unwrap();

        assert_eq!(table.rows[0][1], Value::Text("2".to_string()));
        assert_eq!(store.schema_of("k2").unwrap(), explicit);
    }

    #[test]
    fn test_explicit_schema_ignored_on_hit() {
        let temp = tempdir().unwrap();
        let store = store_in(temp.path(), FakeRunner::new("a\n1\n"));
        let options = DecodeOptions::default();
        store.fetch(&sql("SELECT"), "k", None, &options).unwrap();

        let text: Schema = [("a", ColumnType::Text)].into_iter().collect();
        let table = store.fetch(&sql("SELECT"), "k", Some(&text), &options).unwrap();
        assert_eq!(table.rows[0][0], Value::Integer(1));
    }

    #[test]
    fn test_partial_entry_is_repopulated() {
        let temp = tempdir().unwrap();
        let store = store_in(temp.path(), FakeRunner::new(CSV));
        let options = DecodeOptions::default();
        store.fetch(&sql("SELECT"), "k1", None, &options).unwrap();

        fs::remove_file(store.cache_dir().join("k1.json")).unwrap();
        store.runner().set_output("id\n7\n");
        let table = store.fetch(&sql("SELECT"), "k1", None, &options).unwrap();

        assert_eq!(store.runner().calls(), 2);
        assert_eq!(table.rows, vec![vec![Value::Integer(7)]]);
        assert_eq!(dir_names(store.cache_dir()), vec!["k1.csv.gz", "k1.json"]);
    }

    #[test]
    fn test_corrupt_schema_is_fatal() {
        let temp = tempdir().unwrap();
        let store = store_in(temp.path(), FakeRunner::new(CSV));
        let options = DecodeOptions::default();
        store.fetch(&sql("SELECT"), "k1", None, &options).unwrap();

        fs::write(store.cache_dir().join("k1.json"), b"\x00\xffnot json").unwrap();
        let err = store.fetch(&sql("*"), "k1", None, &options).unwrap_err();

        assert!(matches!(err, CacheError::Schema(_)));
        assert_eq!(store.runner().calls(), 1);
    }

    #[test]
    fn test_failed_command_leaves_no_artifacts() {
        let temp = tempdir().unwrap();
        let store = store_in(temp.path(), FakeRunner::failing());

        let err = store
            .fetch(&sql("SELECT"), "k1", None, &DecodeOptions::default())
            .unwrap_err();

        match err {
            CacheError::Command(ProcessError::Failed { output, .. }) => {
                assert!(output.contains("connection refused"))
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(dir_names(store.cache_dir()).is_empty());
    }

    #[test]
    fn test_undecodable_output_is_not_committed() {
        let temp = tempdir().unwrap();
        let store = store_in(temp.path(), FakeRunner::new("n\nx\n"));
        let explicit: Schema = [("n", ColumnType::Integer)].into_iter().collect();

        let err = store
            .fetch(&sql("SELECT"), "k", Some(&explicit), &DecodeOptions::default())
            .unwrap_err();

        assert!(matches!(err, CacheError::Decode { .. }));
        assert!(dir_names(store.cache_dir()).is_empty());
    }

    #[test]
    fn test_invalid_key_runs_nothing() {
        let temp = tempdir().unwrap();
        let store = store_in(temp.path(), FakeRunner::new(CSV));
        let err = store
            .fetch(&sql("SELECT"), "../escape", None, &DecodeOptions::default())
            .unwrap_err();
        assert!(matches!(err, CacheError::InvalidKey(_)));
        assert_eq!(store.runner().calls(), 0);
    }

    #[test]
    fn test_concurrent_fetches_run_query_once() {
        let temp = tempdir().unwrap();
        let store = Arc::new(store_in(temp.path(), FakeRunner::new(CSV)));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    store
                        .fetch(&sql("SELECT"), "shared", None, &DecodeOptions::default())
                        .unwrap()
                })
            })
            .collect();
        let tables: Vec<Table> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(store.runner().calls(), 1);
        assert!(tables.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn test_fetch_template() {
        let temp = tempdir().unwrap();
        let store = store_in(temp.path(), FakeRunner::new(CSV));
        let template = temp.path().join("q.sql");
        fs::write(&template, "SELECT * FROM {table}").unwrap();
        let params = BTreeMap::from([("table".to_string(), "reviews".to_string())]);

        store
            .fetch_template(&template, &params, "t", None, &DecodeOptions::default())
            .unwrap();
        assert!(store
            .runner()
            .last_command()
            .contains("-c 'SELECT * FROM reviews'"));
    }

    #[test]
    fn test_fetch_template_missing_param_runs_nothing() {
        let temp = tempdir().unwrap();
        let store = store_in(temp.path(), FakeRunner::new(CSV));
        let template = temp.path().join("q.sql");
        fs::write(&template, "SELECT {col}").unwrap();

        let err = store
            .fetch_template(&template, &BTreeMap::new(), "t", None, &DecodeOptions::default())
            .unwrap_err();
        assert!(matches!(err, CacheError::Template { .. }));
        assert_eq!(store.runner().calls(), 0);
    }

    #[test]
    fn test_store_always_runs_copy() {
        let temp = tempdir().unwrap();
        let store = store_in(temp.path(), FakeRunner::new(""));
        let target: TableRef = "test.customer_reviews".parse().unwrap();

        store.store(Path::new("reviews.csv"), &target).unwrap();
        store.store(Path::new("reviews.csv"), &target).unwrap();

        assert_eq!(store.runner().calls(), 2);
        assert!(store.runner().last_command().contains("\\copy test.customer_reviews"));
    }

    #[test]
    fn test_repeated_column_names_on_miss_and_hit() {
        let temp = tempdir().unwrap();
        let store = store_in(temp.path(), FakeRunner::new("?column?,?column?\n1,2\n"));
        let options = DecodeOptions::default();

        let first = store.fetch(&sql("SELECT 1, 2"), "dup", None, &options).unwrap();
        assert_eq!(
            first.columns().collect::<Vec<_>>(),
            vec!["?column?", "?column?.1"]
        );
        assert_eq!(first.rows, vec![vec![Value::Integer(1), Value::Integer(2)]]);

        let second = store.fetch(&sql("SELECT 1, 2"), "dup", None, &options).unwrap();
        assert_eq!(store.runner().calls(), 1);
        assert_eq!(second, first);
    }

    #[test]
    fn test_headerless_hit_reads_stored_schema_by_position() {
        let temp = tempdir().unwrap();
        let store = store_in(temp.path(), FakeRunner::new("01234,7\n"));
        let options = DecodeOptions {
            header: false,
            ..Default::default()
        };
        let explicit: Schema = [("zip", ColumnType::Text), ("n", ColumnType::Integer)]
            .into_iter()
            .collect();

        store.fetch(&sql("SELECT"), "h", Some(&explicit), &options).unwrap();
        let hit = store.fetch(&sql("SELECT"), "h", None, &options).unwrap();

        assert_eq!(hit.schema, explicit);
        assert_eq!(hit.rows[0][0], Value::Text("01234".to_string()));
    }

    #[test]
    fn test_headerless_hit_with_narrower_schema_is_error() {
        let temp = tempdir().unwrap();
        let store = store_in(temp.path(), FakeRunner::new("01234,7\n"));
        let options = DecodeOptions {
            header: false,
            ..Default::default()
        };
        store.fetch(&sql("SELECT"), "h", None, &options).unwrap();

        fs::write(store.cache_dir().join("h.json"), r#"{"zip":"text"}"#).unwrap();
        let err = store.fetch(&sql("SELECT"), "h", None, &options).unwrap_err();

        assert!(matches!(
            err,
            CacheError::Decode {
                source: crate::core::table::DecodeError::Width { expected: 1, found: 2 },
                ..
            }
        ));
        assert_eq!(store.runner().calls(), 1);
    }

    #[test]
    fn test_key_locks_are_released_after_fetch() {
        let temp = tempdir().unwrap();
        let store = store_in(temp.path(), FakeRunner::new(CSV));
        let options = DecodeOptions::default();

        store.fetch(&sql("SELECT"), "a", None, &options).unwrap();
        store.fetch(&sql("SELECT"), "b", None, &options).unwrap();
        store.forget("a").unwrap();

        assert_eq!(store.locks.len(), 0);
    }

    #[test]
    fn test_entries_and_forget() {
        let temp = tempdir().unwrap();
        let store = store_in(temp.path(), FakeRunner::new(CSV));
        assert!(store.entries().unwrap().is_empty());

        let options = DecodeOptions::default();
        store.fetch(&sql("SELECT"), "a", None, &options).unwrap();
        store.fetch(&sql("SELECT"), "b", None, &options).unwrap();
        fs::remove_file(store.cache_dir().join("b.json")).unwrap();

        let entries = store.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].key, "a");
        assert_eq!(entries[0].state, EntryState::Complete);
        assert!(entries[0].size.unwrap() > 0);
        assert_eq!(entries[1].state, EntryState::Partial);

        assert!(store.forget("a").unwrap());
        assert!(!store.forget("a").unwrap());
        assert_eq!(store.entries().unwrap().len(), 1);
    }
}

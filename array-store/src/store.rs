//! The [`ArrayStore`] itself: an index of `(offset, identifier)` records over a
//! data file of array blobs.

use log::{debug, warn};
use ndarray::{Array2, ArrayBase, ArrayD, Data, Dimension, Ix2};
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::codec::{self, StoreElement};
use crate::error::{StoreError, StoreResult};

/// Extension of the blob file.
pub const DATA_EXTENSION: &str = "dat";
/// Extension of the index file.
pub const MAP_EXTENSION: &str = "map";

/// How an [`ArrayStore`] is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    /// Create or truncate both files and start with an empty index.
    Store,
    /// Require both files and read the index into memory.
    Load,
}

/// One index entry: where a blob starts in the data file and its identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbRecord {
    pub offset: u64,
    pub identifier: String,
}

/// Append-only named array database backed by `<name>.dat` and `<name>.map`.
///
/// The in-memory index mirrors the index file: every successful [`dump`]
/// appends the index line before the blob, so a record is never visible in
/// memory without its line on disk.
///
/// [`dump`]: ArrayStore::dump
#[derive(Debug, Clone)]
pub struct ArrayStore {
    name: PathBuf,
    data_path: PathBuf,
    map_path: PathBuf,
    records: Vec<DbRecord>,
}

/// `name` + `.` + `ext`, without replacing any extension `name` already has.
fn sibling_path(name: &Path, ext: &str) -> PathBuf {
    let mut path = OsString::from(name.as_os_str());
    path.push(".");
    path.push(ext);
    PathBuf::from(path)
}

fn validate_identifier(identifier: &str) -> StoreResult<()> {
    let untrimmed = identifier.trim() == identifier;
    let single_line = !identifier.contains(['\n', '\r']);
    if identifier.is_empty() || !untrimmed || !single_line {
        return Err(StoreError::InvalidIdentifier(identifier.to_string()));
    }
    Ok(())
}

/// Parse `offset<whitespace>identifier`. Internal whitespace of the identifier
/// is kept as written.
fn parse_index_line(line_no: usize, line: &str) -> StoreResult<DbRecord> {
    let malformed = || StoreError::MalformedIndex {
        line: line_no,
        content: line.to_string(),
    };

    let trimmed = line.trim();
    let (offset, identifier) = trimmed.split_once(char::is_whitespace).ok_or_else(malformed)?;
    let offset = offset.parse::<u64>().map_err(|_| malformed())?;
    let identifier = identifier.trim();
    if identifier.is_empty() {
        return Err(malformed());
    }

    Ok(DbRecord {
        offset,
        identifier: identifier.to_string(),
    })
}

/// Truncate `file` back to `len` after a failed append.
fn rollback(file: &File, len: u64, path: &Path) {
    if let Err(e) = file.set_len(len) {
        warn!("Could not roll {} back to {} bytes: {}", path.display(), len, e);
    }
}

impl ArrayStore {
    /// Open a store in the given mode.
    pub fn new(name: impl AsRef<Path>, mode: StoreMode) -> StoreResult<Self> {
        match mode {
            StoreMode::Store => Self::create(name),
            StoreMode::Load => Self::open(name),
        }
    }

    /// Store mode: bring both files into existence, truncating any old content.
    pub fn create(name: impl AsRef<Path>) -> StoreResult<Self> {
        let name = name.as_ref().to_path_buf();
        let data_path = sibling_path(&name, DATA_EXTENSION);
        let map_path = sibling_path(&name, MAP_EXTENSION);

        File::create(&data_path)?;
        File::create(&map_path)?;
        debug!("Created array store at {}", name.display());

        Ok(Self {
            name,
            data_path,
            map_path,
            records: Vec::new(),
        })
    }

    /// Load mode: both files must exist; the whole index is parsed up front.
    pub fn open(name: impl AsRef<Path>) -> StoreResult<Self> {
        let name = name.as_ref().to_path_buf();
        let data_path = sibling_path(&name, DATA_EXTENSION);
        let map_path = sibling_path(&name, MAP_EXTENSION);

        if !data_path.is_file() || !map_path.is_file() {
            return Err(StoreError::MissingStore {
                data: data_path,
                map: map_path,
            });
        }

        let reader = BufReader::new(File::open(&map_path)?);
        let mut records: Vec<DbRecord> = Vec::new();
        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record = parse_index_line(idx + 1, &line)?;
            if let Some(prev) = records.last() {
                if record.offset <= prev.offset {
                    return Err(StoreError::MalformedIndex {
                        line: idx + 1,
                        content: line,
                    });
                }
            }
            records.push(record);
        }

        debug!(
            "Opened array store at {} with {} records",
            name.display(),
            records.len()
        );

        Ok(Self {
            name,
            data_path,
            map_path,
            records,
        })
    }

    /// Append `array` under `identifier` and return the blob's offset.
    ///
    /// Identifiers may repeat; no uniqueness check is made.
    pub fn dump<T, S, D>(&mut self, array: &ArrayBase<S, D>, identifier: &str) -> StoreResult<u64>
    where
        T: StoreElement,
        S: Data<Elem = T>,
        D: Dimension,
    {
        validate_identifier(identifier)?;

        let blob = codec::encode(array);
        let mut data = OpenOptions::new().append(true).open(&self.data_path)?;
        let offset = data.metadata()?.len();

        if let Some(prev) = self.records.last() {
            if offset <= prev.offset {
                return Err(StoreError::CorruptRecord(format!(
                    "data file shrank below last record at offset {}",
                    prev.offset
                )));
            }
        }

        let mut map = OpenOptions::new().append(true).open(&self.map_path)?;
        let map_len = map.metadata()?.len();
        let line = format!("{offset}\t\t {identifier}\n");
        if let Err(e) = map.write_all(line.as_bytes()).and_then(|()| map.flush()) {
            rollback(&map, map_len, &self.map_path);
            return Err(e.into());
        }
        self.records.push(DbRecord {
            offset,
            identifier: identifier.to_string(),
        });

        // A failed blob write takes its index line with it
        if let Err(e) = data.write_all(&blob).and_then(|()| data.flush()) {
            self.records.pop();
            rollback(&map, map_len, &self.map_path);
            rollback(&data, offset, &self.data_path);
            return Err(e.into());
        }

        debug!(
            "Dumped {} bytes as {:?} at offset {} in {}",
            blob.len(),
            identifier,
            offset,
            self.name.display()
        );
        Ok(offset)
    }

    /// First record whose identifier matches exactly, in insertion order.
    pub fn locate(&self, identifier: &str) -> StoreResult<&DbRecord> {
        self.records
            .iter()
            .find(|record| record.identifier == identifier)
            .ok_or_else(|| StoreError::NotFound(identifier.to_string()))
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.locate(identifier).is_ok()
    }

    /// Read back the array stored under `identifier` together with the matched identifier.
    pub fn load<T: StoreElement>(&self, identifier: &str) -> StoreResult<(ArrayD<T>, String)> {
        let record = self.locate(identifier)?;

        let mut file = File::open(&self.data_path)?;
        file.seek(SeekFrom::Start(record.offset))?;
        let array = codec::decode::<T, _>(&mut BufReader::new(file))?;

        Ok((array, record.identifier.clone()))
    }

    /// [`load`](ArrayStore::load) for arrays known to be 2D.
    pub fn load_array2<T: StoreElement>(&self, identifier: &str) -> StoreResult<Array2<T>> {
        let (array, _) = self.load::<T>(identifier)?;
        Ok(array.into_dimensionality::<Ix2>()?)
    }

    pub fn records(&self) -> &[DbRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn name(&self) -> &Path {
        &self.name
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    pub fn map_path(&self) -> &Path {
        &self.map_path
    }

    /// Delete both backing files. Files that are already gone are ignored.
    pub fn remove_files(self) -> StoreResult<()> {
        for path in [&self.data_path, &self.map_path] {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        debug!("Removed array store at {}", self.name.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{array, Array2};
    use num_complex::Complex64;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> ArrayStore {
        ArrayStore::create(dir.path().join("cache")).unwrap()
    }

    #[test]
    fn test_create_makes_both_files() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        assert!(store.data_path().ends_with("cache.dat"));
        assert!(store.map_path().ends_with("cache.map"));
        assert!(store.data_path().is_file());
        assert!(store.map_path().is_file());
        assert!(store.is_empty());
    }

    #[test]
    fn test_existing_extension_is_kept() {
        let dir = TempDir::new().unwrap();
        let store = ArrayStore::create(dir.path().join("img.fits")).unwrap();
        assert!(store.data_path().ends_with("img.fits.dat"));
    }

    #[test]
    fn test_dump_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);

        let a = Array2::from_shape_fn((5, 7), |(r, c)| r as f64 * 0.5 - c as f64);
        store.dump(&a, "psf basis").unwrap();

        let (loaded, id) = store.load::<f64>("psf basis").unwrap();
        assert_eq!(id, "psf basis");
        assert_eq!(loaded.into_dimensionality::<Ix2>().unwrap(), a);
    }

    #[test]
    fn test_first_occurrence_wins() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);

        let first = array![[1.0_f64, 2.0], [3.0, 4.0]];
        let other = array![[9.0_f64]];
        let second = array![[-1.0_f64, -2.0], [-3.0, -4.0]];

        let off_a = store.dump(&first, "a").unwrap();
        let off_b = store.dump(&other, "b").unwrap();
        let off_a2 = store.dump(&second, "a").unwrap();

        assert_eq!(off_a, 0);
        assert!(off_a < off_b && off_b < off_a2);
        assert_eq!(store.locate("a").unwrap().offset, off_a);
        assert_eq!(store.load_array2::<f64>("a").unwrap(), first);
        assert_eq!(store.load_array2::<f64>("b").unwrap(), other);
    }

    #[test]
    fn test_locate_unknown_identifier() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);
        store.dump(&array![1.0_f64], "present").unwrap();

        assert!(matches!(store.locate("absent"), Err(StoreError::NotFound(id)) if id == "absent"));
        assert!(matches!(
            store.load::<f64>("absent"),
            Err(StoreError::NotFound(_))
        ));
        // Only exact matches count
        assert!(store.locate("presen").is_err());
        assert!(store.contains("present"));
    }

    #[test]
    fn test_open_requires_both_files() {
        let dir = TempDir::new().unwrap();
        let name = dir.path().join("partial");

        let err = ArrayStore::open(&name).unwrap_err();
        assert!(matches!(err, StoreError::MissingStore { .. }));

        File::create(sibling_path(&name, DATA_EXTENSION)).unwrap();
        let err = ArrayStore::new(&name, StoreMode::Load).unwrap_err();
        assert!(matches!(err, StoreError::MissingStore { .. }));

        File::create(sibling_path(&name, MAP_EXTENSION)).unwrap();
        assert!(ArrayStore::open(&name).unwrap().is_empty());
    }

    #[test]
    fn test_reopen_reads_full_index() {
        let dir = TempDir::new().unwrap();
        let name = dir.path().join("db");
        let mut store = ArrayStore::new(&name, StoreMode::Store).unwrap();

        for i in 0..4 {
            let a = Array2::from_elem((3, 3), i as f64);
            store.dump(&a, &format!("frame {i}")).unwrap();
        }
        store.dump(&array![true, false], "frame 0").unwrap();
        let written = store.records().to_vec();
        drop(store);

        let reopened = ArrayStore::open(&name).unwrap();
        assert_eq!(reopened.len(), 5);
        assert_eq!(reopened.records(), written.as_slice());

        let frame2 = reopened.load_array2::<f64>("frame 2").unwrap();
        assert_relative_eq!(frame2[[1, 1]], 2.0);
    }

    #[test]
    fn test_mixed_element_types() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);

        let spectrum = array![[Complex64::new(1.0, 2.0), Complex64::new(-0.5, 0.0)]];
        let mask = array![[false, true]];
        store.dump(&spectrum, "s_hat").unwrap();
        store.dump(&mask, "mask").unwrap();

        assert_eq!(store.load_array2::<Complex64>("s_hat").unwrap(), spectrum);
        assert_eq!(store.load_array2::<bool>("mask").unwrap(), mask);
        assert!(matches!(
            store.load::<f64>("mask"),
            Err(StoreError::DtypeMismatch { .. })
        ));
    }

    #[test]
    fn test_invalid_identifiers_rejected() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);
        let a = array![1.0_f64];

        for bad in ["", " lead", "trail ", "two\nlines"] {
            assert!(matches!(
                store.dump(&a, bad),
                Err(StoreError::InvalidIdentifier(_))
            ));
        }
        assert!(store.is_empty());
    }

    #[test]
    fn test_malformed_index() {
        let dir = TempDir::new().unwrap();
        let name = dir.path().join("bad");
        File::create(sibling_path(&name, DATA_EXTENSION)).unwrap();

        std::fs::write(sibling_path(&name, MAP_EXTENSION), "0\t\t a\nxyz b\n").unwrap();
        assert!(matches!(
            ArrayStore::open(&name),
            Err(StoreError::MalformedIndex { line: 2, .. })
        ));

        std::fs::write(sibling_path(&name, MAP_EXTENSION), "10\t\t a\n10\t\t b\n").unwrap();
        assert!(matches!(
            ArrayStore::open(&name),
            Err(StoreError::MalformedIndex { line: 2, .. })
        ));
    }

    #[test]
    fn test_index_file_format() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);
        store.dump(&array![1.0_f64], "first").unwrap();
        let second_offset = store.dump(&array![2.0_f64], "second one").unwrap();

        let map = std::fs::read_to_string(store.map_path()).unwrap();
        assert_eq!(map, format!("0\t\t first\n{second_offset}\t\t second one\n"));
    }

    #[test]
    fn test_create_truncates_existing_store() {
        let dir = TempDir::new().unwrap();
        let name = dir.path().join("db");
        let mut store = ArrayStore::create(&name).unwrap();
        store.dump(&array![1.0_f64], "old").unwrap();

        let store = ArrayStore::create(&name).unwrap();
        assert!(store.is_empty());
        assert_eq!(std::fs::metadata(store.data_path()).unwrap().len(), 0);
        assert!(ArrayStore::open(&name).unwrap().is_empty());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_failed_blob_write_leaves_store_usable() {
        let dir = TempDir::new().unwrap();
        let name = dir.path().join("db");
        let mut store = ArrayStore::create(&name).unwrap();

        // Every write to /dev/full fails with ENOSPC
        std::fs::remove_file(store.data_path()).unwrap();
        std::os::unix::fs::symlink("/dev/full", store.data_path()).unwrap();
        let err = store.dump(&array![1.0_f64, 2.0], "a").unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));
        assert!(store.is_empty());
        assert_eq!(std::fs::read_to_string(store.map_path()).unwrap(), "");

        std::fs::remove_file(store.data_path()).unwrap();
        std::fs::File::create(store.data_path()).unwrap();
        assert_eq!(store.dump(&array![3.0_f64], "b").unwrap(), 0);
        assert_eq!(
            std::fs::read_to_string(store.map_path()).unwrap(),
            "0\t\t b\n"
        );

        let reopened = ArrayStore::open(&name).unwrap();
        assert_eq!(reopened.len(), 1);
        assert!(!reopened.contains("a"));
        let (b, _) = reopened.load::<f64>("b").unwrap();
        assert_eq!(b[0], 3.0);
    }

    #[test]
    fn test_remove_files() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let data = store.data_path().to_path_buf();
        let map = store.map_path().to_path_buf();

        store.remove_files().unwrap();
        assert!(!data.exists());
        assert!(!map.exists());
    }
}

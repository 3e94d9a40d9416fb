// Inventory counters, the store trait, and the mmap-backed persistent store.
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use fs2::FileExt;
use libc::{EACCES, EPERM};
use memmap2::MmapMut;
use tracing::{info, warn};

use crate::core::error::{Error, ErrorKind};

/// Upper bound for any single counter and for any per-command amount.
pub const CEILING: u64 = 1_000_000_000_000_000_000;

const MARKER: i32 = i32::from_le_bytes(*b"ATOM");
const RECORD_SIZE: usize = 32;
const CARBON_OFF: usize = 0;
const OXYGEN_OFF: usize = 8;
const HYDROGEN_OFF: usize = 16;
const MARKER_OFF: usize = 24;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Atom {
    Carbon,
    Oxygen,
    Hydrogen,
}

impl Atom {
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "CARBON" => Some(Self::Carbon),
            "OXYGEN" => Some(Self::Oxygen),
            "HYDROGEN" => Some(Self::Hydrogen),
            _ => None,
        }
    }
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Carbon => "CARBON",
            Self::Oxygen => "OXYGEN",
            Self::Hydrogen => "HYDROGEN",
        };
        f.write_str(name)
    }
}

/// Counter triple; doubles as a requirement vector for recipes.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Inventory {
    pub carbon: u64,
    pub oxygen: u64,
    pub hydrogen: u64,
}

impl Inventory {
    pub fn new(carbon: u64, oxygen: u64, hydrogen: u64) -> Self {
        Self {
            carbon,
            oxygen,
            hydrogen,
        }
    }

    pub fn get(&self, atom: Atom) -> u64 {
        match atom {
            Atom::Carbon => self.carbon,
            Atom::Oxygen => self.oxygen,
            Atom::Hydrogen => self.hydrogen,
        }
    }

    pub fn within_ceiling(&self) -> bool {
        self.carbon <= CEILING && self.oxygen <= CEILING && self.hydrogen <= CEILING
    }

    fn checked_add(&self, atom: Atom, amount: u64) -> Option<Self> {
        let mut next = *self;
        let slot = match atom {
            Atom::Carbon => &mut next.carbon,
            Atom::Oxygen => &mut next.oxygen,
            Atom::Hydrogen => &mut next.hydrogen,
        };
        let total = slot.checked_add(amount)?;
        if total > CEILING {
            return None;
        }
        *slot = total;
        Some(next)
    }

    fn checked_debit(&self, need: Inventory) -> Option<Self> {
        Some(Self {
            carbon: self.carbon.checked_sub(need.carbon)?,
            oxygen: self.oxygen.checked_sub(need.oxygen)?,
            hydrogen: self.hydrogen.checked_sub(need.hydrogen)?,
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StoreOutcome {
    /// Mutation applied; carries the counters as left by this mutation.
    Applied(Inventory),
    /// Pre-check failed (ceiling or stock); nothing was changed.
    Rejected,
}

/// Store contract shared by the persistent and in-memory backends.
///
/// Mutations are indivisible with respect to every other mutator of the same
/// store, including one in another process sharing the backing file.
pub trait InventoryStore {
    fn try_add(&self, atom: Atom, amount: u64) -> Result<StoreOutcome, Error>;
    fn try_debit(&self, need: Inventory) -> Result<StoreOutcome, Error>;
    fn snapshot(&self) -> Result<Inventory, Error>;
}

pub struct FileStore {
    path: PathBuf,
    inner: Mutex<FileStoreInner>,
}

struct FileStoreInner {
    file: File,
    mmap: MmapMut,
}

impl FileStore {
    /// Opens the backing file, creating and initializing it from `defaults`
    /// when absent. An unreadable record (bad marker, short file, counter
    /// above the ceiling) is reinitialized from `defaults`, never merged.
    pub fn open(path: impl AsRef<Path>, defaults: Inventory) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| Error::new(ErrorKind::Io).with_path(&path).with_source(err))?;

        // First-use init races with other processes opening the same file,
        // so the whole open-or-init step runs under the file lock.
        let lock = acquire_lock(&file, &path)?;

        let len = file
            .metadata()
            .map(|meta| meta.len())
            .map_err(|err| Error::new(ErrorKind::Io).with_path(&path).with_source(err))?;
        let fresh = len == 0;
        if len < RECORD_SIZE as u64 {
            file.set_len(RECORD_SIZE as u64)
                .map_err(|err| Error::new(ErrorKind::Io).with_path(&path).with_source(err))?;
        }

        let mut mmap = unsafe {
            MmapMut::map_mut(&file)
                .map_err(|err| Error::new(ErrorKind::Io).with_path(&path).with_source(err))?
        };

        let needs_init = if fresh {
            true
        } else if len < RECORD_SIZE as u64 {
            warn!(path = %path.display(), "save file truncated, reinitializing");
            true
        } else {
            match decode_record(&mmap) {
                Ok(_) => false,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "save file unreadable, reinitializing");
                    true
                }
            }
        };

        if needs_init {
            write_record(&mut mmap, defaults);
            flush_record(&mmap, &path);
            if fresh {
                info!(path = %path.display(), "initialized inventory save file");
            }
        }
        drop(lock);

        Ok(Self {
            path,
            inner: Mutex::new(FileStoreInner { file, mmap }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl InventoryStore for FileStore {
    fn try_add(&self, atom: Atom, amount: u64) -> Result<StoreOutcome, Error> {
        let mut inner = self.inner.lock().unwrap_or_else(|err| err.into_inner());
        let inner = &mut *inner;
        let _lock = acquire_lock(&inner.file, &self.path)?;
        let current = read_record(&inner.mmap);
        let Some(next) = current.checked_add(atom, amount) else {
            return Ok(StoreOutcome::Rejected);
        };
        write_record(&mut inner.mmap, next);
        flush_record(&inner.mmap, &self.path);
        Ok(StoreOutcome::Applied(next))
    }

    fn try_debit(&self, need: Inventory) -> Result<StoreOutcome, Error> {
        let mut inner = self.inner.lock().unwrap_or_else(|err| err.into_inner());
        let inner = &mut *inner;
        let _lock = acquire_lock(&inner.file, &self.path)?;
        let current = read_record(&inner.mmap);
        let Some(next) = current.checked_debit(need) else {
            return Ok(StoreOutcome::Rejected);
        };
        write_record(&mut inner.mmap, next);
        flush_record(&inner.mmap, &self.path);
        Ok(StoreOutcome::Applied(next))
    }

    fn snapshot(&self) -> Result<Inventory, Error> {
        let inner = self.inner.lock().unwrap_or_else(|err| err.into_inner());
        let _lock = acquire_lock(&inner.file, &self.path)?;
        Ok(read_record(&inner.mmap))
    }
}

/// Volatile store with the same contract; backs protocol-level tests that
/// have no use for a file on disk.
pub struct MemoryStore {
    counters: Mutex<Inventory>,
}

impl MemoryStore {
    pub fn new(initial: Inventory) -> Self {
        Self {
            counters: Mutex::new(initial),
        }
    }
}

impl InventoryStore for MemoryStore {
    fn try_add(&self, atom: Atom, amount: u64) -> Result<StoreOutcome, Error> {
        let mut counters = self.counters.lock().unwrap_or_else(|err| err.into_inner());
        match counters.checked_add(atom, amount) {
            Some(next) => {
                *counters = next;
                Ok(StoreOutcome::Applied(next))
            }
            None => Ok(StoreOutcome::Rejected),
        }
    }

    fn try_debit(&self, need: Inventory) -> Result<StoreOutcome, Error> {
        let mut counters = self.counters.lock().unwrap_or_else(|err| err.into_inner());
        match counters.checked_debit(need) {
            Some(next) => {
                *counters = next;
                Ok(StoreOutcome::Applied(next))
            }
            None => Ok(StoreOutcome::Rejected),
        }
    }

    fn snapshot(&self) -> Result<Inventory, Error> {
        Ok(*self.counters.lock().unwrap_or_else(|err| err.into_inner()))
    }
}

struct StoreLock<'a> {
    file: &'a File,
}

impl<'a> Drop for StoreLock<'a> {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

fn acquire_lock<'a>(file: &'a File, path: &Path) -> Result<StoreLock<'a>, Error> {
    file.lock_exclusive().map_err(|err| {
        Error::new(lock_error_kind(&err))
            .with_path(path)
            .with_source(err)
    })?;
    Ok(StoreLock { file })
}

fn lock_error_kind(err: &io::Error) -> ErrorKind {
    let errno = err.raw_os_error().unwrap_or_default();
    if errno == EACCES || errno == EPERM {
        return ErrorKind::Permission;
    }
    match err.kind() {
        io::ErrorKind::WouldBlock => ErrorKind::Busy,
        io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        _ => ErrorKind::Io,
    }
}

fn read_record(mmap: &MmapMut) -> Inventory {
    Inventory {
        carbon: read_u64(mmap, CARBON_OFF),
        oxygen: read_u64(mmap, OXYGEN_OFF),
        hydrogen: read_u64(mmap, HYDROGEN_OFF),
    }
}

fn write_record(mmap: &mut MmapMut, counters: Inventory) {
    mmap[0..RECORD_SIZE].copy_from_slice(&encode_record(counters));
}

// Flush is best-effort: the mapped write is already visible to other
// processes, so a failed msync is reported, not rolled back.
fn flush_record(mmap: &MmapMut, path: &Path) {
    if let Err(err) = mmap.flush() {
        warn!(path = %path.display(), error = %err, "save file flush failed");
    }
}

fn encode_record(counters: Inventory) -> [u8; RECORD_SIZE] {
    let mut buf = [0u8; RECORD_SIZE];
    write_u64(&mut buf, CARBON_OFF, counters.carbon);
    write_u64(&mut buf, OXYGEN_OFF, counters.oxygen);
    write_u64(&mut buf, HYDROGEN_OFF, counters.hydrogen);
    buf[MARKER_OFF..MARKER_OFF + 4].copy_from_slice(&MARKER.to_le_bytes());
    buf
}

fn decode_record(buf: &[u8]) -> Result<Inventory, Error> {
    if buf.len() < RECORD_SIZE {
        return Err(Error::new(ErrorKind::Corrupt).with_message("record too small"));
    }
    let marker = i32::from_le_bytes(read_4(buf, MARKER_OFF));
    if marker != MARKER {
        return Err(Error::new(ErrorKind::Corrupt).with_message("bad record marker"));
    }
    let counters = Inventory {
        carbon: read_u64(buf, CARBON_OFF),
        oxygen: read_u64(buf, OXYGEN_OFF),
        hydrogen: read_u64(buf, HYDROGEN_OFF),
    };
    if !counters.within_ceiling() {
        return Err(Error::new(ErrorKind::Corrupt).with_message("counter above storage limit"));
    }
    Ok(counters)
}

fn read_4(buf: &[u8], offset: usize) -> [u8; 4] {
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[offset..offset + 4]);
    out
}

fn read_8(buf: &[u8], offset: usize) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&buf[offset..offset + 8]);
    out
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(read_8(buf, offset))
}

fn write_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicI32, Ordering},
    },
};

use crate::{MountSet, Recording, error::VbsError, mark6};

/// How to interpret a seek offset; mirrors lseek(2).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

/// Descriptor table fronting [`Recording`] with a Unix-flavoured
/// open/read/lseek/close API.
///
/// Descriptors start at [`FD_BASE`], far above any id the OS will hand out,
/// so code that mixes them with raw file descriptors cannot collide.
/// Descriptors are independent: reads on two descriptors only contend on
/// the brief table lookup, never on each other's I/O.
///
/// [`FD_BASE`]: VbsTable::FD_BASE
pub struct VbsTable {
    mounts: Mutex<MountSet>,
    open: Mutex<HashMap<i32, Arc<Mutex<Recording>>>>,
    next_fd: AtomicI32,
}

impl Default for VbsTable {
    fn default() -> Self {
        Self::new()
    }
}

impl VbsTable {
    pub const FD_BASE: i32 = 0x4000_0000;

    pub fn new() -> Self {
        Self {
            mounts: Mutex::new(MountSet::default()),
            open: Mutex::new(HashMap::new()),
            next_fd: AtomicI32::new(Self::FD_BASE),
        }
    }

    /// Scan `rootdir` for `disk<number>` mountpoints. Fails while any
    /// descriptor is open.
    pub fn init(&self, rootdir: &Path) -> Result<(), VbsError> {
        self.replace_mounts(MountSet::scan(rootdir)?)
    }

    /// Use the given directories as mountpoints directly.
    pub fn init_explicit(&self, dirs: Vec<PathBuf>) -> Result<(), VbsError> {
        self.replace_mounts(MountSet::explicit(dirs)?)
    }

    fn replace_mounts(&self, mounts: MountSet) -> Result<(), VbsError> {
        if !self.open.lock().unwrap().is_empty() {
            return Err(VbsError::Busy);
        }
        *self.mounts.lock().unwrap() = mounts;
        Ok(())
    }

    pub fn mounts(&self) -> MountSet {
        self.mounts.lock().unwrap().clone()
    }

    pub fn open_count(&self) -> usize {
        self.open.lock().unwrap().len()
    }

    pub fn open(&self, recname: &str) -> Result<i32, VbsError> {
        let rec = Recording::open(&self.mounts(), recname)?;
        Ok(self.install(rec))
    }

    pub fn open_mark6(&self, recname: &str) -> Result<i32, VbsError> {
        let rec = mark6::open(&self.mounts(), recname)?;
        Ok(self.install(rec))
    }

    fn install(&self, rec: Recording) -> i32 {
        let fd = self.next_fd.fetch_add(1, Ordering::Relaxed);
        self.open.lock().unwrap().insert(fd, Arc::new(Mutex::new(rec)));
        fd
    }

    fn lookup(&self, fd: i32) -> Result<Arc<Mutex<Recording>>, VbsError> {
        self.open
            .lock()
            .unwrap()
            .get(&fd)
            .cloned()
            .ok_or(VbsError::BadDescriptor(fd))
    }

    pub fn read(&self, fd: i32, buf: &mut [u8]) -> Result<usize, VbsError> {
        let rec = self.lookup(fd)?;
        let mut rec = rec.lock().unwrap();
        rec.read(buf)
    }

    pub fn lseek(&self, fd: i32, offset: i64, whence: Whence) -> Result<u64, VbsError> {
        let rec = self.lookup(fd)?;
        let mut rec = rec.lock().unwrap();
        Ok(rec.seek(offset, whence))
    }

    pub fn size(&self, fd: i32) -> Result<u64, VbsError> {
        Ok(self.lookup(fd)?.lock().unwrap().size())
    }

    pub fn close(&self, fd: i32) -> Result<(), VbsError> {
        self.open
            .lock()
            .unwrap()
            .remove(&fd)
            .map(|_| ())
            .ok_or(VbsError::BadDescriptor(fd))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn fixture() -> (tempfile::TempDir, VbsTable) {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("disk0")).unwrap();
        let dir = tmp.path().join("disk0/rec");
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(dir.join("rec.00000000"), vec![7u8; 100]).unwrap();
        let table = VbsTable::new();
        table.init(tmp.path()).unwrap();
        (tmp, table)
    }

    #[test]
    fn descriptors_live_in_their_own_range() {
        let (_tmp, table) = fixture();
        let fd = table.open("rec").unwrap();
        assert!(fd >= VbsTable::FD_BASE);
        assert_eq!(table.size(fd).unwrap(), 100);
        table.close(fd).unwrap();
        assert!(matches!(table.read(fd, &mut [0; 4]), Err(VbsError::BadDescriptor(_))));
    }

    #[test]
    fn reinit_refused_while_open() {
        let (tmp, table) = fixture();
        let fd = table.open("rec").unwrap();
        assert!(matches!(table.init(tmp.path()), Err(VbsError::Busy)));
        table.close(fd).unwrap();
        table.init(tmp.path()).unwrap();
    }

    #[test]
    fn descriptors_are_independent() {
        let (_tmp, table) = fixture();
        let a = table.open("rec").unwrap();
        let b = table.open("rec").unwrap();
        table.lseek(a, 90, Whence::Set).unwrap();
        let mut buf = [0u8; 10];
        assert_eq!(table.read(b, &mut buf).unwrap(), 10);
        assert_eq!(table.read(a, &mut buf).unwrap(), 10);
        assert_eq!(table.read(a, &mut buf).unwrap(), 0);
    }
}

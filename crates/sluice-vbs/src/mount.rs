use std::{
    ffi::CString,
    io,
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
};

use tracing::{debug, warn};

use crate::error::VbsError;

/// Aggregate capacity over a set of mountpoints, for the `dir_info?` query.
#[derive(Clone, Copy, Debug, Default)]
pub struct MountInfo {
    pub total_bytes: u64,
    pub free_bytes: u64,
}

/// The disks a recording is striped over.
#[derive(Clone, Debug, Default)]
pub struct MountSet {
    roots: Vec<PathBuf>,
}

impl MountSet {
    /// Scan `rootdir` for entries named `disk<number>` and treat each as a
    /// storage mountpoint.
    pub fn scan(rootdir: &Path) -> Result<Self, VbsError> {
        let mut roots = Vec::new();
        for entry in std::fs::read_dir(rootdir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let is_disk = name
                .strip_prefix("disk")
                .is_some_and(|d| !d.is_empty() && d.bytes().all(|b| b.is_ascii_digit()));
            if is_disk && entry.file_type()?.is_dir() {
                roots.push(entry.path());
            }
        }
        if roots.is_empty() {
            return Err(VbsError::NoMounts(rootdir.display().to_string()));
        }
        roots.sort();
        debug!(n = roots.len(), root = %rootdir.display(), "mountpoints scanned");
        Ok(Self { roots })
    }

    /// Take the given paths as mountpoints directly, without the
    /// `disk<number>` convention.
    pub fn explicit(dirs: Vec<PathBuf>) -> Result<Self, VbsError> {
        for d in &dirs {
            if !d.is_dir() {
                return Err(VbsError::NoMounts(d.display().to_string()));
            }
        }
        if dirs.is_empty() {
            return Err(VbsError::NoMounts(String::from("<empty list>")));
        }
        Ok(Self { roots: dirs })
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Sum filesystem capacity over the mountpoints via statvfs(3).
    pub fn info(&self) -> MountInfo {
        let mut acc = MountInfo::default();
        for root in &self.roots {
            match statvfs(root) {
                Ok((total, free)) => {
                    acc.total_bytes += total;
                    acc.free_bytes += free;
                }
                Err(err) => warn!(?err, root = %root.display(), "statvfs failed"),
            }
        }
        acc
    }
}

fn statvfs(path: &Path) -> io::Result<(u64, u64)> {
    let cpath = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    let mut vfs: libc::statvfs = unsafe { std::mem::zeroed() };
    if unsafe { libc::statvfs(cpath.as_ptr(), &mut vfs) } != 0 {
        return Err(io::Error::last_os_error());
    }
    let frsize = vfs.f_frsize;
    Ok((vfs.f_blocks * frsize, vfs.f_bavail * frsize))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn scan_takes_only_disk_entries() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["disk0", "disk1", "disk12"] {
            std::fs::create_dir(dir.path().join(name)).unwrap();
        }
        std::fs::create_dir(dir.path().join("diskette")).unwrap();
        std::fs::create_dir(dir.path().join("spare")).unwrap();
        std::fs::write(dir.path().join("disk9"), b"a file, not a mount").unwrap();

        let mounts = MountSet::scan(dir.path()).unwrap();
        let names: Vec<_> =
            mounts.roots().iter().map(|p| p.file_name().unwrap().to_str().unwrap()).collect();
        assert_eq!(names, vec!["disk0", "disk1", "disk12"]);
    }

    #[test]
    fn empty_scan_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(MountSet::scan(dir.path()), Err(VbsError::NoMounts(_))));
    }

    #[test]
    fn statvfs_reports_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let mounts = MountSet::explicit(vec![dir.path().to_path_buf()]).unwrap();
        let info = mounts.info();
        assert!(info.total_bytes > 0);
        assert!(info.free_bytes <= info.total_bytes);
    }
}

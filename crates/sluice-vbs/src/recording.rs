use std::{
    fs::File,
    io,
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
};

use indexmap::IndexMap;
use tracing::{debug, warn};

use crate::{error::VbsError, mount::MountSet};

/// Open chunk files cached per recording; oldest-used evicted beyond this.
const OPEN_FILE_CAP: usize = 8;

/// One stretch of recorded bytes: a whole chunk file for VBS, one block of
/// a data file for Mark6.
#[derive(Clone, Debug)]
pub(crate) struct ChunkRef {
    pub path: PathBuf,
    pub seq: u32,
    /// Where the payload starts inside the file (0 for VBS chunks).
    pub file_offset: u64,
    pub size: u64,
    /// Cumulative offset of this chunk in the logical stream.
    pub logical: u64,
}

#[derive(Debug)]
struct OpenCache {
    files: IndexMap<usize, File>,
}

impl OpenCache {
    fn new() -> Self {
        Self { files: IndexMap::new() }
    }

    fn get(&mut self, idx: usize, path: &Path) -> io::Result<&File> {
        if let Some(pos) = self.files.get_index_of(&idx) {
            // refresh LRU position
            let (_, f) = self.files.shift_remove_index(pos).unwrap();
            self.files.insert(idx, f);
        } else {
            if self.files.len() >= OPEN_FILE_CAP {
                self.files.shift_remove_index(0);
            }
            self.files.insert(idx, File::open(path)?);
        }
        Ok(&self.files[&idx])
    }
}

/// Many chunk files on many spindles presented as one logical byte stream.
///
/// Not `Sync`: a descriptor is used from one thread at a time; independent
/// descriptors of the same recording do not share state.
#[derive(Debug)]
pub struct Recording {
    name: String,
    chunks: Vec<ChunkRef>,
    total: u64,
    pos: u64,
    cache: OpenCache,
}

impl Recording {
    /// Locate `recname` on every mountpoint and build the chunk index:
    /// enumerate `<mount>/<recname>/<recname>.<seqnr>` files, stat sizes,
    /// sort by sequence number and accumulate logical offsets.
    ///
    /// Duplicated sequence numbers make the recording unreadable; gaps only
    /// mean data loss and are reported.
    pub fn open(mounts: &MountSet, recname: &str) -> Result<Self, VbsError> {
        let mut chunks = Vec::new();
        for root in mounts.roots() {
            let dir = root.join(recname);
            if !dir.is_dir() {
                continue;
            }
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                let Some(seq) = chunk_seqnr(name, recname) else { continue };
                let size = entry.metadata()?.len();
                chunks.push(ChunkRef {
                    path: entry.path(),
                    seq,
                    file_offset: 0,
                    size,
                    logical: 0,
                });
            }
        }
        if chunks.is_empty() {
            return Err(VbsError::NotFound(recname.to_string()));
        }
        Self::assemble(recname, chunks)
    }

    /// Index pre-located chunks (the Mark6 open path lands here too).
    pub(crate) fn assemble(
        recname: &str,
        mut chunks: Vec<ChunkRef>,
    ) -> Result<Self, VbsError> {
        chunks.sort_by_key(|c| c.seq);
        let mut logical = 0u64;
        let mut prev: Option<u32> = None;
        for c in &mut chunks {
            match prev {
                Some(p) if c.seq == p => {
                    return Err(VbsError::DuplicateChunk {
                        rec: recname.to_string(),
                        seq: c.seq,
                    });
                }
                Some(p) if c.seq != p + 1 => {
                    warn!(
                        rec = recname,
                        after = p,
                        next = c.seq,
                        "gap in chunk sequence, data was lost"
                    );
                }
                _ => {}
            }
            prev = Some(c.seq);
            c.logical = logical;
            logical += c.size;
        }
        debug!(rec = recname, chunks = chunks.len(), bytes = logical, "recording indexed");
        Ok(Self {
            name: recname.to_string(),
            chunks,
            total: logical,
            pos: 0,
            cache: OpenCache::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.total
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Move the logical position; offsets beyond the recording clamp to its
    /// end, negative results clamp to zero. Involves no I/O.
    pub fn seek(&mut self, offset: i64, whence: super::Whence) -> u64 {
        let base = match whence {
            super::Whence::Set => 0,
            super::Whence::Cur => self.pos as i64,
            super::Whence::End => self.total as i64,
        };
        let target = base.saturating_add(offset).max(0) as u64;
        self.pos = target.min(self.total);
        self.pos
    }

    /// Read into `buf` from the current position, crossing chunk boundaries
    /// as needed. A short count is only returned at end-of-recording.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, VbsError> {
        let mut done = 0;
        while done < buf.len() && self.pos < self.total {
            // chunk covering pos: last one whose logical start is <= pos
            let idx = self
                .chunks
                .partition_point(|c| c.logical + c.size <= self.pos);
            let chunk = &self.chunks[idx];
            let within = self.pos - chunk.logical;
            let avail = (chunk.size - within) as usize;
            let want = avail.min(buf.len() - done);

            let file = self.cache.get(idx, &chunk.path)?;
            let n = file.read_at(
                &mut buf[done..done + want],
                chunk.file_offset + within,
            )?;
            if n == 0 {
                // file shorter than its stat said; treat as corrupt
                return Err(VbsError::Corrupt {
                    path: chunk.path.display().to_string(),
                    reason: format!("unexpected EOF at chunk offset {within}"),
                });
            }
            done += n;
            self.pos += n as u64;
        }
        Ok(done)
    }
}

fn chunk_seqnr(filename: &str, recname: &str) -> Option<u32> {
    let suffix = filename.strip_prefix(recname)?.strip_prefix('.')?;
    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok()
}

#[cfg(test)]
mod test {
    use std::path::Path;

    use super::*;
    use crate::Whence;

    fn write_chunk(root: &Path, rec: &str, seq: u32, data: &[u8]) {
        let dir = root.join(rec);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(format!("{rec}.{seq:08}")), data).unwrap();
    }

    fn fixture() -> (tempfile::TempDir, MountSet) {
        let tmp = tempfile::tempdir().unwrap();
        for d in ["disk0", "disk1"] {
            std::fs::create_dir(tmp.path().join(d)).unwrap();
        }
        let mounts = MountSet::scan(tmp.path()).unwrap();
        (tmp, mounts)
    }

    #[test]
    fn chunks_concatenate_across_mounts() {
        let (tmp, mounts) = fixture();
        // chunks deliberately spread over both disks, middle one on disk1
        write_chunk(&tmp.path().join("disk0"), "r1", 0, &vec![b'a'; 1000]);
        write_chunk(&tmp.path().join("disk1"), "r1", 1, &vec![b'b'; 800]);
        write_chunk(&tmp.path().join("disk0"), "r1", 2, &vec![b'c'; 500]);

        let mut rec = Recording::open(&mounts, "r1").unwrap();
        assert_eq!(rec.size(), 2300);
        assert_eq!(rec.chunk_count(), 3);

        rec.seek(900, Whence::Set);
        let mut buf = vec![0u8; 500];
        assert_eq!(rec.read(&mut buf).unwrap(), 500);
        assert!(buf[..100].iter().all(|&b| b == b'a'));
        assert!(buf[100..].iter().all(|&b| b == b'b'));
    }

    #[test]
    fn full_read_equals_concatenation() {
        let (tmp, mounts) = fixture();
        let parts: Vec<Vec<u8>> = (0u8..5)
            .map(|i| std::iter::repeat(i).take(64 * (i as usize + 1)).collect())
            .collect();
        for (i, p) in parts.iter().enumerate() {
            let disk = if i % 2 == 0 { "disk0" } else { "disk1" };
            write_chunk(&tmp.path().join(disk), "cat", i as u32, p);
        }

        let mut rec = Recording::open(&mounts, "cat").unwrap();
        let total = rec.size() as usize;
        let mut buf = vec![0u8; total + 10];
        assert_eq!(rec.read(&mut buf).unwrap(), total);
        let expect: Vec<u8> = parts.concat();
        assert_eq!(&buf[..total], &expect[..]);
        // at EOF, reads return zero
        assert_eq!(rec.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn seek_clamps_to_recording() {
        let (tmp, mounts) = fixture();
        write_chunk(&tmp.path().join("disk0"), "s", 0, &[1, 2, 3, 4]);
        let mut rec = Recording::open(&mounts, "s").unwrap();

        assert_eq!(rec.seek(100, Whence::Set), 4);
        let mut buf = [0u8; 4];
        assert_eq!(rec.read(&mut buf).unwrap(), 0);
        assert_eq!(rec.seek(-2, Whence::End), 2);
        assert_eq!(rec.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], &[3, 4]);
        assert_eq!(rec.seek(-100, Whence::Cur), 0);
    }

    #[test]
    fn duplicate_seqnr_is_rejected() {
        let (tmp, mounts) = fixture();
        write_chunk(&tmp.path().join("disk0"), "dup", 3, b"xxx");
        write_chunk(&tmp.path().join("disk1"), "dup", 3, b"yyy");
        assert!(matches!(
            Recording::open(&mounts, "dup"),
            Err(VbsError::DuplicateChunk { seq: 3, .. })
        ));
    }

    #[test]
    fn gaps_are_tolerated() {
        let (tmp, mounts) = fixture();
        write_chunk(&tmp.path().join("disk0"), "g", 0, &[0u8; 10]);
        write_chunk(&tmp.path().join("disk0"), "g", 4, &[1u8; 10]);
        let mut rec = Recording::open(&mounts, "g").unwrap();
        assert_eq!(rec.size(), 20);
        rec.seek(10, Whence::Set);
        let mut buf = [0u8; 10];
        assert_eq!(rec.read(&mut buf).unwrap(), 10);
        assert!(buf.iter().all(|&b| b == 1));
    }

    #[test]
    fn missing_recording_is_enoent() {
        let (_tmp, mounts) = fixture();
        let err = Recording::open(&mounts, "nope").unwrap_err();
        assert_eq!(err.os_errno(), libc::ENOENT);
    }

    #[test]
    fn many_chunks_cycle_the_open_file_cache() {
        let (tmp, mounts) = fixture();
        for seq in 0..30u32 {
            write_chunk(&tmp.path().join("disk0"), "many", seq, &[seq as u8; 16]);
        }
        let mut rec = Recording::open(&mounts, "many").unwrap();
        let mut buf = vec![0u8; 30 * 16];
        assert_eq!(rec.read(&mut buf).unwrap(), buf.len());
        for seq in 0..30 {
            assert!(buf[seq * 16..(seq + 1) * 16].iter().all(|&b| b == seq as u8));
        }
        // walk it again backwards so eviction and re-open both happen
        for seq in (0..30u32).rev() {
            rec.seek((seq as i64) * 16, Whence::Set);
            let mut one = [0u8; 16];
            assert_eq!(rec.read(&mut one).unwrap(), 16);
            assert!(one.iter().all(|&b| b == seq as u8));
        }
    }
}

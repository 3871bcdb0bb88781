use std::{
    fs::File,
    io::{Read, Seek, SeekFrom},
    path::Path,
};

use tracing::debug;

use crate::{MountSet, error::VbsError, recording::ChunkRef};

/// First word of every Mark6 scatter-gather data file.
pub const MK6_SYNC_WORD: u32 = 0xfeed_6666;

/// File-level header: 8-byte magic (sync word + version) followed by the
/// block size, packet format and packet size words.
const FILE_HEADER_LEN: u64 = 20;
/// Per-block header: sequence number + total block length.
const BLOCK_HEADER_LEN: u64 = 8;

fn read_u32(f: &mut File, buf: &mut [u8; 4]) -> std::io::Result<Option<u32>> {
    match f.read_exact(buf) {
        Ok(()) => Ok(Some(u32::from_le_bytes(*buf))),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e),
    }
}

/// Walk one Mark6 data file's block headers and emit a [`ChunkRef`] per
/// block payload.
fn index_file(path: &Path) -> Result<Vec<ChunkRef>, VbsError> {
    let corrupt = |reason: String| VbsError::Corrupt {
        path: path.display().to_string(),
        reason,
    };

    let mut f = File::open(path)?;
    let file_len = f.metadata()?.len();
    let mut w = [0u8; 4];

    let sync = read_u32(&mut f, &mut w)?.ok_or_else(|| corrupt("file too short".into()))?;
    if sync != MK6_SYNC_WORD {
        return Err(corrupt(format!("bad sync word {sync:#010x}")));
    }
    let version = read_u32(&mut f, &mut w)?.ok_or_else(|| corrupt("truncated header".into()))?;
    let block_size =
        read_u32(&mut f, &mut w)?.ok_or_else(|| corrupt("truncated header".into()))?;
    let _packet_format = read_u32(&mut f, &mut w)?;
    let _packet_size = read_u32(&mut f, &mut w)?;
    if version != 2 {
        return Err(corrupt(format!("unsupported version {version}")));
    }

    let mut chunks = Vec::new();
    let mut pos = FILE_HEADER_LEN;
    while pos + BLOCK_HEADER_LEN <= file_len {
        f.seek(SeekFrom::Start(pos))?;
        let seq = read_u32(&mut f, &mut w)?.ok_or_else(|| corrupt("truncated block".into()))?;
        let wb_len =
            read_u32(&mut f, &mut w)?.ok_or_else(|| corrupt("truncated block".into()))? as u64;
        if wb_len <= BLOCK_HEADER_LEN || wb_len > block_size as u64 {
            return Err(corrupt(format!("block {seq} has impossible length {wb_len}")));
        }
        if pos + wb_len > file_len {
            return Err(corrupt(format!("block {seq} runs past end of file")));
        }
        chunks.push(ChunkRef {
            path: path.to_path_buf(),
            seq,
            file_offset: pos + BLOCK_HEADER_LEN,
            size: wb_len - BLOCK_HEADER_LEN,
            logical: 0,
        });
        pos += wb_len;
    }
    debug!(path = %path.display(), blocks = chunks.len(), "mark6 file indexed");
    Ok(chunks)
}

/// Open a Mark6 recording: one data file named after the recording on each
/// mountpoint, block headers indexed into a single logical stream.
pub(crate) fn open(
    mounts: &MountSet,
    recname: &str,
) -> Result<crate::Recording, VbsError> {
    let mut chunks = Vec::new();
    for root in mounts.roots() {
        let path = root.join(recname);
        if path.is_file() {
            chunks.extend(index_file(&path)?);
        }
    }
    if chunks.is_empty() {
        return Err(VbsError::NotFound(recname.to_string()));
    }
    crate::Recording::assemble(recname, chunks)
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use super::*;
    use crate::{Whence, table::VbsTable};

    fn write_mk6_file(path: &Path, blocks: &[(u32, &[u8])]) {
        let mut f = File::create(path).unwrap();
        f.write_all(&MK6_SYNC_WORD.to_le_bytes()).unwrap();
        f.write_all(&2u32.to_le_bytes()).unwrap(); // version
        f.write_all(&1024u32.to_le_bytes()).unwrap(); // block size
        f.write_all(&0u32.to_le_bytes()).unwrap(); // packet format
        f.write_all(&0u32.to_le_bytes()).unwrap(); // packet size
        for (seq, payload) in blocks {
            f.write_all(&seq.to_le_bytes()).unwrap();
            f.write_all(&((payload.len() as u32 + 8).to_le_bytes())).unwrap();
            f.write_all(payload).unwrap();
        }
    }

    #[test]
    fn blocks_interleave_across_files() {
        let tmp = tempfile::tempdir().unwrap();
        for d in ["disk0", "disk1"] {
            std::fs::create_dir(tmp.path().join(d)).unwrap();
        }
        write_mk6_file(&tmp.path().join("disk0/exp"), &[(0, b"aaaa"), (2, b"cc")]);
        write_mk6_file(&tmp.path().join("disk1/exp"), &[(1, b"bbb")]);

        let mounts = MountSet::scan(tmp.path()).unwrap();
        let mut rec = open(&mounts, "exp").unwrap();
        assert_eq!(rec.size(), 9);

        let mut buf = vec![0u8; 9];
        assert_eq!(rec.read(&mut buf).unwrap(), 9);
        assert_eq!(&buf, b"aaaabbbcc");
    }

    #[test]
    fn bad_sync_word_is_corrupt() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("disk0")).unwrap();
        std::fs::write(tmp.path().join("disk0/bad"), b"not a mark6 file at all....")
            .unwrap();
        let mounts = MountSet::scan(tmp.path()).unwrap();
        let err = open(&mounts, "bad").unwrap_err();
        assert_eq!(err.os_errno(), libc::EIO);
    }

    #[test]
    fn table_serves_mark6_descriptors() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("disk0")).unwrap();
        write_mk6_file(&tmp.path().join("disk0/m6"), &[(0, b"0123456789")]);

        let table = VbsTable::new();
        table.init(tmp.path()).unwrap();
        let fd = table.open_mark6("m6").unwrap();
        assert!(fd >= VbsTable::FD_BASE);
        table.lseek(fd, 4, Whence::Set).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(table.read(fd, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"4567");
        table.close(fd).unwrap();
    }
}

use std::sync::Arc;

use sluice_communication::{Block, BlockPool, Bqueue};
use sluice_utils::{StageKind, boot_stage};
use sluice_vbs::{ChunkWriter, VbsTable, Whence};
use tracing::debug;

use crate::{
    chain::{StageCtx, StepError},
    steps::{CANCEL_POLL, is_wakeup},
};

/// Consumer persisting each block as the next chunk file of a recording.
/// The writer goes back into the args at stream end so the command layer
/// can read how much landed on disk.
pub struct DiskWriterArgs {
    pub writer: Option<ChunkWriter>,
}

pub fn disk_writer(
    inq: &Bqueue<Block>,
    ctx: &StageCtx<DiskWriterArgs>,
) -> Result<(), StepError> {
    let Some(mut writer) = ctx.wait_args(|a| a.writer.take()) else {
        return Ok(());
    };
    boot_stage(StageKind::DiskStreamer, None);

    let mut res = Ok(());
    while let Some(b) = inq.pop() {
        if ctx.cancelled() {
            break;
        }
        match writer.write_chunk(&b) {
            Ok(()) => ctx.count(b.len() as u64),
            Err(e) if is_wakeup(&e) && ctx.cancelled() => break,
            Err(e) => {
                res = Err(e.into());
                break;
            }
        }
    }
    debug!(rec = writer.recname(), bytes = writer.bytes_written(), "recording closed");
    ctx.with_args(|a| a.writer = Some(writer));
    res
}

/// Producer streaming a byte range of an opened recording into pool
/// blocks, one read-size chunk at a time.
pub struct DiskReaderArgs {
    pub table: Arc<VbsTable>,
    pub fd: i32,
    pub start: u64,
    /// Exclusive end offset; `None` reads to the end of the recording.
    pub end: Option<u64>,
    pub read_size: usize,
    pub pool: BlockPool,
    pub run: bool,
}

pub fn disk_reader(
    outq: &Bqueue<Block>,
    ctx: &StageCtx<DiskReaderArgs>,
) -> Result<(), StepError> {
    let Some((table, fd, start, end, read_size, pool)) = ctx.wait_args(|a| {
        a.run.then(|| {
            (Arc::clone(&a.table), a.fd, a.start, a.end, a.read_size, a.pool.clone())
        })
    }) else {
        return Ok(());
    };
    boot_stage(StageKind::DiskStreamer, None);

    let mut pos = table.lseek(fd, start as i64, Whence::Set)?;
    let read_size = read_size.max(1);

    'stream: loop {
        if ctx.cancelled() {
            break;
        }
        let Some(mut b) = pool.get_timeout(CANCEL_POLL) else { continue };

        let mut want = b.len();
        if let Some(end) = end {
            if pos >= end {
                break;
            }
            want = want.min((end - pos) as usize);
        }

        let mut filled = 0;
        let mut eof = false;
        if let Some(buf) = b.as_mut_slice() {
            while filled < want {
                let step = read_size.min(want - filled);
                match table.read(fd, &mut buf[filled..filled + step]) {
                    Ok(0) => {
                        eof = true;
                        break;
                    }
                    Ok(n) => filled += n,
                    Err(sluice_vbs::VbsError::Io(e)) if is_wakeup(&e) => {
                        if ctx.cancelled() {
                            break 'stream;
                        }
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        if filled > 0 {
            b.resize(filled);
            pos += filled as u64;
            let len = filled as u64;
            if !outq.push(b) {
                break;
            }
            ctx.count(len);
        }
        if eof {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::chain::Chain;
    use sluice_vbs::MountSet;

    #[test]
    fn recording_round_trips_through_a_chain() {
        let tmp = tempfile::tempdir().unwrap();
        for d in ["disk0", "disk1"] {
            std::fs::create_dir(tmp.path().join(d)).unwrap();
        }

        let table = Arc::new(VbsTable::new());
        table.init(tmp.path()).unwrap();

        // lay down a recording through the writer stage
        let mounts = MountSet::scan(tmp.path()).unwrap();
        let pool = BlockPool::new(256, 4).unwrap();
        let data: Vec<u8> = (0..1024u32).map(|i| i as u8).collect();

        let feed = data.clone();
        let builder = Chain::builder();
        let (builder, _src) = builder.produce(
            "feed",
            4,
            pool.clone(),
            move |outq: &Bqueue<Block>, ctx: &StageCtx<BlockPool>| {
                let pool = ctx.with_args(|p| p.clone());
                for piece in feed.chunks(256) {
                    let mut b = pool.get();
                    if let Some(buf) = b.as_mut_slice() {
                        buf[..piece.len()].copy_from_slice(piece);
                    }
                    b.resize(piece.len());
                    if !outq.push(b) {
                        break;
                    }
                }
                Ok(())
            },
        );
        let (mut chain, sink) = builder.consume(
            "diskwriter",
            DiskWriterArgs { writer: Some(ChunkWriter::new(&mounts, "loop")) },
            disk_writer,
        );
        chain.run().unwrap();
        while sink.total() < 1024 {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        chain.stop().unwrap();
        assert_eq!(sink.total(), 1024);

        // and read it back through the reader stage
        let fd = table.open("loop").unwrap();
        let got = Arc::new(std::sync::Mutex::new(Vec::new()));
        let collect = Arc::clone(&got);

        let builder = Chain::builder();
        let (builder, reader) = builder.produce(
            "diskreader",
            4,
            DiskReaderArgs {
                table: Arc::clone(&table),
                fd,
                start: 0,
                end: None,
                read_size: 100,
                pool: BlockPool::new(300, 4).unwrap(),
                run: false,
            },
            disk_reader,
        );
        let (mut chain, _) = builder.consume(
            "collect",
            (),
            move |inq: &Bqueue<Block>, _ctx: &StageCtx<()>| {
                while let Some(b) = inq.pop() {
                    collect.lock().unwrap().extend_from_slice(&b);
                }
                Ok(())
            },
        );
        chain.run().unwrap();
        reader.with_args(|a| a.run = true);
        chain.join().unwrap();

        assert_eq!(&*got.lock().unwrap(), &data);
    }
}

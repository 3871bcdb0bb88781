use std::sync::{Arc, Mutex};

use sluice::chain::{Chain, StageCtx, StepError};
use sluice::steps::{HubReaderArgs, HubWriterArgs, hub_reader, hub_writer};
use sluice_communication::{Block, BlockPool, BroadcastHub, Bqueue};

fn producer(
    outq: &Bqueue<Block>,
    ctx: &StageCtx<(BlockPool, u64)>,
) -> Result<(), StepError> {
    let (pool, nblocks) = ctx.with_args(|a| (a.0.clone(), a.1));
    for i in 0..nblocks {
        let mut b = pool.get();
        if let Some(buf) = b.as_mut_slice() {
            for w in buf.chunks_exact_mut(8) {
                w.copy_from_slice(&i.to_le_bytes());
            }
        }
        if !outq.push(b) {
            break;
        }
        ctx.count(64);
    }
    Ok(())
}

/// Snooping chain: a hub reader feeding a collector, plus the finalizer
/// that unregisters its queue from the hub.
fn snoop_chain(
    hub: &Arc<BroadcastHub>,
    collected: Arc<Mutex<Vec<u64>>>,
) -> (Chain, sluice::StepHandle<HubReaderArgs>) {
    let queue = hub.add_queue(16);
    let builder = Chain::builder();
    let (builder, reader) = builder.produce(
        "hub-reader",
        8,
        HubReaderArgs {
            queue: Arc::clone(&queue),
            pool: Some(BlockPool::new(64, 8).unwrap()),
            reuse_blocks: false,
            run: true,
            finished: false,
        },
        hub_reader,
    );
    let (mut chain, _collect) = builder.consume(
        "collect",
        (),
        move |inq: &Bqueue<Block>, _ctx: &StageCtx<()>| {
            while let Some(b) = inq.pop() {
                collected
                    .lock()
                    .unwrap()
                    .push(u64::from_le_bytes(b[..8].try_into().unwrap()));
            }
            Ok(())
        },
    );
    let hub = Arc::clone(hub);
    chain.set_finalizer(move || hub.remove_queue(&queue));
    (chain, reader)
}

#[test]
fn snoopers_see_the_exact_stream() {
    let hub = Arc::new(BroadcastHub::new());
    let pool = BlockPool::new(64, 16).unwrap();

    let first = Arc::new(Mutex::new(Vec::new()));
    let second = Arc::new(Mutex::new(Vec::new()));
    let (mut snoop_a, _) = snoop_chain(&hub, Arc::clone(&first));
    let (mut snoop_b, _) = snoop_chain(&hub, Arc::clone(&second));
    snoop_a.run().unwrap();
    snoop_b.run().unwrap();

    // main pipeline: producer -> hub writer (blocking broadcast)
    let builder = Chain::builder();
    let (builder, _p) = builder.produce("pattern", 8, (pool.clone(), 200u64), producer);
    let (mut main, _w) = builder.consume(
        "hub-writer",
        HubWriterArgs { hub: Arc::clone(&hub), disable_on_exit: true },
        hub_writer,
    );
    main.run().unwrap();
    main.join().unwrap();

    snoop_a.join().unwrap();
    snoop_b.join().unwrap();

    let expect: Vec<u64> = (0..200).collect();
    assert_eq!(*first.lock().unwrap(), expect);
    assert_eq!(*second.lock().unwrap(), expect);
    assert_eq!(hub.queue_count(), 0, "finalizers removed their queues");
    assert_eq!(pool.outstanding(), 0);
}

#[test]
fn removing_one_snooper_leaves_the_other() {
    let hub = Arc::new(BroadcastHub::new());
    let pool = BlockPool::new(64, 16).unwrap();

    let kept = Arc::new(Mutex::new(Vec::new()));
    let dropped = Arc::new(Mutex::new(Vec::new()));
    let (mut keeper, _) = snoop_chain(&hub, Arc::clone(&kept));
    let (mut goner, goner_reader) = snoop_chain(&hub, Arc::clone(&dropped));
    keeper.run().unwrap();
    goner.run().unwrap();

    let builder = Chain::builder();
    let (builder, _p) = builder.produce("pattern", 8, (pool.clone(), 100u64), producer);
    let (mut main, _w) = builder.consume(
        "hub-writer",
        HubWriterArgs { hub: Arc::clone(&hub), disable_on_exit: false },
        hub_writer,
    );
    main.run().unwrap();

    // mid-stream, one snooper leaves
    while dropped.lock().unwrap().len() < 10 {
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
    goner.cancel().unwrap();
    assert!(goner_reader.with_args(|a| a.finished));

    main.join().unwrap();
    hub.disable_all();
    keeper.join().unwrap();

    // the surviving snooper got the whole stream, in order
    assert_eq!(*kept.lock().unwrap(), (0..100).collect::<Vec<u64>>());
    drop(goner);
    assert_eq!(pool.outstanding(), 0);
}

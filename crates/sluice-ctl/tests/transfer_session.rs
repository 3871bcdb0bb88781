use std::io::Read;
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use sluice::Runtime;
use sluice_ctl::commands::handle;
use sluice_ctl::vsis::{Reply, Request, parse_line};

fn one(line: &str) -> Request {
    parse_line(line).remove(0).unwrap()
}

fn ok(rte: &Arc<Runtime>, line: &str) -> Reply {
    let reply = handle(&one(line), rte);
    assert_eq!(reply.code, 0, "{line} -> {reply}");
    reply
}

/// Accept one data connection and drain it to EOF on a helper thread.
fn drain_one(listener: TcpListener) -> std::thread::JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut data = Vec::new();
        stream.read_to_end(&mut data).unwrap();
        data
    })
}

#[test]
fn fill2net_streams_fill_words_over_tcp() {
    let rte = Arc::new(Runtime::new(64 * 1024 * 1024));
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let sink = drain_one(listener);

    ok(&rte, "net_protocol=tcp");
    ok(&rte, &format!("net_port={port}"));
    ok(&rte, "fill2net=connect:127.0.0.1");
    assert_eq!(handle(&one("mtu=9000"), &rte).code, 6, "gate must hold during transfer");

    ok(&rte, "fill2net=on:4:0xdeadbeefdeadbeef");
    // wait for the stream to finish: 4 blocks, then the producer stops
    let data = sink.join().unwrap();
    ok(&rte, "fill2net=disconnect");

    let blocksize = {
        // what the solver picked for these netparms is what went out
        let np = rte.netparms.lock().unwrap().clone();
        sluice_format::solve(&np, None, None).unwrap().blocksize
    };
    assert_eq!(data.len(), 4 * blocksize);
    for word in data.chunks_exact(8) {
        assert_eq!(word, 0xdead_beef_dead_beefu64.to_le_bytes());
    }
    assert_eq!(rte.transfermode().to_string(), "no_transfer");
}

#[test]
fn record_then_disk2net_round_trip() {
    let tmp = tempfile::tempdir().unwrap();
    for d in ["disk0", "disk1"] {
        std::fs::create_dir(tmp.path().join(d)).unwrap();
    }
    let rte = Arc::new(Runtime::new(64 * 1024 * 1024));
    rte.vbs.init(tmp.path()).unwrap();

    // record the pattern source for a moment
    ok(&rte, "record=on:ef042_mc_no0012");
    std::thread::sleep(Duration::from_millis(200));
    let off = ok(&rte, "record=off");
    let recorded: u64 = off.values[0].parse().unwrap();
    assert!(recorded > 0, "nothing recorded");

    // the scan directory closed the scan with its length
    let scandir = ok(&rte, "scandir?0");
    assert_eq!(scandir.values[0], "1");
    assert_eq!(scandir.values[1], "ef042_mc_no0012");
    assert_eq!(scandir.values[3], recorded.to_string());

    // now play the recording back over tcp
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let sink = drain_one(listener);

    ok(&rte, "net_protocol=tcp");
    ok(&rte, &format!("net_port={port}"));
    ok(&rte, "disk2net=connect:ef042_mc_no0012:127.0.0.1");
    ok(&rte, "disk2net=on");
    let data = sink.join().unwrap();
    ok(&rte, "disk2net=disconnect");

    assert_eq!(data.len() as u64, recorded);
    // the pattern source wrote ascending 32-bit words
    for (i, word) in data.chunks_exact(4).enumerate() {
        assert_eq!(word, (i as u32).to_le_bytes(), "word {i} corrupted");
    }
    assert_eq!(rte.transfermode().to_string(), "no_transfer");
}

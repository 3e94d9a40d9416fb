// Multi-handle and multi-process lock smoke tests for debit serialization.
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use atomstock::core::recipe::{DeliverOutcome, Molecule, deliver};
use atomstock::core::store::{FileStore, Inventory, InventoryStore};

#[test]
fn concurrent_debits_never_oversell() {
    let temp = tempfile::tempdir().expect("tempdir");
    let save = temp.path().join("atoms.bin");

    let seed = FileStore::open(&save, Inventory::new(0, 50, 100)).expect("seed");
    drop(seed);

    // Two handles on one file: contention crosses both the in-process mutex
    // and the file lock.
    let handle_a = Arc::new(FileStore::open(&save, Inventory::new(0, 0, 0)).expect("open a"));
    let handle_b = Arc::new(FileStore::open(&save, Inventory::new(0, 0, 0)).expect("open b"));
    let delivered = Arc::new(AtomicU64::new(0));

    let mut workers = Vec::new();
    for worker in 0..8 {
        let store = if worker % 2 == 0 {
            Arc::clone(&handle_a)
        } else {
            Arc::clone(&handle_b)
        };
        let delivered = Arc::clone(&delivered);
        workers.push(thread::spawn(move || {
            for _ in 0..10 {
                match deliver(store.as_ref(), Molecule::Water, 1).expect("deliver") {
                    DeliverOutcome::Delivered(_) => {
                        delivered.fetch_add(1, Ordering::Relaxed);
                    }
                    DeliverOutcome::InsufficientStock => {}
                }
            }
        }));
    }
    for worker in workers {
        worker.join().expect("join");
    }

    assert_eq!(delivered.load(Ordering::Relaxed), 50);
    assert_eq!(handle_a.snapshot().expect("snapshot"), Inventory::new(0, 0, 0));
    assert_eq!(handle_b.snapshot().expect("snapshot"), Inventory::new(0, 0, 0));
}

#[test]
fn two_servers_share_one_save_file() {
    let temp = tempfile::tempdir().expect("tempdir");
    let save = temp.path().join("atoms.bin");

    let seed = FileStore::open(&save, Inventory::new(0, 50, 100)).expect("seed");
    drop(seed);

    let (mut server_a, port_a) = start_server(&save);
    let (mut server_b, port_b) = start_server(&save);

    let worker_a = thread::spawn(move || deliver_count(port_a, 40));
    let worker_b = thread::spawn(move || deliver_count(port_b, 40));
    let delivered = worker_a.join().expect("join a") + worker_b.join().expect("join b");
    assert_eq!(delivered, 50);

    let _ = server_a.kill();
    let _ = server_a.wait();
    let _ = server_b.kill();
    let _ = server_b.wait();

    let end = FileStore::open(&save, Inventory::new(9, 9, 9))
        .expect("reopen")
        .snapshot()
        .expect("snapshot");
    assert_eq!(end, Inventory::new(0, 0, 0));
}

fn start_server(save: &Path) -> (Child, u16) {
    for _attempt in 0..3 {
        let port = pick_port();
        let mut child = Command::new(env!("CARGO_BIN_EXE_atomstock"))
            .args(["-T", &port.to_string(), "-f"])
            .arg(save)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn");
        if wait_ready(&mut child, port) {
            return (child, port);
        }
        let _ = child.kill();
        let _ = child.wait();
    }
    panic!("server failed to start");
}

fn pick_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    drop(listener);
    port
}

fn wait_ready(child: &mut Child, port: u16) -> bool {
    let start = Instant::now();
    loop {
        if let Ok(mut probe) = TcpStream::connect(("127.0.0.1", port)) {
            let _ = probe.set_read_timeout(Some(Duration::from_millis(500)));
            let mut byte = [0u8; 1];
            if matches!(probe.read(&mut byte), Ok(n) if n > 0) {
                return true;
            }
        }
        if matches!(child.try_wait(), Ok(Some(_)) | Err(_)) {
            return false;
        }
        if start.elapsed() > Duration::from_secs(8) {
            return false;
        }
        thread::sleep(Duration::from_millis(20));
    }
}

fn deliver_count(port: u16, attempts: usize) -> u64 {
    let stream = TcpStream::connect(("127.0.0.1", port)).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("timeout");
    let mut writer = stream.try_clone().expect("clone");
    let mut reader = BufReader::new(stream);

    let mut line = String::new();
    reader.read_line(&mut line).expect("welcome");

    let mut delivered = 0;
    for _ in 0..attempts {
        writer.write_all(b"DELIVER WATER\n").expect("send");
        line.clear();
        reader.read_line(&mut line).expect("reply");
        if line.starts_with("Molecule delivered successfully.") {
            delivered += 1;
        } else {
            assert!(
                line.starts_with("Not enough atoms for this molecule."),
                "unexpected reply: {line}"
            );
        }
    }
    delivered
}

//! End-to-end dispatcher scenarios over a real listener, with an
//! in-memory store and a recording launcher standing in for the cloud.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use serde_cbor;

use errors::Result;
use exec::ExecutionLoop;
use proto::messages::{executed_frame, ExecutedMsg, OutputMsg, PutMsg};
use proto::{Message, MessageParser, OpCode};
use store::BlobStore;
use thunk::Thunk;
use MAX_PAYLOAD_SIZE;

use super::state::{SelectionStrategy, StateRef};
use super::worker::WorkerState;

struct TestStore {
    sizes: RefCell<HashMap<String, u32>>,
    blobs: RefCell<HashMap<String, Vec<u8>>>,
    available: RefCell<HashSet<String>>,
    reductions: RefCell<HashMap<String, String>>,
    events: Rc<RefCell<Vec<String>>>,
}

impl TestStore {
    fn new(events: Rc<RefCell<Vec<String>>>) -> Rc<TestStore> {
        Rc::new(TestStore {
            sizes: RefCell::new(HashMap::new()),
            blobs: RefCell::new(HashMap::new()),
            available: RefCell::new(HashSet::new()),
            reductions: RefCell::new(HashMap::new()),
            events,
        })
    }
}

impl BlobStore for TestStore {
    fn is_available(&self, hash: &str) -> bool {
        self.available.borrow().contains(hash)
    }

    fn set_available(&self, hash: &str) {
        self.events.borrow_mut().push(format!("available {}", hash));
        self.available.borrow_mut().insert(hash.to_string());
    }

    fn insert(&self, key: &str, value: &str) {
        self.events
            .borrow_mut()
            .push(format!("insert {}={}", key, value));
        self.reductions
            .borrow_mut()
            .insert(key.to_string(), value.to_string());
    }

    fn size(&self, hash: &str) -> u32 {
        *self.sizes.borrow().get(hash).unwrap_or(&0)
    }

    fn blob_path(&self, hash: &str) -> PathBuf {
        PathBuf::from(format!("/store/{}", hash))
    }

    fn read_blob(&self, hash: &str) -> Result<Vec<u8>> {
        match self.blobs.borrow().get(hash) {
            Some(data) => Ok(data.clone()),
            None => bail!("no blob {}", hash),
        }
    }

    fn atomic_create(&self, data: &[u8], path: &Path) -> Result<()> {
        self.events
            .borrow_mut()
            .push(format!("create {}", path.display()));
        let name = path
            .file_name()
            .expect("blob path has a file name")
            .to_string_lossy()
            .into_owned();
        self.blobs.borrow_mut().insert(name, data.to_vec());
        Ok(())
    }
}

struct TestLauncher {
    launches: Cell<usize>,
}

impl super::state::WorkerLauncher for TestLauncher {
    fn launch(&self, _exec_loop: &ExecutionLoop, _coordinator: &SocketAddr) -> Result<()> {
        self.launches.set(self.launches.get() + 1);
        Ok(())
    }
}

struct Harness {
    exec_loop: ExecutionLoop,
    fleet: StateRef,
    store: Rc<TestStore>,
    launcher: Rc<TestLauncher>,
    events: Rc<RefCell<Vec<String>>>,
    addr: SocketAddr,
}

fn harness() -> Harness {
    let events = Rc::new(RefCell::new(Vec::new()));
    let store = TestStore::new(events.clone());
    let launcher = Rc::new(TestLauncher {
        launches: Cell::new(0),
    });
    let success_events = events.clone();
    let fleet = StateRef::new(
        store.clone(),
        launcher.clone(),
        Rc::new(move |thunk: &str, output: &str, _extra| {
            success_events
                .borrow_mut()
                .push(format!("success {} {}", thunk, output));
        }),
    );
    let exec_loop = ExecutionLoop::new().unwrap();
    let addr = fleet
        .start(&exec_loop, &"127.0.0.1:0".parse().unwrap())
        .unwrap();
    Harness {
        exec_loop,
        fleet,
        store,
        launcher,
        events,
        addr,
    }
}

impl Harness {
    fn turn(&self) {
        for _ in 0..5 {
            self.exec_loop.loop_once(20).unwrap();
        }
    }

    fn connect_worker(&self) -> TcpStream {
        let socket = TcpStream::connect(self.addr).unwrap();
        socket
            .set_read_timeout(Some(Duration::from_millis(2000)))
            .unwrap();
        self.turn();
        socket
    }

    fn read_messages(&self, socket: &mut TcpStream, count: usize) -> Vec<Message> {
        let mut parser = MessageParser::new();
        let mut out = Vec::new();
        let mut buf = [0u8; 65536];
        for _ in 0..100 {
            self.turn();
            if out.len() >= count {
                break;
            }
            match socket.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    parser.parse(&buf[..n]).unwrap();
                    while let Some(message) = parser.pop() {
                        out.push(message);
                    }
                }
                Err(ref e)
                    if e.kind() == ::std::io::ErrorKind::WouldBlock
                        || e.kind() == ::std::io::ErrorKind::TimedOut => {}
                Err(e) => panic!("worker socket read failed: {}", e),
            }
        }
        out
    }

    fn send_executed(&self, socket: &mut TcpStream, msg: &ExecutedMsg) {
        socket.write_all(&executed_frame(msg).unwrap()).unwrap();
        self.turn();
    }

    fn consistent(&self) {
        self.fleet.get().check_consistency().unwrap();
    }
}

fn thunk(hash: &str, values: &[&str], executables: &[&str]) -> Thunk {
    Thunk {
        hash: hash.to_string(),
        infiles_size: 1024,
        values: values
            .iter()
            .map(|h| (h.to_string(), format!("{}.in", h)))
            .collect(),
        executables: executables
            .iter()
            .map(|h| (h.to_string(), format!("{}.bin", h)))
            .collect(),
    }
}

fn executed(thunk_hash: &str, tag: &str, output: &str, data: Option<&str>) -> ExecutedMsg {
    ExecutedMsg {
        thunk_hash: thunk_hash.to_string(),
        outputs: vec![OutputMsg {
            tag: tag.to_string(),
            hash: output.to_string(),
            data: data.map(|d| d.to_string()),
        }],
    }
}

fn parse_frames(data: &[u8]) -> Vec<Message> {
    let mut parser = MessageParser::new();
    parser.parse(data).unwrap();
    let mut out = Vec::new();
    while let Some(message) = parser.pop() {
        out.push(message);
    }
    out
}

// Cold start: no workers, one thunk. The thunk queues, a launch happens,
// the first worker to dial in runs it.
#[test]
fn cold_start_single_thunk() {
    let h = harness();
    let t = thunk("t-hash", &[], &[]);
    h.fleet.force_thunk(&h.exec_loop, t.clone()).unwrap();

    assert_eq!(h.fleet.job_count(), 1);
    assert_eq!(h.fleet.get().thunk_queue.len(), 1);
    assert_eq!(h.launcher.launches.get(), 1);

    let mut socket = h.connect_worker();
    {
        let state = h.fleet.get();
        assert_eq!(state.workers.len(), 1);
        assert!(state.workers.contains_key(&0));
        assert_eq!(state.workers[&0].state, WorkerState::Busy);
        assert!(state.free_workers.is_empty());
        assert!(state.thunk_queue.is_empty());
    }
    h.consistent();

    let frames = h.read_messages(&mut socket, 1);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].opcode, OpCode::Execute);
    let sent: Thunk = serde_cbor::from_slice(&frames[0].payload).unwrap();
    assert_eq!(sent, t);

    h.send_executed(&mut socket, &executed("t-hash", "out", "H", None));

    assert_eq!(h.fleet.job_count(), 0);
    assert_eq!(
        h.fleet.get().free_workers.iter().cloned().collect::<Vec<_>>(),
        vec![0]
    );
    assert_eq!(h.store.reductions.borrow()["t-hash"], "H");
    assert_eq!(h.store.reductions.borrow()["t-hash#out"], "H");
    assert!(h.store.available.borrow().contains("H"));
    assert!(h.events.borrow().iter().any(|e| e == "success t-hash H"));
    h.consistent();
}

// One idle worker, two thunks: the first dispatches immediately, the
// second queues and triggers a launch, and a later worker picks it up.
#[test]
fn second_thunk_waits_for_second_worker() {
    let h = harness();
    let mut w0 = h.connect_worker();

    h.fleet
        .force_thunk(&h.exec_loop, thunk("t1", &[], &[]))
        .unwrap();
    assert_eq!(h.launcher.launches.get(), 0);
    let frames = h.read_messages(&mut w0, 1);
    assert_eq!(frames[0].opcode, OpCode::Execute);
    let sent: Thunk = serde_cbor::from_slice(&frames[0].payload).unwrap();
    assert_eq!(sent.hash, "t1");

    h.fleet
        .force_thunk(&h.exec_loop, thunk("t2", &[], &[]))
        .unwrap();
    assert_eq!(h.launcher.launches.get(), 1);
    assert_eq!(h.fleet.get().thunk_queue.len(), 1);
    assert_eq!(h.fleet.job_count(), 2);

    let mut w1 = h.connect_worker();
    let frames = h.read_messages(&mut w1, 1);
    let sent: Thunk = serde_cbor::from_slice(&frames[0].payload).unwrap();
    assert_eq!(sent.hash, "t2");
    assert!(h.fleet.get().thunk_queue.is_empty());
    h.consistent();
}

// LargestObject: the worker already holding the biggest dependency wins.
#[test]
fn largest_object_prefers_cached_worker() {
    let h = harness();
    let _w0 = h.connect_worker();
    let _w1 = h.connect_worker();

    h.store.sizes.borrow_mut().insert("A".to_string(), 10);
    h.store.sizes.borrow_mut().insert("B".to_string(), 100);
    h.store.available.borrow_mut().insert("A".to_string());
    h.store.available.borrow_mut().insert("B".to_string());
    h.fleet
        .get_mut()
        .workers
        .get_mut(&1)
        .unwrap()
        .objects
        .insert("B".to_string());

    h.fleet
        .force_thunk(&h.exec_loop, thunk("t", &["A", "B"], &[]))
        .unwrap();

    let state = h.fleet.get();
    assert_eq!(state.workers[&1].state, WorkerState::Busy);
    assert_eq!(state.workers[&0].state, WorkerState::Idle);
    assert_eq!(
        state.free_workers.iter().cloned().collect::<Vec<_>>(),
        vec![0]
    );
}

#[test]
fn pick_worker_falls_back_to_first() {
    let h = harness();
    let _w0 = h.connect_worker();
    let _w1 = h.connect_worker();

    let state = h.fleet.get();
    // First always picks the smallest id
    assert_eq!(
        state
            .pick_worker(&thunk("t", &["A"], &[]), SelectionStrategy::First)
            .unwrap(),
        0
    );
    // no dependencies at all
    assert_eq!(
        state
            .pick_worker(&thunk("t", &[], &[]), SelectionStrategy::LargestObject)
            .unwrap(),
        0
    );
    // dependencies exist but nobody caches them
    assert_eq!(
        state
            .pick_worker(&thunk("t", &["A"], &[]), SelectionStrategy::LargestObject)
            .unwrap(),
        0
    );
}

#[test]
fn pick_worker_on_empty_free_set_is_fatal() {
    let h = harness();
    assert!(h
        .fleet
        .get()
        .pick_worker(&thunk("t", &[], &[]), SelectionStrategy::First)
        .is_err());
}

// Dependency elision: a blob is skipped when the worker already holds it
// OR when the remote store already has it; the two predicates are
// independent. B is held by the worker but not replicated; C is
// replicated but unknown to the worker; only A needs a push.
#[test]
fn prepare_pushes_only_missing_dependencies() {
    let h = harness();
    let _w0 = h.connect_worker();

    h.store
        .blobs
        .borrow_mut()
        .insert("A".to_string(), b"blob-a".to_vec());
    assert!(!h.store.is_available("B"));
    h.fleet
        .get_mut()
        .workers
        .get_mut(&0)
        .unwrap()
        .objects
        .insert("B".to_string());
    h.store.available.borrow_mut().insert("C".to_string());
    assert!(!h.fleet.get().workers[&0].objects.contains("C"));

    h.fleet
        .force_thunk(&h.exec_loop, thunk("t", &["A", "B", "C"], &[]))
        .unwrap();

    // frames still sit in the write buffer; the loop has not turned
    let connection = h.fleet.get().workers[&0].connection.clone();
    let frames = parse_frames(connection.get().pending_writes());
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].opcode, OpCode::Put);
    let put: PutMsg = serde_cbor::from_slice(&frames[0].payload).unwrap();
    assert_eq!(put.hash, "A");
    assert_eq!(put.data, b"blob-a");
    assert_eq!(frames[1].opcode, OpCode::Execute);

    // invariant: the new object set covers the full dependency set
    let state = h.fleet.get();
    let objects = &state.workers[&0].objects;
    assert!(objects.contains("A") && objects.contains("B") && objects.contains("C"));
    assert_eq!(state.workers[&0].state, WorkerState::Busy);
    assert!(!state.free_workers.contains(&0));
}

// Pinned behavior: prepare replaces the worker's object set with the
// current thunk's dependency set, dropping earlier knowledge.
#[test]
fn prepare_overwrites_object_set() {
    let h = harness();
    let _w0 = h.connect_worker();

    h.store.available.borrow_mut().insert("A".to_string());
    h.fleet
        .get_mut()
        .workers
        .get_mut(&0)
        .unwrap()
        .objects
        .insert("OLD".to_string());

    h.fleet
        .force_thunk(&h.exec_loop, thunk("t", &["A"], &[]))
        .unwrap();

    let state = h.fleet.get();
    let objects = &state.workers[&0].objects;
    assert!(objects.contains("A"));
    assert!(!objects.contains("OLD"));
}

// Inline output materialization: bytes land in the store before the
// success callback fires.
#[test]
fn inline_output_is_materialized_before_success() {
    let h = harness();
    let mut socket = h.connect_worker();
    h.fleet
        .force_thunk(&h.exec_loop, thunk("t", &[], &[]))
        .unwrap();
    let _ = h.read_messages(&mut socket, 1);

    // "aGVsbG8=" is base64 for "hello"
    h.send_executed(&mut socket, &executed("t", "out", "H", Some("aGVsbG8=")));

    assert_eq!(h.store.blobs.borrow()["H"], b"hello");
    let events = h.events.borrow();
    let create = events
        .iter()
        .position(|e| e == "create /store/H")
        .expect("blob created");
    let success = events
        .iter()
        .position(|e| e == "success t H")
        .expect("success fired");
    assert!(create < success);
}

// FIFO: queued thunks go to newly connecting workers in order.
#[test]
fn queued_thunks_dispatch_in_fifo_order() {
    let h = harness();
    h.fleet
        .force_thunk(&h.exec_loop, thunk("t1", &[], &[]))
        .unwrap();
    h.fleet
        .force_thunk(&h.exec_loop, thunk("t2", &[], &[]))
        .unwrap();
    assert_eq!(h.launcher.launches.get(), 2);
    assert_eq!(h.fleet.job_count(), 2);

    let mut w0 = h.connect_worker();
    let sent: Thunk =
        serde_cbor::from_slice(&h.read_messages(&mut w0, 1)[0].payload).unwrap();
    assert_eq!(sent.hash, "t1");

    let mut w1 = h.connect_worker();
    let sent: Thunk =
        serde_cbor::from_slice(&h.read_messages(&mut w1, 1)[0].payload).unwrap();
    assert_eq!(sent.hash, "t2");

    assert!(h.fleet.get().thunk_queue.is_empty());
    h.consistent();
}

// A worker finishing does not drain the queue; only fresh accepts do.
#[test]
fn executed_does_not_drain_queue() {
    let h = harness();
    let mut w0 = h.connect_worker();
    h.fleet
        .force_thunk(&h.exec_loop, thunk("t1", &[], &[]))
        .unwrap();
    let _ = h.read_messages(&mut w0, 1);
    h.fleet
        .force_thunk(&h.exec_loop, thunk("t2", &[], &[]))
        .unwrap();
    assert_eq!(h.fleet.get().thunk_queue.len(), 1);

    h.send_executed(&mut w0, &executed("t1", "out", "H1", None));

    // worker 0 is idle again but t2 still waits for a new worker
    let state = h.fleet.get();
    assert_eq!(state.workers[&0].state, WorkerState::Idle);
    assert_eq!(state.thunk_queue.len(), 1);
    assert_eq!(state.running_jobs, 1);
}

#[test]
fn oversize_thunk_is_rejected() {
    let h = harness();
    let mut big = thunk("big", &[], &[]);
    big.infiles_size = MAX_PAYLOAD_SIZE;
    assert!(!h.fleet.can_execute(&big));
    big.infiles_size = MAX_PAYLOAD_SIZE - 1;
    assert!(h.fleet.can_execute(&big));
}

// A busy worker disconnecting orphans its thunk: the record goes away,
// running_jobs stays elevated, nothing is retried.
#[test]
fn busy_worker_disconnect_orphans_thunk() {
    let h = harness();
    let mut socket = h.connect_worker();
    h.fleet
        .force_thunk(&h.exec_loop, thunk("t", &[], &[]))
        .unwrap();
    let _ = h.read_messages(&mut socket, 1);
    drop(socket);
    for _ in 0..20 {
        h.turn();
        if h.fleet.get().workers.is_empty() {
            break;
        }
    }

    let state = h.fleet.get();
    assert!(state.workers.is_empty());
    assert!(state.free_workers.is_empty());
    assert_eq!(state.running_jobs, 1);
    state.check_consistency().unwrap();
}

// The success callback may force the next thunk right away.
#[test]
fn success_callback_can_force_next_thunk() {
    let events = Rc::new(RefCell::new(Vec::new()));
    let store = TestStore::new(events.clone());
    let launcher = Rc::new(TestLauncher {
        launches: Cell::new(0),
    });
    let exec_loop = ExecutionLoop::new().unwrap();

    let fleet_cell: Rc<RefCell<Option<StateRef>>> = Rc::new(RefCell::new(None));
    let chain_cell = fleet_cell.clone();
    let chain_loop = exec_loop.clone();
    let chained = Rc::new(Cell::new(false));
    let chained_flag = chained.clone();
    let fleet = StateRef::new(
        store.clone(),
        launcher.clone(),
        Rc::new(move |thunk_hash: &str, _output: &str, _extra| {
            if thunk_hash == "first" && !chained_flag.get() {
                chained_flag.set(true);
                let fleet = chain_cell.borrow().clone().unwrap();
                fleet
                    .force_thunk(&chain_loop, thunk("second", &[], &[]))
                    .unwrap();
            }
        }),
    );
    *fleet_cell.borrow_mut() = Some(fleet.clone());
    let addr = fleet
        .start(&exec_loop, &"127.0.0.1:0".parse().unwrap())
        .unwrap();

    let mut socket = TcpStream::connect(addr).unwrap();
    socket
        .set_read_timeout(Some(Duration::from_millis(2000)))
        .unwrap();
    for _ in 0..5 {
        exec_loop.loop_once(20).unwrap();
    }

    fleet.force_thunk(&exec_loop, thunk("first", &[], &[])).unwrap();
    socket
        .write_all(&executed_frame(&executed("first", "out", "H", None)).unwrap())
        .unwrap();
    for _ in 0..10 {
        exec_loop.loop_once(20).unwrap();
    }

    assert!(chained.get());
    // the freed worker was picked up again for the chained thunk
    let state = fleet.get();
    assert_eq!(state.workers[&0].state, WorkerState::Busy);
    assert_eq!(state.running_jobs, 1);
    state.check_consistency().unwrap();
}

// Execute is a coordinator-to-worker opcode; receiving it back is fatal.
#[test]
fn unexpected_opcode_is_fatal() {
    let h = harness();
    let _w0 = h.connect_worker();
    let message = Message {
        opcode: OpCode::Execute,
        payload: Vec::new(),
    };
    assert!(h.fleet.handle_worker_message(0, &message).is_err());
}

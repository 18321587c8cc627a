#![doc = include_str!("../README.md")]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use biometrics::{Collector, Counter};
use indicio::{clue, ERROR, INFO};
use prototk_derive::Message;
use sync42::background::BackgroundThread;
use zerror::Z;
use zerror_core::ErrorCore;

use switchboard::Switchboard;
use synod::Processor;
use synod_pb::Envelope;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static APPEND: Counter = Counter::new("dlog.append");
static APPENDED: Counter = Counter::new("dlog.appended");
static LOST_INSTANCE: Counter = Counter::new("dlog.append.lost_instance");
static TIMED_OUT: Counter = Counter::new("dlog.append.timed_out");
static DUPLICATE_DECISION: Counter = Counter::new("dlog.duplicate_decision");
static STAGED_DECISION: Counter = Counter::new("dlog.staged_decision");
static WRITE_FAILED: Counter = Counter::new("dlog.write_failed");

/// Register the biometrics for the distributed log.
pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&APPEND);
    collector.register_counter(&APPENDED);
    collector.register_counter(&LOST_INSTANCE);
    collector.register_counter(&TIMED_OUT);
    collector.register_counter(&DUPLICATE_DECISION);
    collector.register_counter(&STAGED_DECISION);
    collector.register_counter(&WRITE_FAILED);
}

///////////////////////////////////////////// COLLECTOR ////////////////////////////////////////////

/// The indicio collector for the distributed log.
pub static COLLECTOR: indicio::Collector = indicio::Collector::new();

/////////////////////////////////////////////// Error //////////////////////////////////////////////

/// The error type for log and storage operations.
#[derive(Message, zerror_derive::Z)]
pub enum Error {
    #[prototk(491520, message)]
    Success {
        #[prototk(1, message)]
        core: ErrorCore,
    },
    #[prototk(491521, message)]
    Corruption {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, string)]
        context: String,
    },
    #[prototk(491522, message)]
    TimedOut {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, uint64)]
        milliseconds: u64,
    },
    #[prototk(491523, message)]
    Consensus {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, message)]
        what: synod_pb::Error,
    },
    #[prototk(491524, message)]
    IoError {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, string)]
        what: String,
    },
}

impl Default for Error {
    fn default() -> Self {
        Self::Success {
            core: ErrorCore::default(),
        }
    }
}

impl From<synod_pb::Error> for Error {
    fn from(what: synod_pb::Error) -> Self {
        Self::Consensus {
            core: ErrorCore::default(),
            what,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(what: std::io::Error) -> Self {
        Self::IoError {
            core: ErrorCore::default(),
            what: what.to_string(),
        }
    }
}

///////////////////////////////////////////// LogEntry /////////////////////////////////////////////

/// One record of the log.  Sequence numbers are dense and strictly increasing from zero.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct LogEntry {
    #[prototk(1, uint64)]
    pub seq: u64,
    #[prototk(2, bytes)]
    pub value: Vec<u8>,
}

////////////////////////////////////////////// Backend /////////////////////////////////////////////

/// An append-only record store.  Append is the only mutation.  A durable backend must make the
/// write durable before reporting Ok; IO failures surface as [Error::IoError].
pub trait Backend: Send + 'static {
    /// Append `entry`.  Entries arrive in sequence order; a backend should refuse anything else
    /// as corruption.
    fn write(&mut self, entry: &LogEntry) -> Result<(), Error>;
    /// The entry with the highest sequence number, or None when the store is empty.
    fn latest(&self) -> Result<Option<LogEntry>, Error>;
    /// Every entry with `seq >= starting_from`, in order.  `None` means the entire store.
    fn all(&self, starting_from: Option<u64>) -> Result<Vec<LogEntry>, Error>;
}

////////////////////////////////////////// MemoryBackend ///////////////////////////////////////////

/// The in-memory reference backend.  Non-durable; it exists for tests and single-process
/// deployments that can afford to lose the log.
#[derive(Default)]
pub struct MemoryBackend {
    entries: Vec<LogEntry>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for MemoryBackend {
    fn write(&mut self, entry: &LogEntry) -> Result<(), Error> {
        let expected = self.entries.len() as u64;
        if entry.seq != expected {
            return Err(Error::Corruption {
                core: ErrorCore::default(),
                context: format!("write of seq {} when {} was expected", entry.seq, expected),
            });
        }
        self.entries.push(entry.clone());
        Ok(())
    }

    fn latest(&self) -> Result<Option<LogEntry>, Error> {
        Ok(self.entries.last().cloned())
    }

    fn all(&self, starting_from: Option<u64>) -> Result<Vec<LogEntry>, Error> {
        let start = starting_from.unwrap_or(0) as usize;
        if start >= self.entries.len() {
            return Ok(Vec::new());
        }
        Ok(self.entries[start..].to_vec())
    }
}

//////////////////////////////////////////// LogOptions ////////////////////////////////////////////

/// Options for the distributed log.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LogOptions {
    /// How long an append may chase instances before it gives up.
    pub append_timeout_ms: u64,
}

impl LogOptions {
    /// Set the append timeout.
    pub fn with_append_timeout_ms(mut self, append_timeout_ms: u64) -> Self {
        self.append_timeout_ms = append_timeout_ms;
        self
    }
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            append_timeout_ms: 10_000,
        }
    }
}

///////////////////////////////////////////// LogState /////////////////////////////////////////////

struct LogState {
    backend: Box<dyn Backend>,
    next_seq: u64,
    staged: BTreeMap<u64, Vec<u8>>,
}

/////////////////////////////////////////////// Log ////////////////////////////////////////////////

/// A distributed log.  One per replica; the log exclusively owns its storage backend and shares
/// its synod processor with no one.
pub struct Log {
    options: LogOptions,
    processor: Arc<Processor>,
    state: Mutex<LogState>,
    decided: Condvar,
    proposer: Mutex<()>,
    poison: AtomicBool,
    background: Mutex<Option<BackgroundThread>>,
}

impl Log {
    /// Bring up a log over `backend`, joining `switchboard` under `name`.  Every value that
    /// lands in the log is sent on `delivery` in sequence order.  A backend with existing
    /// entries resumes from its latest sequence number.
    pub fn start(
        options: LogOptions,
        backend: Box<dyn Backend>,
        switchboard: Arc<Switchboard<Envelope>>,
        name: &str,
        total_participants: usize,
        delivery: Sender<Vec<u8>>,
    ) -> Result<Arc<Self>, Error> {
        let next_seq = backend.latest()?.map(|e| e.seq + 1).unwrap_or(0);
        let (decisions_tx, decisions_rx) = std::sync::mpsc::channel();
        let processor = Processor::start(name, switchboard, total_participants, decisions_tx)?;
        processor.advance_to(next_seq);
        let log = Arc::new(Self {
            options,
            processor,
            state: Mutex::new(LogState {
                backend,
                next_seq,
                staged: BTreeMap::new(),
            }),
            decided: Condvar::new(),
            proposer: Mutex::new(()),
            poison: AtomicBool::new(false),
            background: Mutex::new(None),
        });
        let runner = Arc::clone(&log);
        let background = BackgroundThread::spawn(move |done| runner.learn(decisions_rx, delivery, done));
        *log.background.lock().unwrap() = Some(background);
        Ok(log)
    }

    /// Submit `value` to consensus and block until it lands in the log or the deadline passes.
    /// Returns the sequence number the value landed at.  A caller whose value loses an instance
    /// to a competing proposer is retried against the next instance.
    pub fn append(&self, value: Vec<u8>) -> Result<u64, Error> {
        APPEND.click();
        // One proposal in flight per replica:  proposing anew resets the leader's round.
        let _proposer = self.proposer.lock().unwrap();
        let deadline = Instant::now() + Duration::from_millis(self.options.append_timeout_ms);
        loop {
            if self.poison.load(Ordering::Relaxed) {
                return Err(Error::Corruption {
                    core: ErrorCore::default(),
                    context: "log is poisoned".to_string(),
                });
            }
            let observed = self.state.lock().unwrap().next_seq;
            self.processor.propose(value.clone());
            self.processor.start_ballot();
            let mut state = self.state.lock().unwrap();
            while state.next_seq <= observed {
                let now = Instant::now();
                if now >= deadline {
                    TIMED_OUT.click();
                    return Err(Error::TimedOut {
                        core: ErrorCore::default(),
                        milliseconds: self.options.append_timeout_ms,
                    }
                    .with_info("instance", observed));
                }
                let (guard, _) = self.decided.wait_timeout(state, deadline - now).unwrap();
                state = guard;
                if self.poison.load(Ordering::Relaxed) {
                    return Err(Error::Corruption {
                        core: ErrorCore::default(),
                        context: "log is poisoned".to_string(),
                    });
                }
            }
            let entries = state.backend.all(Some(observed))?;
            match entries.first() {
                Some(entry) if entry.value == value => {
                    return Ok(observed);
                }
                _ => {
                    LOST_INSTANCE.click();
                    clue!(COLLECTOR, INFO, {
                        lost_instance: format!("{}", observed),
                    });
                }
            }
            drop(state);
        }
    }

    /// The most recently appended value, or None when the log is empty.
    pub fn latest(&self) -> Result<Option<Vec<u8>>, Error> {
        let state = self.state.lock().unwrap();
        Ok(state.backend.latest()?.map(|entry| entry.value))
    }

    /// Every value with `seq >= starting_from`, in order.  `None` means the entire log.
    pub fn replay(&self, starting_from: Option<u64>) -> Result<Vec<Vec<u8>>, Error> {
        let state = self.state.lock().unwrap();
        Ok(state
            .backend
            .all(starting_from)?
            .into_iter()
            .map(|entry| entry.value)
            .collect())
    }

    /// The sequence number the next decision will fill.
    pub fn next_seq(&self) -> u64 {
        self.state.lock().unwrap().next_seq
    }

    /// Stop the processor and the learner loop.
    pub fn stop(&self) {
        self.processor.stop();
        let background = self.background.lock().unwrap().take();
        drop(background);
    }

    fn learn(&self, decisions: Receiver<(u64, Vec<u8>)>, delivery: Sender<Vec<u8>>, done: Arc<AtomicBool>) {
        while !done.load(Ordering::Relaxed) {
            match decisions.recv_timeout(Duration::from_millis(50)) {
                Ok((instance, value)) => self.record(instance, value, &delivery),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    break;
                }
            }
        }
    }

    fn record(&self, instance: u64, value: Vec<u8>, delivery: &Sender<Vec<u8>>) {
        let mut state = self.state.lock().unwrap();
        if instance < state.next_seq {
            DUPLICATE_DECISION.click();
            clue!(COLLECTOR, INFO, {
                duplicate_decision: format!("{}", instance),
            });
            return;
        }
        if instance > state.next_seq {
            STAGED_DECISION.click();
        }
        state.staged.insert(instance, value);
        let mut appended = Vec::new();
        loop {
            let seq = state.next_seq;
            let value = match state.staged.remove(&seq) {
                Some(value) => value,
                None => break,
            };
            let entry = LogEntry { seq, value };
            if let Err(err) = state.backend.write(&entry) {
                WRITE_FAILED.click();
                clue!(COLLECTOR, ERROR, {
                    write_failed: format!("{}", err),
                });
                self.poison.store(true, Ordering::Relaxed);
                break;
            }
            APPENDED.click();
            appended.push(entry.value);
            state.next_seq += 1;
        }
        let frontier = state.next_seq;
        drop(state);
        self.processor.advance_to(frontier);
        self.decided.notify_all();
        for value in appended.into_iter() {
            let _ = delivery.send(value);
        }
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::sync::mpsc::channel;

    use synod_pb::PaxosMessage;

    use super::*;

    fn solo_log() -> (Arc<Switchboard<Envelope>>, Arc<Log>, Receiver<Vec<u8>>) {
        let switchboard = Arc::new(Switchboard::new());
        let (tx, rx) = channel();
        let log = Log::start(
            LogOptions::default(),
            Box::new(MemoryBackend::new()),
            Arc::clone(&switchboard),
            "solo",
            1,
            tx,
        )
        .unwrap();
        (switchboard, log, rx)
    }

    fn await_frontier(log: &Arc<Log>, seq: u64) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while log.next_seq() < seq {
            if Instant::now() >= deadline {
                panic!("frontier never reached {}", seq);
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn empty_log() {
        let (_switchboard, log, _rx) = solo_log();
        assert_eq!(None, log.latest().unwrap());
        assert!(log.replay(None).unwrap().is_empty());
        log.stop();
    }

    #[test]
    fn append_then_latest() {
        let (_switchboard, log, rx) = solo_log();
        assert_eq!(0, log.append(b"one".to_vec()).unwrap());
        assert_eq!(Some(b"one".to_vec()), log.latest().unwrap());
        assert_eq!(1, log.append(b"two".to_vec()).unwrap());
        assert_eq!(Some(b"two".to_vec()), log.latest().unwrap());
        assert_eq!(b"one".to_vec(), rx.recv().unwrap());
        assert_eq!(b"two".to_vec(), rx.recv().unwrap());
        log.stop();
    }

    #[test]
    fn replay_is_stable() {
        let (_switchboard, log, _rx) = solo_log();
        log.append(b"one".to_vec()).unwrap();
        log.append(b"two".to_vec()).unwrap();
        log.append(b"three".to_vec()).unwrap();
        let everything = log.replay(None).unwrap();
        assert_eq!(
            vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()],
            everything
        );
        assert_eq!(log.replay(Some(1)).unwrap(), log.replay(Some(1)).unwrap());
        assert_eq!(
            vec![b"two".to_vec(), b"three".to_vec()],
            log.replay(Some(1)).unwrap()
        );
        log.stop();
    }

    #[test]
    fn duplicate_decision_is_ignored() {
        let (switchboard, log, _rx) = solo_log();
        log.append(b"one".to_vec()).unwrap();
        // Replay the decision for instance 0 straight at the learner.
        switchboard.send_to(
            "solo",
            Envelope::to_learners(
                0,
                PaxosMessage::Decide {
                    value: b"one".to_vec(),
                },
            ),
        );
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(vec![b"one".to_vec()], log.replay(None).unwrap());
        log.stop();
    }

    #[test]
    fn early_decisions_stage_until_the_gap_fills() {
        let (switchboard, log, _rx) = solo_log();
        switchboard.send_to(
            "solo",
            Envelope::to_learners(
                1,
                PaxosMessage::Decide {
                    value: b"two".to_vec(),
                },
            ),
        );
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(0, log.next_seq());
        switchboard.send_to(
            "solo",
            Envelope::to_learners(
                0,
                PaxosMessage::Decide {
                    value: b"one".to_vec(),
                },
            ),
        );
        await_frontier(&log, 2);
        assert_eq!(
            vec![b"one".to_vec(), b"two".to_vec()],
            log.replay(None).unwrap()
        );
        log.stop();
    }

    #[test]
    fn recovery_resumes_from_the_backend() {
        let mut backend = MemoryBackend::new();
        backend
            .write(&LogEntry {
                seq: 0,
                value: b"one".to_vec(),
            })
            .unwrap();
        backend
            .write(&LogEntry {
                seq: 1,
                value: b"two".to_vec(),
            })
            .unwrap();
        let switchboard = Arc::new(Switchboard::new());
        let (tx, _rx) = channel();
        let log = Log::start(
            LogOptions::default(),
            Box::new(backend),
            switchboard,
            "solo",
            1,
            tx,
        )
        .unwrap();
        assert_eq!(2, log.next_seq());
        assert_eq!(2, log.append(b"three".to_vec()).unwrap());
        assert_eq!(
            vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()],
            log.replay(None).unwrap()
        );
        log.stop();
    }

    struct BrittleBackend {
        inner: MemoryBackend,
        writes_before_failure: usize,
    }

    impl Backend for BrittleBackend {
        fn write(&mut self, entry: &LogEntry) -> Result<(), Error> {
            if self.writes_before_failure == 0 {
                return Err(Error::IoError {
                    core: ErrorCore::default(),
                    what: "disk on fire".to_string(),
                });
            }
            self.writes_before_failure -= 1;
            self.inner.write(entry)
        }

        fn latest(&self) -> Result<Option<LogEntry>, Error> {
            self.inner.latest()
        }

        fn all(&self, starting_from: Option<u64>) -> Result<Vec<LogEntry>, Error> {
            self.inner.all(starting_from)
        }
    }

    #[test]
    fn write_failure_poisons_the_log() {
        let switchboard = Arc::new(Switchboard::new());
        let (tx, _rx) = channel();
        let backend = BrittleBackend {
            inner: MemoryBackend::new(),
            writes_before_failure: 1,
        };
        let log = Log::start(
            LogOptions::default().with_append_timeout_ms(2_000),
            Box::new(backend),
            switchboard,
            "solo",
            1,
            tx,
        )
        .unwrap();
        assert_eq!(0, log.append(b"one".to_vec()).unwrap());
        match log.append(b"two".to_vec()) {
            Err(Error::Corruption { context, .. }) => assert_eq!("log is poisoned", context),
            _ => panic!("a failed write should poison the log"),
        }
        match log.append(b"three".to_vec()) {
            Err(Error::Corruption { .. }) => {}
            _ => panic!("a poisoned log should stay poisoned"),
        }
        log.stop();
    }

    #[test]
    fn memory_backend_refuses_gaps() {
        let mut backend = MemoryBackend::new();
        let entry = LogEntry {
            seq: 3,
            value: b"gap".to_vec(),
        };
        assert!(matches!(
            backend.write(&entry),
            Err(Error::Corruption { .. })
        ));
    }

    #[test]
    fn replicated_appends_reach_every_log() {
        let switchboard = Arc::new(Switchboard::new());
        let (tx1, _rx1) = channel();
        let (tx2, _rx2) = channel();
        let log1 = Log::start(
            LogOptions::default(),
            Box::new(MemoryBackend::new()),
            Arc::clone(&switchboard),
            "p1",
            2,
            tx1,
        )
        .unwrap();
        let log2 = Log::start(
            LogOptions::default(),
            Box::new(MemoryBackend::new()),
            Arc::clone(&switchboard),
            "p2",
            2,
            tx2,
        )
        .unwrap();
        assert_eq!(0, log1.append(b"from-p1".to_vec()).unwrap());
        await_frontier(&log2, 1);
        assert_eq!(1, log2.append(b"from-p2".to_vec()).unwrap());
        await_frontier(&log1, 2);
        let expected = vec![b"from-p1".to_vec(), b"from-p2".to_vec()];
        assert_eq!(expected, log1.replay(None).unwrap());
        assert_eq!(expected, log2.replay(None).unwrap());
        log1.stop();
        log2.stop();
    }

    #[test]
    fn competing_appends_both_land() {
        let switchboard = Arc::new(Switchboard::new());
        let (tx1, _rx1) = channel();
        let (tx2, _rx2) = channel();
        let log1 = Log::start(
            LogOptions::default(),
            Box::new(MemoryBackend::new()),
            Arc::clone(&switchboard),
            "p1",
            2,
            tx1,
        )
        .unwrap();
        let log2 = Log::start(
            LogOptions::default(),
            Box::new(MemoryBackend::new()),
            Arc::clone(&switchboard),
            "p2",
            2,
            tx2,
        )
        .unwrap();
        let racer1 = Arc::clone(&log1);
        let racer2 = Arc::clone(&log2);
        let t1 = std::thread::spawn(move || racer1.append(b"X".to_vec()).unwrap());
        let t2 = std::thread::spawn(move || racer2.append(b"Y".to_vec()).unwrap());
        let seq1 = t1.join().unwrap();
        let seq2 = t2.join().unwrap();
        assert_ne!(seq1, seq2);
        let frontier = std::cmp::max(seq1, seq2) + 1;
        // Both logs settle on the same sequence once the decision stream drains.
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let replay1 = log1.replay(None).unwrap();
            let replay2 = log2.replay(None).unwrap();
            if replay1 == replay2 && replay1.len() >= frontier as usize {
                break;
            }
            if Instant::now() >= deadline {
                panic!("logs never converged: {:?} vs {:?}", replay1, replay2);
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        log1.stop();
        log2.stop();
    }
}

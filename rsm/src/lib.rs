#![doc = include_str!("../README.md")]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use biometrics::{Collector, Counter};
use buffertk::{stack_pack, Packable, Unpackable};
use indicio::{clue, ERROR, INFO};
use prototk_derive::Message;
use sync42::background::BackgroundThread;
use zerror_core::ErrorCore;

use dlog::{Backend, Log, LogOptions};
use fsm::{Machine, Operator, Outcome};
use switchboard::Switchboard;
use synod_pb::Envelope;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static SUBMIT: Counter = Counter::new("rsm.submit");
static APPLIED: Counter = Counter::new("rsm.applied");
static COMMAND_REJECTED: Counter = Counter::new("rsm.command_rejected");
static DECODE_FAILED: Counter = Counter::new("rsm.decode_failed");
static APPLY_FAILED: Counter = Counter::new("rsm.apply_failed");

/// Register the biometrics for the replicated state machine.
pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&SUBMIT);
    collector.register_counter(&APPLIED);
    collector.register_counter(&COMMAND_REJECTED);
    collector.register_counter(&DECODE_FAILED);
    collector.register_counter(&APPLY_FAILED);
}

///////////////////////////////////////////// COLLECTOR ////////////////////////////////////////////

/// The indicio collector for the replicated state machine.
pub static COLLECTOR: indicio::Collector = indicio::Collector::new();

/////////////////////////////////////////////// Error //////////////////////////////////////////////

/// The error type for replica operations.
#[derive(Message, zerror_derive::Z)]
pub enum Error {
    #[prototk(499712, message)]
    Success {
        #[prototk(1, message)]
        core: ErrorCore,
    },
    #[prototk(499713, message)]
    FsmError {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, message)]
        what: fsm::Error,
    },
    #[prototk(499714, message)]
    LogError {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, message)]
        what: dlog::Error,
    },
    #[prototk(499715, message)]
    SerializationError {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, message)]
        what: prototk::Error,
    },
}

impl Default for Error {
    fn default() -> Self {
        Self::Success {
            core: ErrorCore::default(),
        }
    }
}

impl From<fsm::Error> for Error {
    fn from(what: fsm::Error) -> Self {
        Self::FsmError {
            core: ErrorCore::default(),
            what,
        }
    }
}

impl From<dlog::Error> for Error {
    fn from(what: dlog::Error) -> Self {
        Self::LogError {
            core: ErrorCore::default(),
            what,
        }
    }
}

impl From<prototk::Error> for Error {
    fn from(what: prototk::Error) -> Self {
        Self::SerializationError {
            core: ErrorCore::default(),
            what,
        }
    }
}

////////////////////////////////////////// ReplicaOptions //////////////////////////////////////////

/// Options for one replica of a replicated state machine.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReplicaOptions {
    /// The name this replica joins the cluster under.  Must be unique.
    pub name: String,
    /// The full roster of the cluster, this replica included.  Quorums are judged against the
    /// roster, not against whoever happens to be up.
    pub participants: Vec<String>,
    /// The state the machine starts in.
    pub start_state: String,
    /// Options for the distributed log.
    pub log: LogOptions,
}

impl ReplicaOptions {
    /// Set the replica's name.
    pub fn with_name(mut self, name: &str) -> Self {
        name.clone_into(&mut self.name);
        self
    }

    /// Set the cluster roster.
    pub fn with_participants(mut self, participants: &[&str]) -> Self {
        self.participants = participants.iter().map(|p| p.to_string()).collect();
        self
    }

    /// Set the machine's start state.
    pub fn with_start_state(mut self, start_state: &str) -> Self {
        start_state.clone_into(&mut self.start_state);
        self
    }

    /// Set the log options.
    pub fn with_log(mut self, log: LogOptions) -> Self {
        self.log = log;
        self
    }
}

impl Default for ReplicaOptions {
    fn default() -> Self {
        Self {
            name: "replica".to_string(),
            participants: vec!["replica".to_string()],
            start_state: String::new(),
            log: LogOptions::default(),
        }
    }
}

////////////////////////////////////////////// Replica /////////////////////////////////////////////

/// One replica of a replicated state machine.  Commands submitted anywhere in the cluster reach
/// every replica's operator in decision order, so every replica walks the same trajectory
/// through the machine.  Determinism of the machine is the caller's responsibility; the context
/// must be effect-free.
pub struct Replica<I, C> {
    operator: Arc<Operator<I, C>>,
    log: Arc<Log>,
    pump: Mutex<Option<BackgroundThread>>,
}

impl<I, C> Replica<I, C>
where
    I: Clone + Send + 'static + Packable + for<'a> Unpackable<'a, Error = prototk::Error>,
    C: Send + 'static,
{
    /// Start a replica:  join the switchboard, bring up the log over `backend`, start the
    /// operator at the declared start state, and subscribe the operator to log deliveries.
    /// Entries already in the backend replay through the operator before the replica goes live.
    pub fn start(
        options: ReplicaOptions,
        machine: Machine<I, C>,
        backend: Box<dyn Backend>,
        switchboard: Arc<Switchboard<Envelope>>,
    ) -> Result<Arc<Self>, Error> {
        let operator = Arc::new(Operator::start(machine, &options.start_state)?);
        for entry in backend.all(None)? {
            Self::apply(&operator, &entry.value);
        }
        let (delivery_tx, delivery_rx) = std::sync::mpsc::channel();
        let log = Log::start(
            options.log.clone(),
            backend,
            switchboard,
            &options.name,
            options.participants.len(),
            delivery_tx,
        )?;
        let replica = Arc::new(Self {
            operator,
            log,
            pump: Mutex::new(None),
        });
        let runner = Arc::clone(&replica);
        let pump = BackgroundThread::spawn(move |done| runner.pump(delivery_rx, done));
        *replica.pump.lock().unwrap() = Some(pump);
        Ok(replica)
    }

    /// Submit `cmd` to the cluster.  Returns the log sequence number the command landed at.
    /// The command reaches this replica's machine through the same delivery path as everyone
    /// else's, so the local state may trail the append by a moment.
    pub fn submit(&self, cmd: I) -> Result<u64, Error> {
        SUBMIT.click();
        let buf = stack_pack(&cmd).to_vec();
        Ok(self.log.append(buf)?)
    }

    /// The state this replica's machine currently rests in.
    pub fn current_state(&self) -> String {
        self.operator.current_state()
    }

    /// The most recently decided command, decoded.
    pub fn latest(&self) -> Result<Option<I>, Error> {
        match self.log.latest()? {
            Some(buf) => {
                let (cmd, _) = <I as Unpackable>::unpack(&buf)?;
                Ok(Some(cmd))
            }
            None => Ok(None),
        }
    }

    /// Every decided command with `seq >= starting_from`, decoded, in decision order.
    pub fn replay(&self, starting_from: Option<u64>) -> Result<Vec<I>, Error> {
        let mut commands = Vec::new();
        for buf in self.log.replay(starting_from)? {
            let (cmd, _) = <I as Unpackable>::unpack(&buf)?;
            commands.push(cmd);
        }
        Ok(commands)
    }

    /// The sequence number the next decision will fill.
    pub fn next_seq(&self) -> u64 {
        self.log.next_seq()
    }

    /// Stop the log, the processor beneath it, and the delivery pump.
    pub fn stop(&self) {
        self.log.stop();
        let pump = self.pump.lock().unwrap().take();
        drop(pump);
    }

    fn pump(&self, delivery: Receiver<Vec<u8>>, done: Arc<AtomicBool>) {
        while !done.load(Ordering::Relaxed) {
            match delivery.recv_timeout(Duration::from_millis(50)) {
                Ok(buf) => Self::apply(&self.operator, &buf),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    break;
                }
            }
        }
    }

    /// Apply one decided value.  Undecodable values and rejected commands are counted and
    /// skipped; every replica skips them identically, so the cluster stays in lock-step.
    fn apply(operator: &Operator<I, C>, buf: &[u8]) {
        let cmd = match <I as Unpackable>::unpack(buf) {
            Ok((cmd, _)) => cmd,
            Err(err) => {
                DECODE_FAILED.click();
                clue!(COLLECTOR, ERROR, {
                    decode_failed: format!("{:?}", err),
                });
                return;
            }
        };
        match operator.input(cmd) {
            Ok(Outcome::Taken { .. }) => {
                APPLIED.click();
            }
            Ok(Outcome::Rejected { state, .. }) => {
                COMMAND_REJECTED.click();
                clue!(COLLECTOR, INFO, {
                    command_rejected: &state,
                });
            }
            Err(err) => {
                APPLY_FAILED.click();
                clue!(COLLECTOR, ERROR, {
                    apply_failed: format!("{}", err),
                });
            }
        }
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

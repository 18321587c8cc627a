#![doc = include_str!("../README.md")]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use biometrics::{Collector, Counter};
use indicio::{clue, INFO};
use sync42::background::BackgroundThread;

use switchboard::Switchboard;
use synod_pb::{Envelope, Error, PaxosMessage, Route};

mod acceptor;
mod leader;

pub use acceptor::Acceptor;
pub use leader::{is_quorum, Leader};

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static PROPOSE: Counter = Counter::new("synod.processor.propose");
static START_BALLOT: Counter = Counter::new("synod.processor.start_ballot");
static DECIDE_RX: Counter = Counter::new("synod.processor.decide");
static STALE_INSTANCE: Counter = Counter::new("synod.processor.stale_instance");
static UNEXPECTED: Counter = Counter::new("synod.processor.unexpected");
static ADVANCE: Counter = Counter::new("synod.processor.advance");

/// Register the biometrics for the synod protocol.
pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&PROPOSE);
    collector.register_counter(&START_BALLOT);
    collector.register_counter(&DECIDE_RX);
    collector.register_counter(&STALE_INSTANCE);
    collector.register_counter(&UNEXPECTED);
    collector.register_counter(&ADVANCE);
    acceptor::register_biometrics(collector);
    leader::register_biometrics(collector);
}

///////////////////////////////////////////// COLLECTOR ////////////////////////////////////////////

/// The indicio collector for the synod protocol.
pub static COLLECTOR: indicio::Collector = indicio::Collector::new();

/////////////////////////////////////////////// Core ///////////////////////////////////////////////

struct Core {
    instance: u64,
    acceptor: Acceptor,
    leader: Leader,
}

//////////////////////////////////////////// Processor /////////////////////////////////////////////

/// A Processor hosts one participant's acceptor and leader and multiplexes the participant's
/// inbox by the role each envelope addresses.  Decisions go to the upper process as
/// `(instance, value)` pairs on the channel provided at start; everything else is internal to
/// the protocol.
///
/// The processor works one instance at a time.  Acceptor- and leader-bound traffic for any other
/// instance is dropped; the upper process advances the instance as decisions reach its log.
pub struct Processor {
    name: String,
    switchboard: Arc<Switchboard<Envelope>>,
    core: Mutex<Core>,
    decisions: Sender<(u64, Vec<u8>)>,
    background: Mutex<Option<BackgroundThread>>,
}

impl Processor {
    /// Join `switchboard` under `name` and start the inbox loop.  The processor quorums against
    /// `total_participants`, which counts every participant the ensemble was configured with,
    /// not merely those currently joined.
    pub fn start(
        name: &str,
        switchboard: Arc<Switchboard<Envelope>>,
        total_participants: usize,
        decisions: Sender<(u64, Vec<u8>)>,
    ) -> Result<Arc<Self>, Error> {
        let (inbox_tx, inbox_rx) = std::sync::mpsc::channel();
        switchboard.join(name, inbox_tx)?;
        let processor = Arc::new(Self {
            name: name.to_string(),
            switchboard,
            core: Mutex::new(Core {
                instance: 0,
                acceptor: Acceptor::new(name),
                leader: Leader::new(name, total_participants),
            }),
            decisions,
            background: Mutex::new(None),
        });
        let runner = Arc::clone(&processor);
        let background = BackgroundThread::spawn(move |done| runner.run(inbox_rx, done));
        *processor.background.lock().unwrap() = Some(background);
        Ok(processor)
    }

    /// This participant's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The instance this processor is working.
    pub fn instance(&self) -> u64 {
        self.core.lock().unwrap().instance
    }

    /// Set the value the local leader will champion.  Fire-and-forget.
    pub fn propose(&self, value: Vec<u8>) {
        PROPOSE.click();
        self.core.lock().unwrap().leader.set_value(value);
    }

    /// Have the local leader rally a fresh ballot for the current instance.  Fire-and-forget.
    pub fn start_ballot(&self) {
        START_BALLOT.click();
        let mut core = self.core.lock().unwrap();
        let prepare = core.leader.start_ballot();
        self.switchboard
            .broadcast(Envelope::to_acceptors(core.instance, prepare));
    }

    /// Advance to `instance`, forgetting the instance-local role state.  Ballots survive the
    /// advance, so they stay monotone for the life of the participant.
    pub fn advance_to(&self, instance: u64) {
        let mut core = self.core.lock().unwrap();
        if instance > core.instance {
            ADVANCE.click();
            core.instance = instance;
            core.acceptor.next_instance();
            core.leader.next_instance();
        }
    }

    /// Leave the switchboard and join the inbox loop.
    pub fn stop(&self) {
        self.switchboard.leave(&self.name);
        let background = self.background.lock().unwrap().take();
        drop(background);
    }

    fn run(&self, inbox: Receiver<Envelope>, done: Arc<AtomicBool>) {
        while !done.load(Ordering::Relaxed) {
            match inbox.recv_timeout(Duration::from_millis(50)) {
                Ok(envelope) => self.handle(envelope),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    break;
                }
            }
        }
    }

    fn handle(&self, envelope: Envelope) {
        let Envelope { instance, route } = envelope;
        let mut core = self.core.lock().unwrap();
        match route {
            Route::ToLearners {
                msg: PaxosMessage::Decide { value },
            } => {
                DECIDE_RX.click();
                // The log judges freshness by sequence number, so decisions pass through
                // regardless of the instance this processor is working.
                let _ = self.decisions.send((instance, value));
            }
            _ if instance != core.instance => {
                STALE_INSTANCE.click();
                clue!(COLLECTOR, INFO, {
                    stale_instance: {
                        name: &self.name,
                        theirs: format!("{}", instance),
                        ours: format!("{}", core.instance),
                    },
                });
            }
            Route::ToAcceptors { msg } => match msg {
                PaxosMessage::Prepare { ballot, leader } => {
                    if let Some((to, reply)) = core.acceptor.prepare(ballot, &leader) {
                        self.switchboard
                            .send_to(&to, Envelope::to_leader(instance, reply));
                    }
                }
                PaxosMessage::Propose {
                    ballot,
                    value,
                    leader,
                } => {
                    if let Some((to, reply)) = core.acceptor.propose(ballot, value, &leader) {
                        self.switchboard
                            .send_to(&to, Envelope::to_leader(instance, reply));
                    }
                }
                _ => {
                    UNEXPECTED.click();
                }
            },
            Route::ToLeader { msg } => match msg {
                PaxosMessage::Promise { ballot, accepted } => {
                    if let Some(propose) = core.leader.promise(ballot, accepted) {
                        self.switchboard
                            .broadcast(Envelope::to_acceptors(instance, propose));
                    }
                }
                PaxosMessage::Accept { ballot, value } => {
                    if let Some(decide) = core.leader.accept(ballot, value) {
                        self.switchboard
                            .broadcast(Envelope::to_learners(instance, decide));
                    }
                }
                _ => {
                    UNEXPECTED.click();
                }
            },
            Route::ToLearners { .. } | Route::Nop => {
                UNEXPECTED.click();
            }
        }
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::sync::mpsc::channel;

    use super::*;

    fn ensemble(
        names: &[&str],
    ) -> (
        Arc<Switchboard<Envelope>>,
        Vec<Arc<Processor>>,
        Vec<Receiver<(u64, Vec<u8>)>>,
    ) {
        let switchboard = Arc::new(Switchboard::new());
        let mut processors = Vec::new();
        let mut receivers = Vec::new();
        for name in names {
            let (tx, rx) = channel();
            let processor =
                Processor::start(name, Arc::clone(&switchboard), names.len(), tx).unwrap();
            processors.push(processor);
            receivers.push(rx);
        }
        (switchboard, processors, receivers)
    }

    fn next_decision(rx: &Receiver<(u64, Vec<u8>)>) -> (u64, Vec<u8>) {
        rx.recv_timeout(Duration::from_secs(10))
            .expect("a decision should arrive")
    }

    #[test]
    fn one_proposer_three_learners() {
        let (_switchboard, processors, receivers) = ensemble(&["p1", "p2", "p3"]);
        processors[0].propose(b"X".to_vec());
        processors[0].start_ballot();
        for rx in receivers.iter() {
            let (instance, value) = next_decision(rx);
            assert_eq!(0, instance);
            assert_eq!(b"X".to_vec(), value);
        }
        for processor in processors.iter() {
            processor.stop();
        }
    }

    #[test]
    fn duplicate_participant_name() {
        let switchboard: Arc<Switchboard<Envelope>> = Arc::new(Switchboard::new());
        let (tx1, _rx1) = channel();
        let (tx2, _rx2) = channel();
        let first = Processor::start("p1", Arc::clone(&switchboard), 3, tx1).unwrap();
        match Processor::start("p1", Arc::clone(&switchboard), 3, tx2) {
            Err(Error::RegistryError { .. }) => {}
            _ => panic!("second join should fail"),
        }
        first.stop();
    }

    #[test]
    fn dueling_proposers_agree() {
        let (_switchboard, processors, receivers) = ensemble(&["p1", "p2", "p3"]);
        processors[0].propose(b"X".to_vec());
        processors[1].propose(b"Y".to_vec());
        processors[0].start_ballot();
        processors[1].start_ballot();
        let mut winners = Vec::new();
        for rx in receivers.iter() {
            let (instance, value) = next_decision(rx);
            assert_eq!(0, instance);
            winners.push(value);
        }
        assert!(winners[0] == b"X".to_vec() || winners[0] == b"Y".to_vec());
        assert_eq!(winners[0], winners[1]);
        assert_eq!(winners[1], winners[2]);
        for processor in processors.iter() {
            processor.stop();
        }
    }

    #[test]
    fn advance_resets_the_instance_but_not_the_ballots() {
        let (_switchboard, processors, receivers) = ensemble(&["p1", "p2", "p3"]);
        processors[0].propose(b"X".to_vec());
        processors[0].start_ballot();
        for rx in receivers.iter() {
            let _ = next_decision(rx);
        }
        for processor in processors.iter() {
            processor.advance_to(1);
            assert_eq!(1, processor.instance());
        }
        // The next instance decides independently of the first.
        processors[1].propose(b"Y".to_vec());
        processors[1].start_ballot();
        for rx in receivers.iter() {
            let (instance, value) = next_decision(rx);
            assert_eq!(1, instance);
            assert_eq!(b"Y".to_vec(), value);
        }
        for processor in processors.iter() {
            processor.stop();
        }
    }

    // A leader that crashes mid-instance, worked at the role level so the schedule is exact:
    // p1 rallies a ballot and proposes to a single acceptor before dying; p2 rallies a higher
    // ballot and must adopt p1's value.
    #[test]
    fn higher_ballot_adopts_the_orphaned_value() {
        let mut acceptors = vec![
            Acceptor::new("p1"),
            Acceptor::new("p2"),
            Acceptor::new("p3"),
        ];
        let mut p1 = Leader::new("p1", 3);
        let mut p2 = Leader::new("p2", 3);
        p1.set_value(b"X".to_vec());
        p2.set_value(b"Y".to_vec());
        // p1's round reaches every acceptor with prepare, but only p3 with propose.
        let prepare1 = match p1.start_ballot() {
            PaxosMessage::Prepare { ballot, .. } => ballot,
            _ => panic!("expected a prepare"),
        };
        let mut propose1 = None;
        for acceptor in acceptors.iter_mut() {
            let (_, promise) = acceptor.prepare(prepare1.clone(), "p1").unwrap();
            if let PaxosMessage::Promise { ballot, accepted } = promise {
                if let Some(msg) = p1.promise(ballot, accepted) {
                    propose1 = Some(msg);
                }
            }
        }
        let (ballot1, value1) = match propose1.expect("p1 should reach quorum") {
            PaxosMessage::Propose { ballot, value, .. } => (ballot, value),
            _ => panic!("expected a propose"),
        };
        assert!(acceptors[2].propose(ballot1, value1, "p1").is_some());
        // p1 dies here.  p2 rallies a higher ballot against p2 and p3.
        let prepare2 = match p2.start_ballot() {
            PaxosMessage::Prepare { ballot, .. } => ballot,
            _ => panic!("expected a prepare"),
        };
        assert!(prepare2 > prepare1);
        let mut propose2 = None;
        for acceptor in acceptors[1..].iter_mut() {
            let (_, promise) = acceptor.prepare(prepare2.clone(), "p2").unwrap();
            if let PaxosMessage::Promise { ballot, accepted } = promise {
                if let Some(msg) = p2.promise(ballot, accepted) {
                    propose2 = Some(msg);
                }
            }
        }
        match propose2.expect("p2 should reach quorum") {
            PaxosMessage::Propose { value, .. } => {
                // p3's promise carried X, so p2 champions X, not its own Y.
                assert_eq!(b"X".to_vec(), value);
            }
            _ => panic!("expected a propose"),
        }
    }
}

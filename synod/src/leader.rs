//! The leader rallies ballots, champions values, and declares decisions.

use biometrics::{Collector, Counter};
use indicio::{clue, INFO};
use synod_pb::{AcceptedRecord, Ballot, PaxosMessage};

use super::COLLECTOR;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static START_BALLOT: Counter = Counter::new("synod.leader.start_ballot");
static SET_VALUE: Counter = Counter::new("synod.leader.set_value");
static PROMISE_QUORUM: Counter = Counter::new("synod.leader.promise_quorum");
static ACCEPT_QUORUM: Counter = Counter::new("synod.leader.accept_quorum");
static STALE_PROMISE: Counter = Counter::new("synod.leader.stale_promise");
static STALE_ACCEPT: Counter = Counter::new("synod.leader.stale_accept");
static ADOPTED_VALUE: Counter = Counter::new("synod.leader.adopted_value");
static NOTHING_TO_PROPOSE: Counter = Counter::new("synod.leader.nothing_to_propose");

pub(crate) fn register_biometrics(collector: &Collector) {
    collector.register_counter(&START_BALLOT);
    collector.register_counter(&SET_VALUE);
    collector.register_counter(&PROMISE_QUORUM);
    collector.register_counter(&ACCEPT_QUORUM);
    collector.register_counter(&STALE_PROMISE);
    collector.register_counter(&STALE_ACCEPT);
    collector.register_counter(&ADOPTED_VALUE);
    collector.register_counter(&NOTHING_TO_PROPOSE);
}

////////////////////////////////////////////// quorum //////////////////////////////////////////////

/// A strict majority of `total`.
pub fn is_quorum(count: usize, total: usize) -> bool {
    2 * count > total
}

/////////////////////////////////////////////// Leader /////////////////////////////////////////////

/// The proposer half of a participant.  A leader champions at most one pending value at a time.
/// Promises and accepts aggregate across messages; the quorum test runs after every append and
/// the tally resets once quorum fires, so a quorum is declared exactly once per round.
pub struct Leader {
    name: String,
    total_participants: usize,
    current_value: Option<Vec<u8>>,
    latest_known_ballot: Ballot,
    promises_received: Vec<AcceptedRecord>,
    accepts_received: Vec<Vec<u8>>,
}

impl Leader {
    pub fn new(name: &str, total_participants: usize) -> Self {
        Self {
            name: name.to_string(),
            total_participants,
            current_value: None,
            latest_known_ballot: Ballot::bottom(name),
            promises_received: Vec::new(),
            accepts_received: Vec::new(),
        }
    }

    /// The ballot this leader is championing, or last saw.
    pub fn latest_known_ballot(&self) -> &Ballot {
        &self.latest_known_ballot
    }

    /// Set the value to champion and forget any round in flight.
    pub fn set_value(&mut self, value: Vec<u8>) {
        SET_VALUE.click();
        self.current_value = Some(value);
        self.promises_received.clear();
        self.accepts_received.clear();
    }

    /// Begin a new round under a ballot that supersedes every ballot this leader has seen.
    /// Returns the prepare to broadcast to the acceptors.
    pub fn start_ballot(&mut self) -> PaxosMessage {
        START_BALLOT.click();
        self.latest_known_ballot = self.latest_known_ballot.increase(&self.name);
        self.promises_received.clear();
        self.accepts_received.clear();
        PaxosMessage::Prepare {
            ballot: self.latest_known_ballot.clone(),
            leader: self.name.clone(),
        }
    }

    /// Tally a promise.  At quorum, select the value to champion and return the propose to
    /// broadcast to the acceptors.  Promises for ballots other than the one in flight are
    /// counted as stale and dropped.
    pub fn promise(&mut self, ballot: Ballot, accepted: AcceptedRecord) -> Option<PaxosMessage> {
        if ballot != self.latest_known_ballot {
            STALE_PROMISE.click();
            return None;
        }
        self.promises_received.push(accepted);
        if !is_quorum(self.promises_received.len(), self.total_participants) {
            return None;
        }
        PROMISE_QUORUM.click();
        // Adopt the value accepted under the highest ballot; fall back to the pending value when
        // every promise came back unset.
        let mut adopted: Option<&AcceptedRecord> = None;
        for record in self.promises_received.iter() {
            if record.value.is_none() {
                continue;
            }
            if adopted.map_or(true, |a| record.ballot > a.ballot) {
                adopted = Some(record);
            }
        }
        let value = match adopted {
            Some(record) => {
                ADOPTED_VALUE.click();
                clue!(COLLECTOR, INFO, {
                    adopted: {
                        leader: &self.name,
                        ballot: format!("{:?}", record.ballot),
                    },
                });
                record.value.clone()
            }
            None => self.current_value.clone(),
        };
        self.promises_received.clear();
        let value = match value {
            Some(value) => value,
            None => {
                NOTHING_TO_PROPOSE.click();
                clue!(COLLECTOR, INFO, {
                    nothing_to_propose: &self.name,
                });
                return None;
            }
        };
        Some(PaxosMessage::Propose {
            ballot: self.latest_known_ballot.clone(),
            value,
            leader: self.name.clone(),
        })
    }

    /// Tally an accept.  At quorum, return the decide to broadcast to the learners.
    pub fn accept(&mut self, ballot: Ballot, value: Vec<u8>) -> Option<PaxosMessage> {
        if ballot != self.latest_known_ballot {
            STALE_ACCEPT.click();
            return None;
        }
        self.accepts_received.push(value.clone());
        if !is_quorum(self.accepts_received.len(), self.total_participants) {
            return None;
        }
        ACCEPT_QUORUM.click();
        self.accepts_received.clear();
        Some(PaxosMessage::Decide { value })
    }

    /// Forget the round and the pending value ahead of the next instance.  The latest known
    /// ballot survives so this leader's next ballot supersedes everything it has seen.
    pub fn next_instance(&mut self) {
        self.current_value = None;
        self.promises_received.clear();
        self.accepts_received.clear();
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

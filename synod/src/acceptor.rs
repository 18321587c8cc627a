//! The acceptor is the mutable memory of the synod protocol.

use biometrics::{Collector, Counter};
use indicio::{clue, INFO};
use synod_pb::{AcceptedRecord, Ballot, PaxosMessage};

use super::COLLECTOR;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static PROMISE: Counter = Counter::new("synod.acceptor.promise");
static ACCEPT: Counter = Counter::new("synod.acceptor.accept");
static IGNORE_PREPARE: Counter = Counter::new("synod.acceptor.ignore_prepare");
static IGNORE_PROPOSE: Counter = Counter::new("synod.acceptor.ignore_propose");

pub(crate) fn register_biometrics(collector: &Collector) {
    collector.register_counter(&PROMISE);
    collector.register_counter(&ACCEPT);
    collector.register_counter(&IGNORE_PREPARE);
    collector.register_counter(&IGNORE_PROPOSE);
}

///////////////////////////////////////////// Acceptor /////////////////////////////////////////////

/// An acceptor holds the highest ballot it has seen and the last value it accepted.  The ballot
/// never regresses:  prepares and proposes under superseded ballots are ignored.
pub struct Acceptor {
    name: String,
    latest_known_ballot: Ballot,
    last_accepted: AcceptedRecord,
}

impl Acceptor {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            latest_known_ballot: Ballot::bottom(name),
            last_accepted: AcceptedRecord::unset(name),
        }
    }

    /// The highest ballot this acceptor has seen.
    pub fn latest_known_ballot(&self) -> &Ballot {
        &self.latest_known_ballot
    }

    /// The last record this acceptor accepted.
    pub fn last_accepted(&self) -> &AcceptedRecord {
        &self.last_accepted
    }

    /// Handle a prepare under `ballot` from `leader`.  Returns the promise to send back to
    /// `leader`, or None when the ballot is superseded and the prepare is ignored.
    pub fn prepare(&mut self, ballot: Ballot, leader: &str) -> Option<(String, PaxosMessage)> {
        if ballot >= self.latest_known_ballot {
            PROMISE.click();
            self.latest_known_ballot = ballot.clone();
            Some((
                leader.to_string(),
                PaxosMessage::Promise {
                    ballot,
                    accepted: self.last_accepted.clone(),
                },
            ))
        } else {
            IGNORE_PREPARE.click();
            clue!(COLLECTOR, INFO, {
                ignore_prepare: {
                    acceptor: &self.name,
                    ballot: format!("{:?}", ballot),
                    latest_known: format!("{:?}", self.latest_known_ballot),
                },
            });
            None
        }
    }

    /// Handle a propose of `value` under `ballot` from `leader`.  Returns the accept to send back
    /// to `leader`, or None when the ballot is superseded and the propose is ignored.
    pub fn propose(
        &mut self,
        ballot: Ballot,
        value: Vec<u8>,
        leader: &str,
    ) -> Option<(String, PaxosMessage)> {
        if ballot >= self.latest_known_ballot {
            ACCEPT.click();
            self.last_accepted = AcceptedRecord {
                value: Some(value.clone()),
                ballot: ballot.clone(),
            };
            Some((leader.to_string(), PaxosMessage::Accept { ballot, value }))
        } else {
            IGNORE_PROPOSE.click();
            clue!(COLLECTOR, INFO, {
                ignore_propose: {
                    acceptor: &self.name,
                    ballot: format!("{:?}", ballot),
                    latest_known: format!("{:?}", self.latest_known_ballot),
                },
            });
            None
        }
    }

    /// Forget the accepted record ahead of the next instance.  The latest known ballot survives
    /// so ballots stay monotone across instances.
    pub fn next_instance(&mut self) {
        self.last_accepted = AcceptedRecord::unset(&self.name);
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#![doc = include_str!("../README.md")]

use prototk_derive::Message;

use zerror_core::ErrorCore;

/////////////////////////////////////////////// Error //////////////////////////////////////////////

#[derive(Message, zerror_derive::Z)]
pub enum Error {
    #[prototk(475136, message)]
    Success {
        #[prototk(1, message)]
        core: ErrorCore,
    },
    #[prototk(475137, message)]
    SerializationError {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, message)]
        what: prototk::Error,
    },
    #[prototk(475138, message)]
    RegistryError {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, message)]
        what: switchboard::Error,
    },
    #[prototk(475139, message)]
    NothingToPropose {
        #[prototk(1, message)]
        core: ErrorCore,
    },
}

impl Default for Error {
    fn default() -> Self {
        Self::Success {
            core: ErrorCore::default(),
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

impl From<switchboard::Error> for Error {
    fn from(what: switchboard::Error) -> Self {
        Self::RegistryError {
            core: ErrorCore::default(),
            what,
        }
    }
}

////////////////////////////////////////////// Ballot //////////////////////////////////////////////

/// Ballots are neither created nor destroyed, they just exist.  The overall protocol must
/// guarantee that no two participants ever work the synod protocol using the same ballot.  To
/// accomplish this, a ballot is the ordered pair of (number, leader), where only the listed
/// leader is allowed to issue proposals under the ballot.
///
/// Ballots are comparable.  When `ballot1` < `ballot2`, we will say that ballot2 supersedes
/// ballot1.  The comparison is lexicographic by (number, leader), which ensures that a proposer
/// whose ballot is superseded by a competing proposer can select another ballot to supersede
/// either of the first two.
#[derive(Clone, Debug, Default, Eq, Hash, Message, PartialEq, PartialOrd, Ord)]
pub struct Ballot {
    #[prototk(1, uint64)]
    pub number: u64,
    #[prototk(2, string)]
    pub leader: String,
}

impl Ballot {
    /// The smallest possible ballot.
    pub const BOTTOM: Ballot = Ballot {
        number: 0,
        leader: String::new(),
    };

    /// The ballot a participant starts from before it has seen any other.
    pub fn bottom(leader: &str) -> Self {
        Self {
            number: 0,
            leader: leader.to_string(),
        }
    }

    /// The smallest ballot championed by `leader` that supersedes this one.
    pub fn increase(&self, leader: &str) -> Self {
        Self {
            number: self.number + 1,
            leader: leader.to_string(),
        }
    }
}

/////////////////////////////////////////// AcceptedRecord /////////////////////////////////////////

/// The one record each acceptor holds:  the last value it accepted and the ballot it accepted the
/// value under.  `value` is `None` until the acceptor accepts for the first time in an instance.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct AcceptedRecord {
    #[prototk(1, bytes)]
    pub value: Option<Vec<u8>>,
    #[prototk(2, message)]
    pub ballot: Ballot,
}

impl AcceptedRecord {
    /// The record an acceptor holds before accepting anything.
    pub fn unset(leader: &str) -> Self {
        Self {
            value: None,
            ballot: Ballot::bottom(leader),
        }
    }
}

/////////////////////////////////////////// PaxosMessage ///////////////////////////////////////////

/// The payloads of the synod protocol.
#[derive(Clone, Debug, Default, Message)]
pub enum PaxosMessage {
    #[prototk(1, message)]
    #[default]
    Nop,
    #[prototk(2, message)]
    Prepare {
        #[prototk(1, message)]
        ballot: Ballot,
        #[prototk(2, string)]
        leader: String,
    },
    #[prototk(3, message)]
    Promise {
        #[prototk(1, message)]
        ballot: Ballot,
        #[prototk(2, message)]
        accepted: AcceptedRecord,
    },
    #[prototk(4, message)]
    Propose {
        #[prototk(1, message)]
        ballot: Ballot,
        #[prototk(2, bytes)]
        value: Vec<u8>,
        #[prototk(3, string)]
        leader: String,
    },
    #[prototk(5, message)]
    Accept {
        #[prototk(1, message)]
        ballot: Ballot,
        #[prototk(2, bytes)]
        value: Vec<u8>,
    },
    #[prototk(6, message)]
    Decide {
        #[prototk(1, bytes)]
        value: Vec<u8>,
    },
}

/////////////////////////////////////////////// Route //////////////////////////////////////////////

/// The role a payload is addressed to.
#[derive(Clone, Debug, Default, Message)]
pub enum Route {
    #[prototk(1, message)]
    #[default]
    Nop,
    #[prototk(2, message)]
    ToAcceptors {
        #[prototk(1, message)]
        msg: PaxosMessage,
    },
    #[prototk(3, message)]
    ToLeader {
        #[prototk(1, message)]
        msg: PaxosMessage,
    },
    #[prototk(4, message)]
    ToLearners {
        #[prototk(1, message)]
        msg: PaxosMessage,
    },
}

///////////////////////////////////////////// Envelope /////////////////////////////////////////////

/// An envelope addresses a payload to a role for one instance of agreement.  The instance number
/// doubles as the log sequence number the instance's decision will fill.
#[derive(Clone, Debug, Default, Message)]
pub struct Envelope {
    #[prototk(1, uint64)]
    pub instance: u64,
    #[prototk(2, message)]
    pub route: Route,
}

impl Envelope {
    /// Address `msg` to the acceptors for `instance`.
    pub fn to_acceptors(instance: u64, msg: PaxosMessage) -> Self {
        Self {
            instance,
            route: Route::ToAcceptors { msg },
        }
    }

    /// Address `msg` to the leader for `instance`.
    pub fn to_leader(instance: u64, msg: PaxosMessage) -> Self {
        Self {
            instance,
            route: Route::ToLeader { msg },
        }
    }

    /// Address `msg` to the learners for `instance`.
    pub fn to_learners(instance: u64, msg: PaxosMessage) -> Self {
        Self {
            instance,
            route: Route::ToLearners { msg },
        }
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#![doc = include_str!("../README.md")]

use std::collections::BTreeMap;
use std::sync::mpsc::Sender;
use std::sync::Mutex;

use biometrics::{Collector, Counter};
use indicio::{clue, ERROR};
use prototk_derive::Message;
use zerror_core::ErrorCore;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static JOIN: Counter = Counter::new("switchboard.join");
static JOIN_DUPLICATE: Counter = Counter::new("switchboard.join.duplicate");
static LEAVE: Counter = Counter::new("switchboard.leave");
static SEND_TO: Counter = Counter::new("switchboard.send_to");
static NO_SUCH_PARTICIPANT: Counter = Counter::new("switchboard.send_to.no_such_participant");
static ENDPOINT_GONE: Counter = Counter::new("switchboard.send_to.endpoint_gone");
static BROADCAST: Counter = Counter::new("switchboard.broadcast");

/// Register the biometrics for the switchboard.
pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&JOIN);
    collector.register_counter(&JOIN_DUPLICATE);
    collector.register_counter(&LEAVE);
    collector.register_counter(&SEND_TO);
    collector.register_counter(&NO_SUCH_PARTICIPANT);
    collector.register_counter(&ENDPOINT_GONE);
    collector.register_counter(&BROADCAST);
}

///////////////////////////////////////////// COLLECTOR ////////////////////////////////////////////

/// The indicio collector for the switchboard.
pub static COLLECTOR: indicio::Collector = indicio::Collector::new();

/////////////////////////////////////////////// Error //////////////////////////////////////////////

/// The error type for registry operations.
#[derive(Message, zerror_derive::Z)]
pub enum Error {
    #[prototk(442368, message)]
    Success {
        #[prototk(1, message)]
        core: ErrorCore,
    },
    #[prototk(442369, message)]
    DuplicateName {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, string)]
        name: String,
    },
}

impl Default for Error {
    fn default() -> Self {
        Self::Success {
            core: ErrorCore::default(),
        }
    }
}

/////////////////////////////////////////// Switchboard ////////////////////////////////////////////

/// A Switchboard maps participant names to endpoints.  An endpoint is the sending half of a
/// channel of `M`.  The registry serializes join/leave/resolve; sends clone the endpoint out of
/// the registry so delivery itself never holds the registry lock.
pub struct Switchboard<M: Clone + Send + 'static> {
    participants: Mutex<BTreeMap<String, Sender<M>>>,
}

impl<M: Clone + Send + 'static> Switchboard<M> {
    /// Create a new, empty switchboard.
    pub fn new() -> Self {
        Self {
            participants: Mutex::new(BTreeMap::new()),
        }
    }

    /// Register `endpoint` under `name`.  Fails if `name` is taken.
    pub fn join(&self, name: &str, endpoint: Sender<M>) -> Result<(), Error> {
        JOIN.click();
        let mut participants = self.participants.lock().unwrap();
        if participants.contains_key(name) {
            JOIN_DUPLICATE.click();
            return Err(Error::DuplicateName {
                core: ErrorCore::default(),
                name: name.to_string(),
            });
        }
        participants.insert(name.to_string(), endpoint);
        Ok(())
    }

    /// Remove `name` from the registry.  Removing an absent name is not an error.
    pub fn leave(&self, name: &str) {
        LEAVE.click();
        self.participants.lock().unwrap().remove(name);
    }

    /// Return the endpoint registered under `name`, if there is one.
    pub fn resolve(&self, name: &str) -> Option<Sender<M>> {
        self.participants.lock().unwrap().get(name).cloned()
    }

    /// The names of every joined participant, in order.
    pub fn participants(&self) -> Vec<String> {
        self.participants.lock().unwrap().keys().cloned().collect()
    }

    /// Deliver `message` to `name`.  Fire-and-forget:  an unknown name or a hung-up endpoint
    /// drops the message.
    pub fn send_to(&self, name: &str, message: M) {
        SEND_TO.click();
        let endpoint = match self.resolve(name) {
            Some(endpoint) => endpoint,
            None => {
                NO_SUCH_PARTICIPANT.click();
                clue!(COLLECTOR, ERROR, {
                    no_such_participant: name,
                });
                return;
            }
        };
        if endpoint.send(message).is_err() {
            ENDPOINT_GONE.click();
            clue!(COLLECTOR, ERROR, {
                endpoint_gone: name,
            });
        }
    }

    /// Deliver `message` to every joined participant, self included if joined.
    pub fn broadcast(&self, message: M) {
        BROADCAST.click();
        for name in self.participants() {
            self.send_to(&name, message.clone());
        }
    }
}

impl<M: Clone + Send + 'static> Default for Switchboard<M> {
    fn default() -> Self {
        Self::new()
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

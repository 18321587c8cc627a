//! The operator holds a machine's current state and mediates external inputs.

use std::sync::Mutex;

use biometrics::{Collector, Counter};
use zerror_core::ErrorCore;

use super::{Error, Machine, Outcome};

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static INPUT: Counter = Counter::new("fsm.operator.input");
static ADVANCED: Counter = Counter::new("fsm.operator.advanced");
static REJECTED: Counter = Counter::new("fsm.operator.rejected");

pub(crate) fn register_biometrics(collector: &Collector) {
    collector.register_counter(&INPUT);
    collector.register_counter(&ADVANCED);
    collector.register_counter(&REJECTED);
}

///////////////////////////////////////////// Operator /////////////////////////////////////////////

struct Inner<I, C> {
    machine: Machine<I, C>,
    current_state: String,
}

/// An Operator is the per-participant holder of a machine's current state.  Inputs serialize
/// against a mutex; the read of the current state, the event, and the write of the next state
/// happen under one critical section, so the current state mutates only on successful events and
/// no intermediate value is ever observable.
pub struct Operator<I, C> {
    inner: Mutex<Inner<I, C>>,
}

impl<I: Clone, C> Operator<I, C> {
    /// Start operating `machine` from `start_state`.
    pub fn start(machine: Machine<I, C>, start_state: &str) -> Result<Self, Error> {
        if !machine.has_state(start_state) {
            return Err(Error::NoSuchState {
                core: ErrorCore::default(),
                state_name: start_state.to_string(),
            });
        }
        Ok(Self {
            inner: Mutex::new(Inner {
                machine,
                current_state: start_state.to_string(),
            }),
        })
    }

    /// The state the machine currently rests in.
    pub fn current_state(&self) -> String {
        self.inner.lock().unwrap().current_state.clone()
    }

    /// Feed `input` to the machine from the current state, advancing the current state when the
    /// event lands.
    pub fn input(&self, input: I) -> Result<Outcome<I>, Error> {
        INPUT.click();
        let mut inner = self.inner.lock().unwrap();
        let outcome = inner.machine.event(&inner.current_state, input)?;
        match &outcome {
            Outcome::Taken { next, .. } => {
                ADVANCED.click();
                inner.current_state = next.clone();
            }
            Outcome::Rejected { .. } => {
                REJECTED.click();
            }
        }
        Ok(outcome)
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

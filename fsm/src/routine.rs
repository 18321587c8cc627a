//! Routines execute a declared trajectory of states as a lazy chain of events.

use biometrics::{Collector, Counter};
use indicio::{clue, ERROR};
use zerror_core::ErrorCore;

use super::{Error, Machine, Outcome, COLLECTOR};

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static STEP: Counter = Counter::new("fsm.routine.step");
static BROKEN: Counter = Counter::new("fsm.routine.broken");

pub(crate) fn register_biometrics(collector: &Collector) {
    collector.register_counter(&STEP);
    collector.register_counter(&BROKEN);
}

/////////////////////////////////////////////// Step ///////////////////////////////////////////////

/// One forced step of a routine.  `Next` reports the state the step executed and the input it
/// consumed, and carries the suspended remainder.  `Done` is the final output.  `Rejected` is the
/// user's transition declining the step's input, which halts the routine.
pub enum Step<'a, I, C> {
    Next {
        state: String,
        input: I,
        routine: Routine<'a, I, C>,
    },
    Done {
        output: I,
    },
    Rejected {
        state: String,
        input: I,
    },
}

////////////////////////////////////////////// Routine /////////////////////////////////////////////

/// A suspended routine.  Each call to [Routine::step] consumes the routine and executes exactly
/// one event; the continuation comes back inside [Step::Next].  Ownership is the
/// non-restartability guarantee:  a routine that has been stepped is gone.
///
/// Routines do not own their machine.  Events applied to the machine between steps interleave
/// with the routine and will break it if they move the machine off the declared trajectory.
pub struct Routine<'a, I, C> {
    machine: &'a Machine<I, C>,
    steps: &'a [String],
    index: usize,
    input: I,
}

impl<'a, I: Clone, C> Routine<'a, I, C> {
    pub(crate) fn new(machine: &'a Machine<I, C>, steps: &'a [String], input: I) -> Self {
        Self {
            machine,
            steps,
            index: 0,
            input,
        }
    }

    /// The state the next call to [Routine::step] will execute.
    pub fn state(&self) -> &str {
        &self.steps[self.index]
    }

    /// The input the next call to [Routine::step] will consume.
    pub fn input(&self) -> &I {
        &self.input
    }

    /// Force one step.
    pub fn step(mut self) -> Result<Step<'a, I, C>, Error> {
        STEP.click();
        let state = self.steps[self.index].clone();
        let input = self.input.clone();
        match self.machine.event(&state, input.clone())? {
            Outcome::Rejected { state, input } => Ok(Step::Rejected { state, input }),
            Outcome::Taken { next, output } => {
                if self.index + 1 >= self.steps.len() {
                    return Ok(Step::Done { output });
                }
                let expected = &self.steps[self.index + 1];
                if &next != expected {
                    BROKEN.click();
                    clue!(COLLECTOR, ERROR, {
                        broken_routine: {
                            expected: expected,
                            got: &next,
                        },
                    });
                    return Err(Error::BrokenRoutine {
                        core: ErrorCore::default(),
                        next_step: expected.clone(),
                        next_state: next,
                        remaining: self.steps[self.index + 1..].to_vec(),
                    });
                }
                self.index += 1;
                self.input = output;
                Ok(Step::Next {
                    state,
                    input,
                    routine: self,
                })
            }
        }
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

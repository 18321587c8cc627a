#![doc = include_str!("../README.md")]

use std::collections::BTreeMap;

use biometrics::{Collector, Counter};
use indicio::{clue, ERROR};
use prototk_derive::Message;
use zerror_core::ErrorCore;

mod operator;
mod routine;

pub use operator::Operator;
pub use routine::{Routine, Step};

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static EVENT: Counter = Counter::new("fsm.event");
static EVENT_REJECTED: Counter = Counter::new("fsm.event.rejected");
static EVENT_INVALID: Counter = Counter::new("fsm.event.invalid_transition");
static EVENT_DESCEND: Counter = Counter::new("fsm.event.descend");
static ROUTINE: Counter = Counter::new("fsm.routine");

/// Register the biometrics for the state machine engine.
pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&EVENT);
    collector.register_counter(&EVENT_REJECTED);
    collector.register_counter(&EVENT_INVALID);
    collector.register_counter(&EVENT_DESCEND);
    collector.register_counter(&ROUTINE);
    operator::register_biometrics(collector);
    routine::register_biometrics(collector);
}

///////////////////////////////////////////// COLLECTOR ////////////////////////////////////////////

/// The indicio collector for the state machine engine.
pub static COLLECTOR: indicio::Collector = indicio::Collector::new();

/////////////////////////////////////////////// Error //////////////////////////////////////////////

/// The error type for machine construction and event application.
#[derive(Message, zerror_derive::Z)]
pub enum Error {
    #[prototk(458752, message)]
    Success {
        #[prototk(1, message)]
        core: ErrorCore,
    },
    /// A state name was referenced that the machine does not declare.
    #[prototk(458753, message)]
    NoSuchState {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, string)]
        state_name: String,
    },
    /// A transition function returned a target outside the allowed set of its state.
    #[prototk(458754, message)]
    InvalidTransition {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, string)]
        from: String,
        #[prototk(3, string)]
        to: String,
        #[prototk(4, string)]
        allowed: Vec<String>,
    },
    /// A routine name was referenced that the machine does not declare.
    #[prototk(458755, message)]
    NoSuchRoutine {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, string)]
        name: String,
    },
    /// An event within a routine landed somewhere other than the declared next step.
    #[prototk(458756, message)]
    BrokenRoutine {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, string)]
        next_step: String,
        #[prototk(3, string)]
        next_state: String,
        #[prototk(4, string)]
        remaining: Vec<String>,
    },
    /// A state was declared twice.
    #[prototk(458757, message)]
    DuplicateState {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, string)]
        name: String,
    },
    /// A routine was declared twice.
    #[prototk(458758, message)]
    DuplicateRoutine {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, string)]
        name: String,
    },
    /// A routine was declared with no steps.
    #[prototk(458759, message)]
    EmptyRoutine {
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

////////////////////////////////////////////// Outcome /////////////////////////////////////////////

/// The result of a successful call into [Machine::event].  `Taken` is the ok pair of leaf state
/// and output.  `Rejected` is the user's transition function declining the input; it is a value,
/// not a failure, and leaves the machine's definition un-impugned.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Outcome<I> {
    Taken { next: String, output: I },
    Rejected { state: String, input: I },
}

/////////////////////////////////////////////// State //////////////////////////////////////////////

/// A single named state.  `to` lists the states directly reachable from this one.  `substates`
/// lists child states in order; the first is the entry substate and its presence makes this a
/// composite state.  The transition function names the next state, or `None` to reject the input.
/// The output function computes the value carried to the next state.
pub struct State<I, C> {
    name: String,
    to: Vec<String>,
    substates: Vec<String>,
    transition: Box<dyn Fn(&I, &C) -> Option<String> + Send>,
    output: Box<dyn Fn(&I, &C) -> I + Send>,
}

impl<I: Clone, C> State<I, C> {
    /// Create a new state that rejects every input and outputs its input unchanged.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            to: Vec::new(),
            substates: Vec::new(),
            transition: Box::new(|_, _| None),
            output: Box::new(|input, _| input.clone()),
        }
    }

    /// Set the states directly reachable from this one.
    pub fn with_to(mut self, to: &[&str]) -> Self {
        self.to = to.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Set the substates.  The first substate listed is the entry substate.
    pub fn with_substates(mut self, substates: &[&str]) -> Self {
        self.substates = substates.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Set the transition function.
    pub fn with_transition<F: Fn(&I, &C) -> Option<String> + Send + 'static>(
        mut self,
        transition: F,
    ) -> Self {
        self.transition = Box::new(transition);
        self
    }

    /// Set the output function.
    pub fn with_output<F: Fn(&I, &C) -> I + Send + 'static>(mut self, output: F) -> Self {
        self.output = Box::new(output);
        self
    }

    /// This state's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The states directly reachable from this state.
    pub fn to(&self) -> &[String] {
        &self.to
    }

    /// The substates of this state.
    pub fn substates(&self) -> &[String] {
        &self.substates
    }

    /// A state with substates is composite:  it routes, it is never a resting place.
    pub fn is_composite(&self) -> bool {
        !self.substates.is_empty()
    }

    /// The entry substate, when this state is composite.
    pub fn entry_substate(&self) -> Option<&str> {
        self.substates.first().map(|s| s.as_str())
    }
}

////////////////////////////////////////// MachineBuilder //////////////////////////////////////////

/// Declare a machine:  states, then routines, then `build`.  All cross-references are validated
/// at build time so event application can index without checking.
pub struct MachineBuilder<I, C> {
    name: String,
    states: Vec<State<I, C>>,
    routines: Vec<(String, Vec<String>)>,
}

impl<I: Clone, C> MachineBuilder<I, C> {
    /// Start declaring a machine called `name`.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            states: Vec::new(),
            routines: Vec::new(),
        }
    }

    /// Declare a state.
    pub fn with_state(mut self, state: State<I, C>) -> Self {
        self.states.push(state);
        self
    }

    /// Declare a routine:  an ordered list of state names the machine is expected to traverse.
    pub fn with_routine(mut self, name: &str, steps: &[&str]) -> Self {
        self.routines
            .push((name.to_string(), steps.iter().map(|s| s.to_string()).collect()));
        self
    }

    /// Validate the declaration and produce a machine carrying `ctx`.
    pub fn build(self, ctx: C) -> Result<Machine<I, C>, Error> {
        let mut states = BTreeMap::new();
        for state in self.states.into_iter() {
            if states.contains_key(&state.name) {
                return Err(Error::DuplicateState {
                    core: ErrorCore::default(),
                    name: state.name.clone(),
                });
            }
            states.insert(state.name.clone(), state);
        }
        let check = |name: &String| -> Result<(), Error> {
            if states.contains_key(name) {
                Ok(())
            } else {
                Err(Error::NoSuchState {
                    core: ErrorCore::default(),
                    state_name: name.clone(),
                })
            }
        };
        for state in states.values() {
            for to in state.to.iter() {
                check(to)?;
            }
            for substate in state.substates.iter() {
                check(substate)?;
            }
        }
        let mut routines = BTreeMap::new();
        for (name, steps) in self.routines.into_iter() {
            if routines.contains_key(&name) {
                return Err(Error::DuplicateRoutine {
                    core: ErrorCore::default(),
                    name,
                });
            }
            if steps.is_empty() {
                return Err(Error::EmptyRoutine {
                    core: ErrorCore::default(),
                    name,
                });
            }
            for step in steps.iter() {
                check(step)?;
            }
            routines.insert(name, steps);
        }
        let mut matrix = BTreeMap::new();
        for (name, state) in states.iter() {
            let mut candidates = Vec::new();
            for to in state.to.iter() {
                if let Some(entry) = states[to].entry_substate() {
                    candidates.push(entry.to_string());
                }
            }
            candidates.extend(state.to.iter().cloned());
            matrix.insert(name.clone(), candidates);
        }
        Ok(Machine {
            name: self.name,
            states,
            matrix,
            routines,
            ctx,
        })
    }
}

////////////////////////////////////////////// Machine /////////////////////////////////////////////

/// A validated machine.  Machines are passive:  they apply events and hand out routines, but hold
/// no notion of a current state.  That bookkeeping belongs to the [Operator].
pub struct Machine<I, C> {
    name: String,
    states: BTreeMap<String, State<I, C>>,
    matrix: BTreeMap<String, Vec<String>>,
    routines: BTreeMap<String, Vec<String>>,
    ctx: C,
}

impl<I: Clone, C> Machine<I, C> {
    /// This machine's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True iff `name` is a declared state.
    pub fn has_state(&self, name: &str) -> bool {
        self.states.contains_key(name)
    }

    /// The transition matrix row for `from`:  entry substates of composite members of `to`
    /// first, then `to` itself.
    pub fn allowed(&self, from: &str) -> Option<&[String]> {
        self.matrix.get(from).map(|row| row.as_slice())
    }

    /// The machine's context.
    pub fn context(&self) -> &C {
        &self.ctx
    }

    /// Replace the machine's context.
    pub fn set_context(&mut self, ctx: C) {
        self.ctx = ctx;
    }

    /// Apply one transition step from the state named `from`.
    ///
    /// The state's transition function picks the target; the target must be in the transition
    /// matrix row for `from` or the call fails with `InvalidTransition`.  When the target is
    /// composite, the event descends:  the output becomes the input of a recursive event against
    /// the target's entry substate, and the leaf result is this event's result.
    pub fn event(&self, from: &str, input: I) -> Result<Outcome<I>, Error> {
        EVENT.click();
        let state = match self.states.get(from) {
            Some(state) => state,
            None => {
                return Err(Error::NoSuchState {
                    core: ErrorCore::default(),
                    state_name: from.to_string(),
                });
            }
        };
        let next = match (state.transition)(&input, &self.ctx) {
            Some(next) => next,
            None => {
                EVENT_REJECTED.click();
                return Ok(Outcome::Rejected {
                    state: from.to_string(),
                    input,
                });
            }
        };
        if !self.matrix[from].iter().any(|candidate| candidate == &next) {
            EVENT_INVALID.click();
            clue!(COLLECTOR, ERROR, {
                invalid_transition: {
                    from: from,
                    to: &next,
                },
            });
            return Err(Error::InvalidTransition {
                core: ErrorCore::default(),
                from: from.to_string(),
                to: next,
                allowed: state.to.clone(),
            });
        }
        let output = (state.output)(&input, &self.ctx);
        let target = &self.states[&next];
        if let Some(entry) = target.entry_substate() {
            EVENT_DESCEND.click();
            self.event(entry, output)
        } else {
            Ok(Outcome::Taken { next, output })
        }
    }

    /// Begin the routine named `name` with `input`.  The returned routine is suspended before
    /// its first step; nothing executes until [Routine::step] is called.
    pub fn routine(&self, name: &str, input: I) -> Result<Routine<'_, I, C>, Error> {
        ROUTINE.click();
        let steps = match self.routines.get(name) {
            Some(steps) => steps,
            None => {
                return Err(Error::NoSuchRoutine {
                    core: ErrorCore::default(),
                    name: name.to_string(),
                });
            }
        };
        Ok(Routine::new(self, steps, input))
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////


#[cfg(test)]
mod tests {
    use super::testutil::{abc_machine, boot_machine};
    use super::*;

    fn taken(next: &str, output: u64) -> Outcome<u64> {
        Outcome::Taken {
            next: next.to_string(),
            output,
        }
    }

    #[test]
    fn single_events() {
        let machine = abc_machine();
        assert_eq!(taken("B", 2), machine.event("A", 1).unwrap());
        assert_eq!(taken("A", 3), machine.event("A", 2).unwrap());
        assert_eq!(taken("B", 3), machine.event("B", 1).unwrap());
        assert_eq!(taken("C", 4), machine.event("B", 2).unwrap());
        assert_eq!(taken("C", 15), machine.event("C", 12).unwrap());
        assert_eq!(taken("A", 18), machine.event("C", 15).unwrap());
    }

    #[test]
    fn rejected_input_is_a_value() {
        let machine = abc_machine();
        assert_eq!(
            Outcome::Rejected {
                state: "A".to_string(),
                input: 11,
            },
            machine.event("A", 11).unwrap()
        );
    }

    #[test]
    fn no_such_state() {
        let machine = abc_machine();
        match machine.event("D", 1) {
            Err(Error::NoSuchState { state_name, .. }) => assert_eq!("D", state_name),
            _ => panic!("expected NoSuchState"),
        }
    }

    #[test]
    fn invalid_transition() {
        let machine: Machine<u64, ()> = MachineBuilder::new("rogue")
            .with_state(
                State::new("start")
                    .with_to(&["finish"])
                    .with_transition(|_: &u64, _: &()| Some("start".to_string())),
            )
            .with_state(State::new("finish"))
            .build(())
            .unwrap();
        match machine.event("start", 0) {
            Err(Error::InvalidTransition { from, to, allowed, .. }) => {
                assert_eq!("start", from);
                assert_eq!("start", to);
                assert_eq!(vec!["finish".to_string()], allowed);
            }
            _ => panic!("expected InvalidTransition"),
        }
    }

    #[test]
    fn build_rejects_unknown_reference() {
        let result: Result<Machine<u64, ()>, Error> = MachineBuilder::new("dangling")
            .with_state(State::new("start").with_to(&["nowhere"]))
            .build(());
        match result {
            Err(Error::NoSuchState { state_name, .. }) => assert_eq!("nowhere", state_name),
            _ => panic!("expected NoSuchState"),
        }
    }

    #[test]
    fn build_rejects_unknown_routine_step() {
        let result: Result<Machine<u64, ()>, Error> = MachineBuilder::new("dangling")
            .with_state(State::new("start"))
            .with_routine("walk", &["start", "nowhere"])
            .build(());
        match result {
            Err(Error::NoSuchState { state_name, .. }) => assert_eq!("nowhere", state_name),
            _ => panic!("expected NoSuchState"),
        }
    }

    #[test]
    fn build_rejects_duplicates() {
        let result: Result<Machine<u64, ()>, Error> = MachineBuilder::new("twice")
            .with_state(State::new("start"))
            .with_state(State::new("start"))
            .build(());
        assert!(matches!(result, Err(Error::DuplicateState { .. })));
        let result: Result<Machine<u64, ()>, Error> = MachineBuilder::new("twice")
            .with_state(State::new("start"))
            .with_routine("walk", &["start"])
            .with_routine("walk", &["start"])
            .build(());
        assert!(matches!(result, Err(Error::DuplicateRoutine { .. })));
    }

    #[test]
    fn build_rejects_empty_routine() {
        let result: Result<Machine<u64, ()>, Error> = MachineBuilder::new("hollow")
            .with_state(State::new("start"))
            .with_routine("walk", &[])
            .build(());
        assert!(matches!(result, Err(Error::EmptyRoutine { .. })));
    }

    #[test]
    fn matrix_lists_entry_substates_first() {
        let machine = boot_machine();
        assert_eq!(
            vec!["bios".to_string(), "booting".to_string()],
            machine.allowed("off").unwrap()
        );
    }

    #[test]
    fn composite_target_descends_to_a_leaf() {
        let machine = boot_machine();
        // off -> booting routes through bios, whose own transition runs on the output.
        assert_eq!(taken("kernel", 8), machine.event("off", 7).unwrap());
    }

    #[test]
    fn entry_substate_is_directly_reachable() {
        let machine = boot_machine();
        let outcome = machine.event("bios", 7).unwrap();
        assert_eq!(taken("kernel", 8), outcome);
    }

    #[test]
    fn nested_composites_descend_all_the_way() {
        let machine: Machine<u64, ()> = MachineBuilder::new("nested")
            .with_state(
                State::new("start")
                    .with_to(&["hall"])
                    .with_transition(|_: &u64, _: &()| Some("hall".to_string()))
                    .with_output(|input, _| input + 1),
            )
            .with_state(State::new("hall").with_substates(&["door"]))
            .with_state(
                State::new("door")
                    .with_to(&["vault"])
                    .with_transition(|_: &u64, _: &()| Some("vault".to_string()))
                    .with_output(|input, _| input * 2),
            )
            .with_state(State::new("vault").with_substates(&["safe"]))
            .with_state(
                State::new("safe")
                    .with_to(&["safe"])
                    .with_transition(|_: &u64, _: &()| Some("safe".to_string()))
                    .with_output(|input, _| input + 10),
            )
            .build(())
            .unwrap();
        // start -> hall routes through door, whose own transition targets the vault composite,
        // which routes through safe:  two descents, each running the entered state's hooks.
        assert_eq!(taken("safe", 18), machine.event("start", 3).unwrap());
    }

    #[test]
    fn rejection_surfaces_from_the_entered_substate() {
        let machine: Machine<u64, ()> = MachineBuilder::new("picky")
            .with_state(
                State::new("gate")
                    .with_to(&["hall"])
                    .with_transition(|_: &u64, _: &()| Some("hall".to_string()))
                    .with_output(|input, _| input + 100),
            )
            .with_state(State::new("hall").with_substates(&["door"]))
            .with_state(State::new("door"))
            .build(())
            .unwrap();
        // door rejects everything, so the descent's event comes back rejected at door.
        assert_eq!(
            Outcome::Rejected {
                state: "door".to_string(),
                input: 101,
            },
            machine.event("gate", 1).unwrap()
        );
    }

    #[test]
    fn set_context_swaps_the_bias() {
        let mut machine: Machine<u64, u64> = MachineBuilder::new("biased")
            .with_state(
                State::new("start")
                    .with_to(&["start"])
                    .with_transition(|_: &u64, _: &u64| Some("start".to_string()))
                    .with_output(|input, bias| input + bias),
            )
            .build(5)
            .unwrap();
        assert_eq!(&5, machine.context());
        assert_eq!(
            Outcome::Taken {
                next: "start".to_string(),
                output: 7,
            },
            machine.event("start", 2).unwrap()
        );
        machine.set_context(100);
        assert_eq!(&100, machine.context());
        assert_eq!(
            Outcome::Taken {
                next: "start".to_string(),
                output: 102,
            },
            machine.event("start", 2).unwrap()
        );
    }

    #[test]
    fn context_is_read_by_hooks() {
        let machine: Machine<u64, u64> = MachineBuilder::new("biased")
            .with_state(
                State::new("start")
                    .with_to(&["start"])
                    .with_transition(|_: &u64, _: &u64| Some("start".to_string()))
                    .with_output(|input, bias| input + bias),
            )
            .build(5)
            .unwrap();
        assert_eq!(
            Outcome::Taken {
                next: "start".to_string(),
                output: 7,
            },
            machine.event("start", 2).unwrap()
        );
    }
}

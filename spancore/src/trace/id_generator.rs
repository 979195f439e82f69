//! Id Generator
use crate::trace::{OpId, TaskId};
use rand::{rngs, Rng, SeedableRng};
use std::cell::RefCell;

/// Generates task and operation ids using a random number generator.
///
/// Ids are drawn from a per-thread small RNG seeded from system entropy, so
/// concurrent logical requests never contend on a shared generator.
#[derive(Clone, Debug, Default)]
pub struct RandomIdGenerator {
    _private: (),
}

impl RandomIdGenerator {
    /// Generate a new `TaskId`
    pub fn new_task_id(&self) -> TaskId {
        CURRENT_RNG.with(|rng| TaskId::from(rng.borrow_mut().gen::<u128>()))
    }

    /// Generate a new `OpId`
    pub fn new_op_id(&self) -> OpId {
        CURRENT_RNG.with(|rng| OpId::from(rng.borrow_mut().gen::<u64>()))
    }
}

thread_local! {
    /// Store random number generator for each thread
    static CURRENT_RNG: RefCell<rngs::SmallRng> = RefCell::new(rngs::SmallRng::from_entropy());
}

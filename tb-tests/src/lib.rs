//! End-to-end scenarios exercising the translator driver, jump
//! chaining, and invalidation together, using small test doubles for
//! the guest decoder/emitter and CPU/TLB hooks the rest of the
//! workspace treats as external collaborators.

pub mod fakes;
pub mod scenarios;

//! The cooperative execution runtime: steps composed into chains, packets
//! carrying per-run context, fibers executing chains with suspend/resume,
//! and gates serializing fibers per domain.

pub mod fiber;
pub mod gate;
pub mod packet;
pub mod step;

pub use fiber::{CompletionCallback, Fiber};
pub use gate::FiberGate;
pub use packet::Packet;
pub use step::{chain, NextAction, Resumption, Step, StepRef};

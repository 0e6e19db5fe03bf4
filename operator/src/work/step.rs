//! Units of work composed into chains executed by fibers.

use crate::types::Result;
use crate::work::packet::Packet;
use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub type StepRef = Arc<dyn Step>;

/// Future a suspended fiber parks on; resolving it resumes the chain,
/// an `Err` terminates the fiber through the throwable path.
pub type Resumption = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// What the fiber does after a step's `apply` returns.
pub enum NextAction {
    /// Proceed with the next step of the remaining chain.
    Continue,
    /// Run the given steps ahead of the remaining chain.
    Invoke(Vec<StepRef>),
    /// Abandon the remaining chain and run the given one instead.
    Divert(Vec<StepRef>),
    /// Park the fiber until the resumption resolves, then continue.
    Suspend(Resumption),
    /// Terminate the chain successfully.
    End,
}

/// A unit of work. Implementations are immutable; branching steps hold
/// their alternative chains as fields and return [`NextAction::Divert`].
#[async_trait]
pub trait Step: Send + Sync {
    fn name(&self) -> &str;

    async fn apply(&self, packet: &mut Packet) -> Result<NextAction>;
}

struct ChainStep {
    steps: Vec<StepRef>,
}

#[async_trait]
impl Step for ChainStep {
    fn name(&self) -> &str {
        "Chain"
    }

    async fn apply(&self, _packet: &mut Packet) -> Result<NextAction> {
        Ok(NextAction::Invoke(self.steps.clone()))
    }
}

/// Builds a single step that runs the given steps in order. Chains nest:
/// the fiber flattens them as it executes.
pub fn chain(steps: Vec<StepRef>) -> StepRef {
    Arc::new(ChainStep { steps })
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Closure-backed step for runtime tests.
    pub struct FnStep<F> {
        name: String,
        body: F,
    }

    impl<F> FnStep<F>
    where
        F: Fn(&mut Packet) -> Result<NextAction> + Send + Sync,
    {
        pub fn arc(name: &str, body: F) -> StepRef
        where
            F: 'static,
        {
            Arc::new(Self {
                name: name.to_string(),
                body,
            })
        }
    }

    #[async_trait]
    impl<F> Step for FnStep<F>
    where
        F: Fn(&mut Packet) -> Result<NextAction> + Send + Sync,
    {
        fn name(&self) -> &str {
            &self.name
        }

        async fn apply(&self, packet: &mut Packet) -> Result<NextAction> {
            (self.body)(packet)
        }
    }
}

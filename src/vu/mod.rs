//! The owning environment a publisher runs inside
//!
//! A [`Vu`] is one single-threaded script instance. It is created in the init
//! phase (metric registration is only possible then), moves to the run phase
//! with [`Vu::activate`] and ends with [`Vu::teardown`]. Everything on it is
//! meant to be touched from the thread that owns it; background work reaches
//! it only through a [`CallbackSlot`].

pub mod event_loop;

pub use event_loop::{CallbackJob, CallbackSlot, EventLoop};

use crate::error::{PublishError, PublishResult};
use crate::observability::metrics::{Registry, Sample};
use std::cell::RefCell;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Resources only available while the VU is being initialized
#[derive(Debug, Clone)]
pub struct InitEnvironment {
    registry: Arc<Registry>,
}

impl InitEnvironment {
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }
}

/// Execution state of a running VU
#[derive(Debug, Clone)]
pub struct VuState {
    pub samples: UnboundedSender<Sample>,
}

pub struct Vu {
    init_env: Option<InitEnvironment>,
    state: RefCell<Option<VuState>>,
    context: RefCell<Option<CancellationToken>>,
    exception: RefCell<Option<PublishError>>,
    event_loop: EventLoop,
}

impl Vu {
    /// Create a VU in its init phase
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            init_env: Some(InitEnvironment { registry }),
            state: RefCell::new(None),
            context: RefCell::new(None),
            exception: RefCell::new(None),
            event_loop: EventLoop::new(),
        }
    }

    /// Leave the init phase and start running with the given sample sink.
    /// Returns the context that is cancelled on teardown.
    pub fn activate(&mut self, samples: UnboundedSender<Sample>) -> CancellationToken {
        let ctx = CancellationToken::new();
        self.init_env = None;
        *self.state.borrow_mut() = Some(VuState { samples });
        *self.context.borrow_mut() = Some(ctx.clone());
        ctx
    }

    /// Cancel the run context and drop the execution state
    pub fn teardown(&self) {
        if let Some(ctx) = self.context.borrow_mut().take() {
            ctx.cancel();
        }
        self.state.borrow_mut().take();
        debug!("VU torn down");
    }

    pub fn init_env(&self) -> Option<&InitEnvironment> {
        self.init_env.as_ref()
    }

    pub fn state(&self) -> Option<VuState> {
        self.state.borrow().clone()
    }

    pub fn context(&self) -> Option<CancellationToken> {
        self.context.borrow().clone()
    }

    pub fn register_callback(&self) -> CallbackSlot {
        self.event_loop.register_callback()
    }

    pub fn pending_callbacks(&self) -> usize {
        self.event_loop.pending()
    }

    /// Raise `error` into the script as a pending exception
    pub fn throw(&self, error: PublishError) {
        if let Some(previous) = self.exception.borrow_mut().replace(error) {
            debug!("Replacing unobserved exception: {}", previous);
        }
    }

    pub fn take_exception(&self) -> Option<PublishError> {
        self.exception.borrow_mut().take()
    }

    /// Drain callbacks until none are outstanding (blocking)
    pub fn run_event_loop(&self) -> PublishResult<()> {
        self.event_loop.run(self)
    }

    /// Run callbacks that are already queued
    pub fn run_ready(&self) -> PublishResult<usize> {
        self.event_loop.run_ready(self)
    }
}

impl Default for Vu {
    fn default() -> Self {
        Self::new(Arc::new(Registry::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_lifecycle() {
        let mut vu = Vu::default();
        assert!(vu.init_env().is_some());
        assert!(vu.state().is_none());
        assert!(vu.context().is_none());

        let (tx, _rx) = mpsc::unbounded_channel();
        let ctx = vu.activate(tx);
        assert!(vu.init_env().is_none());
        assert!(vu.state().is_some());
        assert!(!ctx.is_cancelled());

        vu.teardown();
        assert!(ctx.is_cancelled());
        assert!(vu.state().is_none());
        assert!(vu.context().is_none());
    }

    #[test]
    fn test_throw_and_take_exception() {
        let vu = Vu::default();
        assert!(vu.take_exception().is_none());

        vu.throw(PublishError::Timeout);
        vu.throw(PublishError::NotConnected);

        assert!(matches!(
            vu.take_exception(),
            Some(PublishError::NotConnected)
        ));
        assert!(vu.take_exception().is_none());
    }

    #[test]
    fn test_init_env_exposes_registry() {
        let registry = Arc::new(Registry::new());
        let vu = Vu::new(registry.clone());
        let env = vu.init_env().unwrap();
        assert!(Arc::ptr_eq(env.registry(), &registry));
    }
}

//! Ordered callback queue drained on the owning thread
//!
//! Background work never touches the VU directly. It receives a
//! [`CallbackSlot`] up front and later hands it a job; the owning thread runs
//! queued jobs one at a time from [`EventLoop::run`].

use super::Vu;
use crate::error::{PublishError, PublishResult};
use std::cell::{Cell, RefCell};
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

/// Deferred work that must run on the owning thread
pub type CallbackJob = Box<dyn FnOnce(&Vu) -> PublishResult<()> + Send + 'static>;

enum Queued {
    Job(u64, CallbackJob),
    Abandoned(u64),
}

/// Single-consumer job queue owned by one VU
pub struct EventLoop {
    tx: UnboundedSender<Queued>,
    rx: RefCell<UnboundedReceiver<Queued>>,
    pending: Cell<usize>,
    next_id: Cell<u64>,
}

impl EventLoop {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: RefCell::new(rx),
            pending: Cell::new(0),
            next_id: Cell::new(0),
        }
    }

    /// Reserve a delivery slot; the loop keeps running until it is used
    pub fn register_callback(&self) -> CallbackSlot {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        self.pending.set(self.pending.get() + 1);

        CallbackSlot {
            id,
            tx: Some(self.tx.clone()),
        }
    }

    /// Slots handed out whose job has not run yet
    pub fn pending(&self) -> usize {
        self.pending.get()
    }

    /// Run jobs as they arrive until no slot is outstanding.
    ///
    /// Blocks the calling thread, so it must not be called from inside an
    /// async runtime. Stops at the first failing job and returns its error;
    /// jobs queued behind it stay queued.
    pub fn run(&self, vu: &Vu) -> PublishResult<()> {
        while self.pending.get() > 0 {
            let next = self.rx.borrow_mut().blocking_recv();
            match next {
                Some(queued) => self.execute(vu, queued)?,
                // Unreachable while we hold a sender
                None => break,
            }
        }
        Ok(())
    }

    /// Run only the jobs already queued, without blocking
    pub fn run_ready(&self, vu: &Vu) -> PublishResult<usize> {
        let mut ran = 0;
        loop {
            let next = self.rx.borrow_mut().try_recv();
            match next {
                Ok(queued) => {
                    self.execute(vu, queued)?;
                    ran += 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return Ok(ran),
            }
        }
    }

    fn execute(&self, vu: &Vu, queued: Queued) -> PublishResult<()> {
        self.pending.set(self.pending.get().saturating_sub(1));
        match queued {
            Queued::Job(slot, job) => {
                debug!(slot, "Running callback job");
                job(vu)
            }
            Queued::Abandoned(slot) => {
                warn!(slot, "Callback slot dropped without delivering");
                Err(PublishError::CallbackDropped { slot })
            }
        }
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

/// Single-use handle for delivering one job to the owning thread
pub struct CallbackSlot {
    id: u64,
    tx: Option<UnboundedSender<Queued>>,
}

impl CallbackSlot {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queue `job` for the owning thread, consuming the slot
    pub fn deliver(mut self, job: CallbackJob) {
        if let Some(tx) = self.tx.take() {
            if tx.send(Queued::Job(self.id, job)).is_err() {
                debug!(slot = self.id, "Event loop gone, dropping callback job");
            }
        }
    }
}

impl Drop for CallbackSlot {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Queued::Abandoned(self.id));
        }
    }
}

impl std::fmt::Debug for CallbackSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackSlot")
            .field("id", &self.id)
            .field("delivered", &self.tx.is_none())
            .finish()
    }
}

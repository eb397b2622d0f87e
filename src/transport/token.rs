//! Completion tokens for in-flight publishes
//!
//! A publish hands back a [`CompletionToken`] immediately; the transport keeps
//! the matching [`TokenCompleter`] and resolves it once the broker cycle is
//! over (send for QoS 0, PubAck for QoS 1, PubComp for QoS 2) or the
//! connection is lost. The waiting side bounds its wait with a timeout and
//! simply drops the token when it gives up, so late completions fall on the
//! floor.

use std::time::Duration;
use tokio::sync::watch;

const COMPLETER_DROPPED: &str = "completion source dropped before the publish finished";

#[derive(Debug, Clone, PartialEq)]
enum TokenState {
    Pending,
    Complete(Option<String>),
}

/// Awaitable handle for one in-flight publish
#[derive(Debug)]
pub struct CompletionToken {
    rx: watch::Receiver<TokenState>,
    abandoned: bool,
}

/// Producing side of a [`CompletionToken`], resolved exactly once
#[derive(Debug)]
pub struct TokenCompleter {
    tx: watch::Sender<TokenState>,
}

impl CompletionToken {
    /// Create a pending token together with the completer that resolves it
    pub fn pending() -> (TokenCompleter, CompletionToken) {
        let (tx, rx) = watch::channel(TokenState::Pending);
        (
            TokenCompleter { tx },
            CompletionToken {
                rx,
                abandoned: false,
            },
        )
    }

    /// Create a token that is already resolved, e.g. when the transport
    /// refused the request outright
    pub fn completed(error: Option<String>) -> CompletionToken {
        let (completer, token) = Self::pending();
        match error {
            Some(message) => completer.fail(message),
            None => completer.succeed(),
        };
        token
    }

    /// Wait up to `timeout` for the publish to finish.
    ///
    /// Returns `false` if the window elapsed first. A completer dropped
    /// without resolving counts as finished; [`CompletionToken::error`] then
    /// reports it.
    pub async fn wait_timeout(&mut self, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, self.resolved()).await {
            Ok(true) => true,
            Ok(false) => {
                self.abandoned = true;
                true
            }
            Err(_elapsed) => false,
        }
    }

    /// Resolves once the token is complete; `false` if the completer went away
    async fn resolved(&mut self) -> bool {
        loop {
            if !matches!(*self.rx.borrow_and_update(), TokenState::Pending) {
                return true;
            }
            if self.rx.changed().await.is_err() {
                return false;
            }
        }
    }

    /// Whether the publish has finished, successfully or not
    pub fn is_complete(&self) -> bool {
        self.abandoned || !matches!(*self.rx.borrow(), TokenState::Pending)
    }

    /// Error reported by the protocol layer, if the publish finished badly
    pub fn error(&self) -> Option<String> {
        match &*self.rx.borrow() {
            TokenState::Complete(error) => error.clone(),
            TokenState::Pending if self.abandoned => Some(COMPLETER_DROPPED.to_string()),
            TokenState::Pending => None,
        }
    }
}

impl TokenCompleter {
    /// Resolve the token with the given result.
    ///
    /// Returns `false` when nobody is waiting any more (the waiter timed out
    /// and dropped its token); the completion is discarded in that case.
    pub fn complete(self, result: Result<(), String>) -> bool {
        self.tx.send(TokenState::Complete(result.err())).is_ok()
    }

    pub fn succeed(self) -> bool {
        self.complete(Ok(()))
    }

    pub fn fail<S: Into<String>>(self, message: S) -> bool {
        self.complete(Err(message.into()))
    }
}

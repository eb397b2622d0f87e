//! Pure bookkeeping that maps broker acknowledgments back onto tokens
//!
//! rumqttc assigns packet ids inside its event loop, so a completer is first
//! queued in request order and only bound to a packet id when the matching
//! outgoing publish event shows up. Requests reach the event loop through a
//! single ordered channel, which keeps the two sequences aligned.

use crate::transport::TokenCompleter;
use rumqttc::v5::mqttbytes::QoS;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, warn};

#[derive(Debug, Default)]
pub struct Inflight {
    queued: VecDeque<(QoS, TokenCompleter)>,
    awaiting_ack: HashMap<u16, TokenCompleter>,
}

impl Inflight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a publish that has been handed to the client but not yet sent
    pub fn enqueue(&mut self, qos: QoS, completer: TokenCompleter) {
        self.queued.push_back((qos, completer));
    }

    /// Outgoing publish written to the network with packet id `pkid`
    pub fn on_outgoing_publish(&mut self, pkid: u16) {
        let Some((qos, completer)) = self.queued.pop_front() else {
            warn!(pkid, "Outgoing publish without a tracked request");
            return;
        };

        match qos {
            QoS::AtMostOnce => {
                completer.succeed();
            }
            QoS::AtLeastOnce | QoS::ExactlyOnce => {
                if let Some(previous) = self.awaiting_ack.insert(pkid, completer) {
                    previous.fail(format!("packet id {pkid} reused before acknowledgment"));
                }
            }
        }
    }

    /// Broker finished (or refused) the publish with packet id `pkid`
    pub fn on_ack(&mut self, pkid: u16, result: Result<(), String>) {
        match self.awaiting_ack.remove(&pkid) {
            Some(completer) => {
                if !completer.complete(result) {
                    debug!(pkid, "Acknowledgment arrived after the waiter gave up");
                }
            }
            None => debug!(pkid, "Acknowledgment for untracked packet id"),
        }
    }

    /// Fail every tracked publish, e.g. after the connection dropped
    pub fn fail_all(&mut self, reason: &str) -> usize {
        let failed = self.queued.len() + self.awaiting_ack.len();
        for (_, completer) in self.queued.drain(..) {
            completer.fail(reason);
        }
        for (_, completer) in self.awaiting_ack.drain() {
            completer.fail(reason);
        }
        failed
    }

    pub fn len(&self) -> usize {
        self.queued.len() + self.awaiting_ack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

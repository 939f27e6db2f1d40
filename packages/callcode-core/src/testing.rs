//! In-crate test doubles.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::negotiation::PeerTransport;
use crate::session::MediaCapture;
use crate::signaling::{IceCandidate, SdpType, SessionDescription};

/// Scripted peer transport that records every operation.
#[derive(Default)]
pub struct MockTransport {
    ops: Mutex<Vec<String>>,
    offers: AtomicUsize,
    answers: AtomicUsize,
    restarts: AtomicUsize,
    closes: AtomicUsize,
    yield_on_remote: AtomicBool,
    fail_offer: AtomicBool,
    offer_gate: Mutex<Option<Arc<Notify>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Suspend once inside `set_remote_description`.
    pub fn yield_on_remote_description(&self) {
        self.yield_on_remote.store(true, Ordering::SeqCst);
    }

    /// Make the next `create_offer` return an error.
    pub fn fail_next_offer(&self) {
        self.fail_offer.store(true, Ordering::SeqCst);
    }

    /// Hold the next `create_offer` until the returned gate is notified.
    pub fn gate_next_offer(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.offer_gate.lock() = Some(gate.clone());
        gate
    }

    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().clone()
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.ops
            .lock()
            .iter()
            .filter_map(|op| op.strip_prefix("candidate:").map(str::to_string))
            .collect()
    }

    pub fn offers_created(&self) -> usize {
        self.offers.load(Ordering::SeqCst)
    }

    pub fn answers_created(&self) -> usize {
        self.answers.load(Ordering::SeqCst)
    }

    pub fn restarts(&self) -> usize {
        self.restarts.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn record(&self, op: String) {
        self.ops.lock().push(op);
    }
}

fn label(description: &SessionDescription) -> &'static str {
    match description.sdp_type {
        SdpType::Offer => "offer",
        SdpType::Answer => "answer",
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let gate = self.offer_gate.lock().take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.fail_offer.swap(false, Ordering::SeqCst) {
            return Err(Error::Transport("no usable media sections".to_string()));
        }
        let n = self.offers.fetch_add(1, Ordering::SeqCst) + 1;
        self.record("create_offer".to_string());
        Ok(SessionDescription::offer(format!("v=0 offer {}", n)))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let n = self.answers.fetch_add(1, Ordering::SeqCst) + 1;
        self.record("create_answer".to_string());
        Ok(SessionDescription::answer(format!("v=0 answer {}", n)))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.record(format!("local:{}", label(&description)));
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        if self.yield_on_remote.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }
        self.record(format!("remote:{}", label(&description)));
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.record(format!("candidate:{}", candidate.candidate));
        Ok(())
    }

    async fn restart(&self) -> Result<()> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        self.record("restart".to_string());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.record("close".to_string());
        Ok(())
    }
}

/// Capture handle counting `stop` calls.
pub struct MockCapture {
    pub stops: Arc<AtomicUsize>,
}

impl MockCapture {
    pub fn boxed() -> (Box<Self>, Arc<AtomicUsize>) {
        let stops = Arc::new(AtomicUsize::new(0));
        (
            Box::new(Self {
                stops: stops.clone(),
            }),
            stops,
        )
    }
}

impl MediaCapture for MockCapture {
    fn stop(&mut self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

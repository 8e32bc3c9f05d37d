//! Audio focus arbitration
//!
//! Only one media client may own the output device at a time. A client
//! acquires focus before opening a stream and releases it on stop. The
//! arbiter reports involuntary loss to the current owner through its
//! callback: a new media client preempts the old one permanently, and an
//! external party (a call, a navigation prompt) can interrupt it.

use std::sync::{Arc, Mutex};

use tracing::{debug, info};

/// How focus was lost
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusLoss {
    /// Another player took over; stop playback.
    Permanent,
    /// Short interruption; focus will come back.
    Transient,
    /// Short interruption during which playing quietly is acceptable.
    TransientDuckable,
}

/// Answer to a focus request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusGrant {
    Granted,
    Denied,
}

/// Contract used by the playback session
pub trait AudioFocus: Send {
    /// Request exclusive ownership of the output device
    fn acquire(&mut self) -> FocusGrant;

    /// Give focus back. Safe to call when not holding it.
    fn release(&mut self);

    fn is_held(&self) -> bool;
}

type LossCallback = Arc<dyn Fn(FocusLoss) + Send + Sync>;

enum Holder {
    Client(u64),
    /// Someone outside this process that does not yield (e.g. a phone call)
    External,
}

struct ArbiterState {
    holder: Option<Holder>,
    callbacks: Vec<(u64, LossCallback)>,
    next_id: u64,
}

impl ArbiterState {
    fn callback(&self, id: u64) -> Option<LossCallback> {
        self.callbacks
            .iter()
            .find(|(cid, _)| *cid == id)
            .map(|(_, cb)| Arc::clone(cb))
    }
}

/// Process-wide owner of the audio device
#[derive(Clone)]
pub struct FocusArbiter {
    state: Arc<Mutex<ArbiterState>>,
}

impl Default for FocusArbiter {
    fn default() -> Self {
        Self::new()
    }
}

impl FocusArbiter {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ArbiterState {
                holder: None,
                callbacks: Vec::new(),
                next_id: 1,
            })),
        }
    }

    /// Register a media client. `on_loss` is invoked (from whichever thread
    /// caused the loss) whenever the client loses focus involuntarily.
    pub fn client(&self, on_loss: impl Fn(FocusLoss) + Send + Sync + 'static) -> FocusClient {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let id = state.next_id;
        state.next_id += 1;
        state.callbacks.push((id, Arc::new(on_loss)));
        FocusClient {
            id,
            arbiter: self.clone(),
        }
    }

    /// An external party takes the device for a while.
    ///
    /// The current client (if any) is told about the loss. A permanent
    /// interruption also clears the holder.
    pub fn interrupt(&self, loss: FocusLoss) {
        let callback = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let owner = match state.holder {
                Some(Holder::Client(id)) => id,
                _ => return,
            };
            if loss == FocusLoss::Permanent {
                state.holder = None;
            }
            state.callback(owner)
        };
        info!(?loss, "Audio focus interrupted");
        // Called without the lock so the callback may re-enter the arbiter.
        if let Some(cb) = callback {
            cb(loss);
        }
    }

    /// An external party takes the device and refuses to yield it.
    /// The current client loses focus permanently; later requests are
    /// denied until `end_external_hold`.
    pub fn begin_external_hold(&self) {
        let callback = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let previous = state.holder.replace(Holder::External);
            match previous {
                Some(Holder::Client(id)) => state.callback(id),
                _ => None,
            }
        };
        if let Some(cb) = callback {
            cb(FocusLoss::Permanent);
        }
    }

    pub fn end_external_hold(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if matches!(state.holder, Some(Holder::External)) {
            state.holder = None;
        }
    }

    fn acquire(&self, id: u64) -> FocusGrant {
        let preempted = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            match state.holder {
                Some(Holder::External) => return FocusGrant::Denied,
                Some(Holder::Client(owner)) if owner == id => return FocusGrant::Granted,
                Some(Holder::Client(owner)) => {
                    state.holder = Some(Holder::Client(id));
                    state.callback(owner)
                }
                None => {
                    state.holder = Some(Holder::Client(id));
                    None
                }
            }
        };
        if let Some(cb) = preempted {
            debug!(client = id, "Audio focus preempted another client");
            cb(FocusLoss::Permanent);
        }
        FocusGrant::Granted
    }

    fn release(&self, id: u64) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if matches!(state.holder, Some(Holder::Client(owner)) if owner == id) {
            state.holder = None;
        }
    }

    fn holds(&self, id: u64) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        matches!(state.holder, Some(Holder::Client(owner)) if owner == id)
    }

    fn unregister(&self, id: u64) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.callbacks.retain(|(cid, _)| *cid != id);
        if matches!(state.holder, Some(Holder::Client(owner)) if owner == id) {
            state.holder = None;
        }
    }
}

/// One media client's view of the arbiter
pub struct FocusClient {
    id: u64,
    arbiter: FocusArbiter,
}

impl AudioFocus for FocusClient {
    fn acquire(&mut self) -> FocusGrant {
        self.arbiter.acquire(self.id)
    }

    fn release(&mut self) {
        self.arbiter.release(self.id);
    }

    fn is_held(&self) -> bool {
        self.arbiter.holds(self.id)
    }
}

impl Drop for FocusClient {
    fn drop(&mut self) {
        self.arbiter.unregister(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    fn client_with_channel(
        arbiter: &FocusArbiter,
    ) -> (FocusClient, crossbeam_channel::Receiver<FocusLoss>) {
        let (tx, rx) = unbounded();
        let client = arbiter.client(move |loss| {
            let _ = tx.send(loss);
        });
        (client, rx)
    }

    #[test]
    fn acquire_and_release() {
        let arbiter = FocusArbiter::new();
        let (mut a, _rx) = client_with_channel(&arbiter);
        assert_eq!(a.acquire(), FocusGrant::Granted);
        assert!(a.is_held());
        a.release();
        assert!(!a.is_held());
    }

    #[test]
    fn reacquire_by_holder_is_granted_without_loss() {
        let arbiter = FocusArbiter::new();
        let (mut a, rx) = client_with_channel(&arbiter);
        a.acquire();
        assert_eq!(a.acquire(), FocusGrant::Granted);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn second_client_preempts_first_permanently() {
        let arbiter = FocusArbiter::new();
        let (mut a, rx_a) = client_with_channel(&arbiter);
        let (mut b, _rx_b) = client_with_channel(&arbiter);
        a.acquire();
        assert_eq!(b.acquire(), FocusGrant::Granted);
        assert_eq!(rx_a.try_recv().unwrap(), FocusLoss::Permanent);
        assert!(!a.is_held());
        assert!(b.is_held());
    }

    #[test]
    fn external_hold_denies_requests() {
        let arbiter = FocusArbiter::new();
        let (mut a, rx) = client_with_channel(&arbiter);
        a.acquire();
        arbiter.begin_external_hold();
        assert_eq!(rx.try_recv().unwrap(), FocusLoss::Permanent);
        assert_eq!(a.acquire(), FocusGrant::Denied);

        arbiter.end_external_hold();
        assert_eq!(a.acquire(), FocusGrant::Granted);
    }

    #[test]
    fn transient_interrupt_keeps_holder() {
        let arbiter = FocusArbiter::new();
        let (mut a, rx) = client_with_channel(&arbiter);
        a.acquire();
        arbiter.interrupt(FocusLoss::TransientDuckable);
        assert_eq!(rx.try_recv().unwrap(), FocusLoss::TransientDuckable);
        assert!(a.is_held());

        arbiter.interrupt(FocusLoss::Permanent);
        assert_eq!(rx.try_recv().unwrap(), FocusLoss::Permanent);
        assert!(!a.is_held());
    }

    #[test]
    fn interrupt_without_holder_is_silent() {
        let arbiter = FocusArbiter::new();
        let (_a, rx) = client_with_channel(&arbiter);
        arbiter.interrupt(FocusLoss::Transient);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dropping_holder_frees_focus() {
        let arbiter = FocusArbiter::new();
        let (mut a, _rx_a) = client_with_channel(&arbiter);
        let (mut b, rx_b) = client_with_channel(&arbiter);
        a.acquire();
        drop(a);
        assert_eq!(b.acquire(), FocusGrant::Granted);
        assert!(rx_b.try_recv().is_err());
    }
}

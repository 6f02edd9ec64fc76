/*
    MartyPC
    https://github.com/dbalsom/martypc

    Copyright 2022-2025 Daniel Balsom

    Permission is hereby granted, free of charge, to any person obtaining a
    copy of this software and associated documentation files (the “Software”),
    to deal in the Software without restriction, including without limitation
    the rights to use, copy, modify, merge, publish, distribute, sublicense,
    and/or sell copies of the Software, and to permit persons to whom the
    Software is furnished to do so, subject to the following conditions:

    The above copyright notice and this permission notice shall be included in
    all copies or substantial portions of the Software.

    THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
    IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
    FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
    AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
    LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
    FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
    DEALINGS IN THE SOFTWARE.

    --------------------------------------------------------------------------

    arbiter.rs

    Single-owner arbitration of a physical port shared by several logical
    devices. Waiters are served strictly in arrival order. A pending request is
    settled exactly once: either the releasing owner grants it or its
    originator cancels it, decided by a compare-and-swap on the request's state.

*/

use std::{
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicU64, AtomicU8, Ordering},
        Arc,
        Mutex,
        MutexGuard,
    },
    time::Duration,
};

use crossbeam_channel::{Receiver, Sender};

use crate::error::ParportError;

pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

const REQUEST_PENDING: u8 = 0;
const REQUEST_GRANTED: u8 = 1;
const REQUEST_CANCELLED: u8 = 2;

/// Allocation counter value of a port nobody holds.
const PORT_FREE: i32 = -1;

/// Identifies a queued request so it can be cancelled by id.
pub type RequestId = u64;

/// Called when the port goes free with nobody waiting. Returning true claims the
/// port for the caller that registered the check. Runs with the arbiter locked, so
/// it must be short and must not call back into the arbiter.
pub type PortCheck = Box<dyn Fn() -> bool + Send + Sync>;

struct PortRequest {
    id: RequestId,
    state: AtomicU8,
    grant_tx: Sender<()>,
    grant_rx: Receiver<()>,
}

impl PortRequest {
    fn new(id: RequestId) -> Self {
        let (grant_tx, grant_rx) = crossbeam_channel::bounded(1);
        Self {
            id,
            state: AtomicU8::new(REQUEST_PENDING),
            grant_tx,
            grant_rx,
        }
    }

    fn settle(&self, to: u8) -> bool {
        self.state
            .compare_exchange(REQUEST_PENDING, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

struct ArbiterQueue {
    /// -1 when the port is free, otherwise the number of queued requests.
    count: i32,
    waiters: VecDeque<Arc<PortRequest>>,
    port_checks: Vec<PortCheck>,
    capacity: usize,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ArbiterStats {
    pub grants: u64,
    pub immediate: u64,
    pub cancellations: u64,
    pub deferred: u64,
}

struct ArbiterShared {
    queue: Mutex<ArbiterQueue>,
    deferred_tx: Sender<()>,
    deferred_rx: Receiver<()>,
    next_id: AtomicU64,
    grants: AtomicU64,
    immediate: AtomicU64,
    cancellations: AtomicU64,
    deferred: AtomicU64,
}

/// Result of submitting an acquire request.
pub enum AcquireOutcome {
    /// The port was free and now belongs to the caller.
    Granted,
    /// The caller is queued; wait on or cancel the request.
    Pending(PendingRequest),
}

/// Shared handle to a port's arbiter.
#[derive(Clone)]
pub struct PortArbiter {
    shared: Arc<ArbiterShared>,
}

impl PortArbiter {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (deferred_tx, deferred_rx) = crossbeam_channel::unbounded();
        Self {
            shared: Arc::new(ArbiterShared {
                queue: Mutex::new(ArbiterQueue {
                    count: PORT_FREE,
                    waiters: VecDeque::new(),
                    port_checks: Vec::new(),
                    capacity,
                }),
                deferred_tx,
                deferred_rx,
                next_id: AtomicU64::new(1),
                grants: AtomicU64::new(0),
                immediate: AtomicU64::new(0),
                cancellations: AtomicU64::new(0),
                deferred: AtomicU64::new(0),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ArbiterQueue> {
        self.shared.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn count_grant(&self, immediate: bool) {
        self.shared.grants.fetch_add(1, Ordering::Relaxed);
        if immediate {
            self.shared.immediate.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Claim the port if nobody holds it. Never blocks beyond the queue lock.
    pub fn try_acquire(&self) -> bool {
        let mut queue = self.lock();
        if queue.count == PORT_FREE {
            queue.count = 0;
            self.count_grant(true);
            true
        }
        else {
            false
        }
    }

    /// Claim the port or join the end of the wait queue.
    pub fn submit(&self) -> Result<AcquireOutcome, ParportError> {
        let mut queue = self.lock();
        if queue.count == PORT_FREE {
            queue.count = 0;
            self.count_grant(true);
            return Ok(AcquireOutcome::Granted);
        }
        if queue.waiters.len() >= queue.capacity {
            log::warn!("port arbiter: wait queue full ({} waiters)", queue.waiters.len());
            return Err(ParportError::ResourceExhausted);
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let request = Arc::new(PortRequest::new(id));
        queue.waiters.push_back(request.clone());
        queue.count += 1;
        log::trace!("port arbiter: request {} queued behind {} others", id, queue.count - 1);

        Ok(AcquireOutcome::Pending(PendingRequest {
            arbiter: self.clone(),
            request,
            claimed: false,
        }))
    }

    /// Claim the port, waiting up to `timeout` behind earlier requests.
    pub fn acquire(&self, timeout: Duration) -> Result<(), ParportError> {
        match self.submit()? {
            AcquireOutcome::Granted => Ok(()),
            AcquireOutcome::Pending(request) => request.wait(timeout),
        }
    }

    /// Give up the port. The oldest live waiter becomes the owner; with no waiters
    /// the registered port checks get a chance to claim it, and otherwise it is free.
    pub fn release(&self) {
        let mut queue = self.lock();
        if queue.count == PORT_FREE {
            log::warn!("port arbiter: release of a free port");
            return;
        }

        while let Some(request) = queue.waiters.pop_front() {
            queue.count -= 1;
            if request.settle(REQUEST_GRANTED) {
                _ = request.grant_tx.try_send(());
                self.count_grant(false);
                log::debug!("port arbiter: handed port to request {}", request.id);
                return;
            }
            log::trace!("port arbiter: skipping cancelled request {}", request.id);
        }

        queue.count = PORT_FREE;
        for check in queue.port_checks.iter() {
            if check() {
                log::trace!("port arbiter: port claimed by port check");
                queue.count = 0;
                self.count_grant(true);
                break;
            }
        }
    }

    /// Release from a context that must not perform the hand-off itself. With
    /// waiters queued the hand-off is deferred to [`PortArbiter::process_deferred`];
    /// otherwise the port is released in place.
    pub fn release_from_interrupt(&self) {
        {
            let queue = self.lock();
            if !queue.waiters.is_empty() {
                _ = self.shared.deferred_tx.send(());
                self.shared.deferred.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        self.release();
    }

    /// Complete any releases deferred from interrupt context. Returns how many
    /// were processed.
    pub fn process_deferred(&self) -> usize {
        let mut processed = 0;
        while self.shared.deferred_rx.try_recv().is_ok() {
            self.release();
            processed += 1;
        }
        processed
    }

    /// Cancel a queued request by id. Returns false if it was already granted or
    /// is not queued here.
    pub fn cancel_pending(&self, id: RequestId) -> bool {
        let request = {
            let queue = self.lock();
            queue.waiters.iter().find(|r| r.id == id).cloned()
        };
        match request {
            Some(request) => self.cancel_request(&request),
            None => false,
        }
    }

    fn cancel_request(&self, request: &Arc<PortRequest>) -> bool {
        if !request.settle(REQUEST_CANCELLED) {
            return false;
        }
        let mut queue = self.lock();
        if let Some(pos) = queue.waiters.iter().position(|r| r.id == request.id) {
            _ = queue.waiters.remove(pos);
            queue.count -= 1;
        }
        self.shared.cancellations.fetch_add(1, Ordering::Relaxed);
        log::debug!("port arbiter: request {} cancelled", request.id);
        true
    }

    pub fn register_port_check(&self, check: PortCheck) {
        self.lock().port_checks.push(check);
    }

    pub fn query_num_waiters(&self) -> usize {
        self.lock().waiters.len()
    }

    pub fn is_free(&self) -> bool {
        self.lock().count == PORT_FREE
    }

    pub fn stats(&self) -> ArbiterStats {
        ArbiterStats {
            grants: self.shared.grants.load(Ordering::Relaxed),
            immediate: self.shared.immediate.load(Ordering::Relaxed),
            cancellations: self.shared.cancellations.load(Ordering::Relaxed),
            deferred: self.shared.deferred.load(Ordering::Relaxed),
        }
    }
}

impl Default for PortArbiter {
    fn default() -> Self {
        Self::new()
    }
}

/// A queued acquire request. Dropping it cancels the request, or if the grant
/// already happened, hands the port straight on.
pub struct PendingRequest {
    arbiter: PortArbiter,
    request: Arc<PortRequest>,
    claimed: bool,
}

impl PendingRequest {
    pub fn id(&self) -> RequestId {
        self.request.id
    }

    pub fn is_granted(&self) -> bool {
        self.request.state.load(Ordering::Acquire) == REQUEST_GRANTED
    }

    /// Wait for the grant. On timeout the request is cancelled, unless the grant
    /// beat the cancellation, in which case the port is ours after all. A request
    /// already withdrawn through [`PortArbiter::cancel_pending`] never owns the port.
    pub fn wait(mut self, timeout: Duration) -> Result<(), ParportError> {
        if self.request.state.load(Ordering::Acquire) == REQUEST_CANCELLED {
            return Err(ParportError::Cancelled);
        }
        if self.request.grant_rx.recv_timeout(timeout).is_ok() {
            self.claimed = true;
            return Ok(());
        }
        if self.cancel() {
            log::debug!("port arbiter: request {} timed out", self.request.id);
            return Err(ParportError::AcquireTimeout);
        }
        match self.request.state.load(Ordering::Acquire) {
            REQUEST_GRANTED => {
                _ = self.request.grant_rx.try_recv();
                self.claimed = true;
                Ok(())
            }
            _ => Err(ParportError::Cancelled),
        }
    }

    /// Withdraw the request. Returns false if it was granted first.
    pub fn cancel(&self) -> bool {
        self.arbiter.cancel_request(&self.request)
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        if !self.claimed && !self.cancel() && self.is_granted() {
            log::debug!("port arbiter: request {} dropped after grant", self.request.id);
            self.arbiter.release();
        }
    }
}

impl fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("id", &self.request.id)
            .field("granted", &self.is_granted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::{
        sync::atomic::{AtomicBool, AtomicUsize},
        thread,
    };

    fn pending(arbiter: &PortArbiter) -> PendingRequest {
        match arbiter.submit().unwrap() {
            AcquireOutcome::Pending(p) => p,
            AcquireOutcome::Granted => panic!("port unexpectedly free"),
        }
    }

    #[test]
    fn try_acquire_claims_only_a_free_port() {
        let arbiter = PortArbiter::new();
        assert!(arbiter.try_acquire());
        assert!(!arbiter.try_acquire());
        arbiter.release();
        assert!(arbiter.is_free());
        assert!(arbiter.try_acquire());
    }

    #[test]
    fn at_most_one_owner() {
        const THREADS: usize = 8;
        const ROUNDS: usize = 50;

        let arbiter = PortArbiter::new();
        let held = Arc::new(AtomicBool::new(false));
        let completed = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let arbiter = arbiter.clone();
                let held = held.clone();
                let completed = completed.clone();
                thread::spawn(move || {
                    let mut rng = rand::rng();
                    for _ in 0..ROUNDS {
                        arbiter.acquire(Duration::from_secs(30)).unwrap();
                        assert!(!held.swap(true, Ordering::SeqCst), "two owners at once");
                        thread::sleep(Duration::from_micros(rng.random_range(0..50)));
                        held.store(false, Ordering::SeqCst);
                        completed.fetch_add(1, Ordering::SeqCst);
                        arbiter.release();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(completed.load(Ordering::SeqCst), THREADS * ROUNDS);
        assert_eq!(arbiter.stats().grants as usize, THREADS * ROUNDS);
        assert!(arbiter.is_free());
    }

    #[test]
    fn waiters_are_served_in_order() {
        let arbiter = PortArbiter::new();
        assert!(arbiter.try_acquire());

        let requests = vec![("A", pending(&arbiter)), ("B", pending(&arbiter)), ("C", pending(&arbiter))];
        let (order_tx, order_rx) = crossbeam_channel::unbounded();

        let handles: Vec<_> = requests
            .into_iter()
            .map(|(name, request)| {
                let arbiter = arbiter.clone();
                let order_tx = order_tx.clone();
                thread::spawn(move || {
                    let mut rng = rand::rng();
                    thread::sleep(Duration::from_micros(rng.random_range(0..500)));
                    request.wait(Duration::from_secs(30)).unwrap();
                    order_tx.send(name).unwrap();
                    thread::sleep(Duration::from_micros(rng.random_range(0..200)));
                    arbiter.release();
                })
            })
            .collect();

        arbiter.release();
        for handle in handles {
            handle.join().unwrap();
        }
        let order: Vec<_> = order_rx.try_iter().collect();
        assert_eq!(order, vec!["A", "B", "C"]);
        assert!(arbiter.is_free());
    }

    #[test]
    fn release_hands_off_to_pending_waiter() {
        let arbiter = PortArbiter::new();
        arbiter.acquire(Duration::from_millis(10)).unwrap();

        let request = pending(&arbiter);
        assert!(!request.is_granted());
        arbiter.release();

        assert!(request.is_granted());
        assert!(!arbiter.is_free());
        request.wait(Duration::ZERO).unwrap();
        arbiter.release();
        assert!(arbiter.is_free());
    }

    #[test]
    fn cancelled_waiter_is_skipped() {
        let arbiter = PortArbiter::new();
        assert!(arbiter.try_acquire());
        let first = pending(&arbiter);
        let second = pending(&arbiter);

        assert!(arbiter.cancel_pending(first.id()));
        assert!(!first.cancel());
        arbiter.release();

        assert!(second.is_granted());
        assert_eq!(arbiter.stats().cancellations, 1);
        second.wait(Duration::ZERO).unwrap();
        drop(first);
        arbiter.release();
        assert!(arbiter.is_free());
    }

    #[test]
    fn wait_after_external_cancel_does_not_own_port() {
        let arbiter = PortArbiter::new();
        assert!(arbiter.try_acquire());
        let request = pending(&arbiter);

        assert!(arbiter.cancel_pending(request.id()));
        assert!(matches!(
            request.wait(Duration::from_millis(1)),
            Err(ParportError::Cancelled)
        ));
        assert!(!arbiter.is_free());
        assert_eq!(arbiter.query_num_waiters(), 0);

        arbiter.release();
        assert!(arbiter.is_free());
    }

    #[test]
    fn cancel_and_grant_settle_exactly_once() {
        for _ in 0..200 {
            let arbiter = PortArbiter::new();
            assert!(arbiter.try_acquire());
            let request = pending(&arbiter);

            let releaser = {
                let arbiter = arbiter.clone();
                thread::spawn(move || arbiter.release())
            };
            let cancelled = request.cancel();
            releaser.join().unwrap();

            if cancelled {
                assert!(arbiter.is_free());
                assert_eq!(arbiter.stats().cancellations, 1);
            }
            else {
                assert!(request.is_granted());
                assert!(!arbiter.is_free());
                request.wait(Duration::ZERO).unwrap();
                arbiter.release();
            }
            assert!(arbiter.is_free());
        }
    }

    #[test]
    fn acquire_times_out_and_leaves_queue() {
        let arbiter = PortArbiter::new();
        assert!(arbiter.try_acquire());
        assert!(matches!(
            arbiter.acquire(Duration::from_millis(5)),
            Err(ParportError::AcquireTimeout)
        ));
        assert_eq!(arbiter.query_num_waiters(), 0);
        arbiter.release();
        assert!(arbiter.is_free());
    }

    #[test]
    fn full_queue_is_exhausted() {
        let arbiter = PortArbiter::with_capacity(1);
        assert!(arbiter.try_acquire());
        let _waiting = pending(&arbiter);
        assert!(matches!(arbiter.submit(), Err(ParportError::ResourceExhausted)));
    }

    #[test]
    fn port_check_claims_free_port() {
        let arbiter = PortArbiter::new();
        let fired = Arc::new(AtomicBool::new(false));
        let check_fired = fired.clone();
        arbiter.register_port_check(Box::new(move || !check_fired.swap(true, Ordering::SeqCst)));

        assert!(arbiter.try_acquire());
        arbiter.release();
        assert!(fired.load(Ordering::SeqCst));
        assert!(!arbiter.is_free());

        arbiter.release();
        assert!(arbiter.is_free());
    }

    #[test]
    fn interrupt_release_defers_hand_off() {
        let arbiter = PortArbiter::new();
        assert!(arbiter.try_acquire());
        let request = pending(&arbiter);

        arbiter.release_from_interrupt();
        assert!(!request.is_granted());
        assert_eq!(arbiter.stats().deferred, 1);

        assert_eq!(arbiter.process_deferred(), 1);
        assert!(request.is_granted());
        request.wait(Duration::ZERO).unwrap();

        // Nobody waiting: released in place.
        arbiter.release_from_interrupt();
        assert!(arbiter.is_free());
    }
}

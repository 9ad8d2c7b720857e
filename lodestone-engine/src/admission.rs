use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 3;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum AdmissionStatus {
    /// Waiting for a slot
    Queued,
    /// Holds one of the concurrent-request slots
    Active,
    /// Finished; the slot has been (or is about to be) handed to the next request
    Done,
}

/// One request tracked by the queue. `on_begin` fires when the request is granted a
/// slot, which may be inside `enqueue` or later when another request completes.
pub struct AdmissionRequest {
    status: AdmissionStatus,
    on_begin: Option<Box<dyn FnOnce()>>,
}

impl AdmissionRequest {
    pub fn status(&self) -> AdmissionStatus {
        self.status
    }

    /// Marks the request finished without going through
    /// [`AdmissionQueue::mark_complete`]. The queue notices on its next sweep. Useful
    /// when completion is detected on a different code path than the one holding the
    /// queue.
    pub fn set_done(&mut self) {
        self.status = AdmissionStatus::Done;
    }
}

/// Bounds how many outbound requests may be active simultaneously, queueing the rest
/// FIFO. Providers that talk to rate-limited backends route their requests through
/// this before starting real work.
pub struct AdmissionQueue {
    max_concurrent: usize,
    active: Vec<Rc<RefCell<AdmissionRequest>>>,
    pending: VecDeque<Rc<RefCell<AdmissionRequest>>>,
}

impl Default for AdmissionQueue {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENT_REQUESTS)
    }
}

impl AdmissionQueue {
    pub fn new(max_concurrent: usize) -> Self {
        assert!(max_concurrent > 0);
        AdmissionQueue {
            max_concurrent,
            active: Vec::default(),
            pending: VecDeque::default(),
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Admits the request immediately if a slot is free, otherwise appends it to the
    /// pending queue.
    pub fn enqueue(
        &mut self,
        on_begin: Box<dyn FnOnce()>,
    ) -> Rc<RefCell<AdmissionRequest>> {
        let request = Rc::new(RefCell::new(AdmissionRequest {
            status: AdmissionStatus::Queued,
            on_begin: Some(on_begin),
        }));

        if self.active.len() < self.max_concurrent {
            self.activate(request.clone());
        } else {
            log::trace!(
                "admission queue full ({} active), queueing request",
                self.active.len()
            );
            self.pending.push_back(request.clone());
        }

        request
    }

    /// Releases the request's slot and starts the next pending request, if any.
    pub fn mark_complete(
        &mut self,
        request: &Rc<RefCell<AdmissionRequest>>,
    ) {
        request.borrow_mut().status = AdmissionStatus::Done;
        self.sweep_finished();
    }

    /// Busy-poll until the request holds a slot. Before each sleep, any active request
    /// that has already finished is swept out of the active set so that a caller
    /// blocking the only thread cannot deadlock the queue against itself.
    pub fn wait_until_active(
        &mut self,
        request: &Rc<RefCell<AdmissionRequest>>,
        poll_interval: Duration,
    ) {
        loop {
            match request.borrow().status {
                AdmissionStatus::Active | AdmissionStatus::Done => return,
                AdmissionStatus::Queued => {}
            }
            self.sweep_finished();
            if request.borrow().status == AdmissionStatus::Queued {
                std::thread::sleep(poll_interval);
            }
        }
    }

    /// Removes finished requests from the active set and promotes pending requests
    /// into the freed slots.
    pub fn sweep_finished(&mut self) {
        self.active
            .retain(|active| active.borrow().status != AdmissionStatus::Done);
        while self.active.len() < self.max_concurrent {
            let Some(next) = self.pending.pop_front() else {
                break;
            };
            self.activate(next);
        }
    }

    fn activate(
        &mut self,
        request: Rc<RefCell<AdmissionRequest>>,
    ) {
        let on_begin = {
            let mut request = request.borrow_mut();
            request.status = AdmissionStatus::Active;
            request.on_begin.take()
        };
        self.active.push(request);
        if let Some(on_begin) = on_begin {
            (on_begin)();
        }
    }
}

// src/health/dispatch.rs
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

/// A work list drained by whichever thread holds the drain claim.
///
/// Events posted while a drain is running, including events posted by the
/// handler itself, are appended and handled by that same loop, so nested
/// posts never recurse. Events are handled one at a time in posting order.
pub(crate) struct Dispatcher<E> {
    queue: Mutex<VecDeque<E>>,
    draining: AtomicBool,
}

impl<E> Dispatcher<E> {
    pub(crate) fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
        }
    }

    /// Posts `event` and drains the queue unless another caller already is.
    pub(crate) fn dispatch<F>(&self, event: E, mut handle: F)
    where
        F: FnMut(E),
    {
        self.queue.lock().push_back(event);

        loop {
            if self
                .draining
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }

            loop {
                let next = self.queue.lock().pop_front();
                match next {
                    Some(event) => handle(event),
                    None => break,
                }
            }

            self.draining.store(false, Ordering::Release);

            // An event may have been posted between the last pop and the
            // release; whoever gets the claim next picks it up.
            if self.queue.lock().is_empty() {
                return;
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    struct Countdown {
        dispatcher: Dispatcher<u32>,
        handled: AtomicUsize,
        max_depth: AtomicUsize,
        depth: AtomicUsize,
    }

    impl Countdown {
        fn post(self: &Arc<Self>, n: u32) {
            let this = self.clone();
            self.dispatcher.dispatch(n, move |n| this.handle(n));
        }

        fn handle(self: &Arc<Self>, n: u32) {
            let depth = self.depth.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_depth.fetch_max(depth, Ordering::SeqCst);
            self.handled.fetch_add(1, Ordering::SeqCst);
            if n > 0 {
                self.post(n - 1);
            }
            self.depth.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_nested_posts_do_not_recurse() {
        let countdown = Arc::new(Countdown {
            dispatcher: Dispatcher::new(),
            handled: AtomicUsize::new(0),
            max_depth: AtomicUsize::new(0),
            depth: AtomicUsize::new(0),
        });

        countdown.post(100_000);

        assert_eq!(countdown.handled.load(Ordering::SeqCst), 100_001);
        assert_eq!(countdown.max_depth.load(Ordering::SeqCst), 1);
        assert!(!countdown.dispatcher.is_draining());
    }

    #[test]
    fn test_events_keep_posting_order() {
        let dispatcher = Dispatcher::new();
        let mut seen = Vec::new();
        for i in 0..10 {
            dispatcher.dispatch(i, |e| seen.push(e));
        }
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_concurrent_posts_are_all_handled() {
        let dispatcher = Arc::new(Dispatcher::new());
        let handled = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let dispatcher = dispatcher.clone();
                let handled = handled.clone();
                thread::spawn(move || {
                    for _ in 0..1_000 {
                        let handled = handled.clone();
                        dispatcher.dispatch((), move |_| {
                            handled.fetch_add(1, Ordering::SeqCst);
                        });
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(handled.load(Ordering::SeqCst), 8_000);
    }
}

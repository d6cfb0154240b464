//! A minimal single-threaded run loop for the agent's background thread.
//!
//! The loop owns timers and async wake-up handles. Their callbacks run on the
//! thread calling [`TraceLoop::run`] and are dropped there once the loop ends,
//! which makes the loop a home for resources that must not leave that thread.
use std::collections::{BTreeMap, HashMap};
use std::sync::{atomic, mpsc};
use std::{sync, time};

type Callback = Box<dyn FnMut(&mut TraceLoop) + Send>;

enum LoopMessage {
    Async(u64),
    Stop,
}

/// Identifies a timer started with [`TraceLoop::start_timer`].
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TimerId(u64);

struct Timer {
    deadline: time::Instant,
    repeat: Option<time::Duration>,
    // Taken out while the callback runs.
    callback: Option<Callback>,
}

struct AsyncSlot {
    pending: sync::Arc<atomic::AtomicBool>,
    callback: Option<Callback>,
}

pub struct TraceLoop {
    tx: mpsc::Sender<LoopMessage>,
    rx: mpsc::Receiver<LoopMessage>,
    timers: BTreeMap<u64, Timer>,
    asyncs: HashMap<u64, AsyncSlot>,
    next_id: u64,
    stopping: bool,
}

/// Wakes the loop from any thread and runs the associated callback on it.
///
/// Sends are coalesced: any number of `send` calls made before the loop gets
/// around to the callback result in a single invocation.
#[derive(Clone)]
pub struct AsyncHandle {
    id: u64,
    pending: sync::Arc<atomic::AtomicBool>,
    tx: mpsc::Sender<LoopMessage>,
}

/// Asks the loop to stop from any thread.
#[derive(Clone)]
pub struct LoopHandle {
    tx: mpsc::Sender<LoopMessage>,
}

impl TraceLoop {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            tx,
            rx,
            timers: BTreeMap::new(),
            asyncs: HashMap::new(),
            next_id: 0,
            stopping: false,
        }
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            tx: self.tx.clone(),
        }
    }

    pub fn new_async<F>(&mut self, callback: F) -> AsyncHandle
    where
        F: FnMut(&mut TraceLoop) + Send + 'static,
    {
        let id = self.next_id();
        let pending = sync::Arc::new(atomic::AtomicBool::new(false));
        self.asyncs.insert(
            id,
            AsyncSlot {
                pending: sync::Arc::clone(&pending),
                callback: Some(Box::new(callback)),
            },
        );
        AsyncHandle {
            id,
            pending,
            tx: self.tx.clone(),
        }
    }

    /// Unregister an async callback. Later sends through `handle` are ignored.
    pub fn close_async(&mut self, handle: &AsyncHandle) {
        self.asyncs.remove(&handle.id);
    }

    /// Run `callback` after `timeout`, then every `repeat` if given.
    pub fn start_timer<F>(
        &mut self,
        timeout: time::Duration,
        repeat: Option<time::Duration>,
        callback: F,
    ) -> TimerId
    where
        F: FnMut(&mut TraceLoop) + Send + 'static,
    {
        let id = self.next_id();
        self.timers.insert(
            id,
            Timer {
                deadline: time::Instant::now() + timeout,
                repeat,
                callback: Some(Box::new(callback)),
            },
        );
        TimerId(id)
    }

    /// Returns `false` if the timer already fired (one-shot) or was stopped.
    pub fn stop_timer(&mut self, id: TimerId) -> bool {
        self.timers.remove(&id.0).is_some()
    }

    pub fn active_timers(&self) -> usize {
        self.timers.len()
    }

    /// Stop after the current callback returns.
    pub fn stop(&mut self) {
        self.stopping = true;
    }

    /// Process wake-ups and timers until stopped, then drop all callbacks.
    pub fn run(&mut self) {
        while !self.stopping {
            let message = match self.next_deadline() {
                Some(deadline) => {
                    let timeout = deadline.saturating_duration_since(time::Instant::now());
                    match self.rx.recv_timeout(timeout) {
                        Ok(message) => Some(message),
                        Err(mpsc::RecvTimeoutError::Timeout) => None,
                        Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    }
                }
                None => match self.rx.recv() {
                    Ok(message) => Some(message),
                    Err(_) => break,
                },
            };

            match message {
                Some(LoopMessage::Async(id)) => self.run_async(id),
                Some(LoopMessage::Stop) => self.stopping = true,
                None => {}
            }
            if !self.stopping {
                self.run_due_timers();
            }
        }

        self.timers.clear();
        self.asyncs.clear();
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn next_deadline(&self) -> Option<time::Instant> {
        self.timers.values().map(|t| t.deadline).min()
    }

    fn run_async(&mut self, id: u64) {
        let Some(slot) = self.asyncs.get_mut(&id) else {
            return;
        };
        slot.pending.store(false, atomic::Ordering::Release);
        let Some(mut callback) = slot.callback.take() else {
            return;
        };
        callback(self);
        if let Some(slot) = self.asyncs.get_mut(&id) {
            slot.callback = Some(callback);
        }
    }

    fn run_due_timers(&mut self) {
        let now = time::Instant::now();
        let due: Vec<u64> = self
            .timers
            .iter()
            .filter(|(_, t)| t.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in due {
            let Some(mut callback) = self.timers.get_mut(&id).and_then(|t| t.callback.take())
            else {
                continue;
            };
            callback(self);
            if self.stopping {
                return;
            }
            let Some(timer) = self.timers.get_mut(&id) else {
                continue;
            };
            match timer.repeat {
                Some(interval) => {
                    timer.deadline = now + interval;
                    timer.callback = Some(callback);
                }
                None => {
                    self.timers.remove(&id);
                }
            }
        }
    }
}

impl Default for TraceLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncHandle {
    /// Returns `false` if the loop is gone.
    pub fn send(&self) -> bool {
        if self.pending.swap(true, atomic::Ordering::AcqRel) {
            return true;
        }
        if self.tx.send(LoopMessage::Async(self.id)).is_err() {
            self.pending.store(false, atomic::Ordering::Release);
            return false;
        }
        true
    }
}

impl LoopHandle {
    /// Returns `false` if the loop is gone.
    pub fn stop(&self) -> bool {
        self.tx.send(LoopMessage::Stop).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    use super::*;

    #[test]
    fn async_callback_runs_on_loop_thread() {
        let mut event_loop = TraceLoop::new();
        let (tx, rx) = mpsc::channel();
        let wake = event_loop.new_async(move |_| {
            tx.send(thread::current().id()).unwrap();
        });
        let stopper = event_loop.handle();
        let worker = thread::spawn(move || {
            event_loop.run();
            thread::current().id()
        });

        assert!(wake.send());
        let callback_thread = rx.recv().unwrap();
        assert!(stopper.stop());
        let loop_thread = worker.join().unwrap();
        assert_eq!(callback_thread, loop_thread);
        assert_ne!(callback_thread, thread::current().id());
    }

    #[test]
    fn sends_coalesce_until_callback_runs() {
        let mut event_loop = TraceLoop::new();
        let calls = sync::Arc::new(AtomicUsize::new(0));
        let counted = sync::Arc::clone(&calls);
        let wake = event_loop.new_async(move |event_loop| {
            counted.fetch_add(1, atomic::Ordering::SeqCst);
            event_loop.stop();
        });

        // Nothing runs the loop yet, so all three collapse into one message.
        wake.send();
        wake.send();
        wake.send();
        event_loop.run();
        assert_eq!(calls.load(atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn repeating_timer_fires_until_stopped() {
        let mut event_loop = TraceLoop::new();
        let fired = sync::Arc::new(AtomicUsize::new(0));
        let counted = sync::Arc::clone(&fired);
        let timer = sync::Arc::new(sync::Mutex::new(None));
        let timer_slot = sync::Arc::clone(&timer);
        let id = event_loop.start_timer(
            time::Duration::from_millis(1),
            Some(time::Duration::from_millis(1)),
            move |event_loop| {
                if counted.fetch_add(1, atomic::Ordering::SeqCst) == 2 {
                    let id = timer_slot.lock().unwrap().take().unwrap();
                    assert!(event_loop.stop_timer(id));
                    event_loop.stop();
                }
            },
        );
        *timer.lock().unwrap() = Some(id);
        event_loop.run();
        assert_eq!(fired.load(atomic::Ordering::SeqCst), 3);
        assert_eq!(event_loop.active_timers(), 0);
    }

    #[test]
    fn one_shot_timer_is_removed_after_firing() {
        let mut event_loop = TraceLoop::new();
        let id = event_loop.start_timer(time::Duration::ZERO, None, |event_loop| {
            event_loop.stop()
        });
        event_loop.run();
        assert!(!event_loop.stop_timer(id));
    }

    #[test]
    fn send_after_loop_dropped_reports_failure() {
        let mut event_loop = TraceLoop::new();
        let wake = event_loop.new_async(|_| {});
        let stopper = event_loop.handle();
        drop(event_loop);
        assert!(!wake.send());
        assert!(!stopper.stop());
    }
}

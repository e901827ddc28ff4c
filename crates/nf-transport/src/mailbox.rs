//! Multi-producer / multi-consumer FIFO mailboxes.
//!
//! Endpoint handles are reference counted: cloning keeps a side alive,
//! dropping the last handle of a side disconnects it.  Senders fail once
//! every receiver is gone; receivers drain the backlog and then fail once
//! every sender is gone.  Workers treat a disconnection as end-of-input,
//! not as an error.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

/// `send` failed because no receiver handle is alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("all mailbox receivers disconnected")]
pub struct ReceiversDisconnected;

/// `recv` failed because the queue is empty and no sender handle is alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("all mailbox senders disconnected")]
pub struct SendersDisconnected;

struct State<T> {
    queue: VecDeque<T>,
    senders: usize,
    receivers: usize,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    notify: Notify,
}

/// Create a connected sender/receiver pair.
pub fn mailbox<T>() -> (MailboxSender<T>, MailboxReceiver<T>) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            queue: VecDeque::new(),
            senders: 1,
            receivers: 1,
        }),
        notify: Notify::new(),
    });
    (
        MailboxSender { shared: shared.clone() },
        MailboxReceiver { shared },
    )
}

/// Producing endpoint of a mailbox.
pub struct MailboxSender<T> {
    shared: Arc<Shared<T>>,
}

impl<T> MailboxSender<T> {
    /// Enqueue a value and wake at most one waiting receiver.
    pub fn send(&self, value: T) -> Result<(), ReceiversDisconnected> {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.receivers == 0 {
                return Err(ReceiversDisconnected);
            }
            state.queue.push_back(value);
        }
        self.shared.notify.notify_one();
        Ok(())
    }

    /// True iff both sides still have at least one live handle.
    pub fn is_connected(&self) -> bool {
        let state = self.shared.state.lock().unwrap();
        state.senders > 0 && state.receivers > 0
    }
}

impl<T> Clone for MailboxSender<T> {
    fn clone(&self) -> Self {
        self.shared.state.lock().unwrap().senders += 1;
        MailboxSender { shared: self.shared.clone() }
    }
}

impl<T> Drop for MailboxSender<T> {
    fn drop(&mut self) {
        let last = {
            let mut state = self.shared.state.lock().unwrap();
            state.senders -= 1;
            state.senders == 0
        };
        if last {
            // Receivers blocked on an empty queue must observe the
            // disconnection.
            self.shared.notify.notify_waiters();
        }
    }
}

/// Consuming endpoint of a mailbox.
pub struct MailboxReceiver<T> {
    shared: Arc<Shared<T>>,
}

impl<T> MailboxReceiver<T> {
    /// Take the oldest enqueued value, waiting for one if necessary.
    pub async fn recv(&self) -> Result<T, SendersDisconnected> {
        loop {
            let notified = self.shared.notify.notified();
            match self.try_recv()? {
                Some(value) => return Ok(value),
                None => notified.await,
            }
        }
    }

    /// Non-blocking variant: `Ok(None)` when empty but senders remain.
    pub fn try_recv(&self) -> Result<Option<T>, SendersDisconnected> {
        let mut state = self.shared.state.lock().unwrap();
        if let Some(value) = state.queue.pop_front() {
            return Ok(Some(value));
        }
        if state.senders == 0 {
            return Err(SendersDisconnected);
        }
        Ok(None)
    }

    /// True iff both sides still have at least one live handle.
    pub fn is_connected(&self) -> bool {
        let state = self.shared.state.lock().unwrap();
        state.senders > 0 && state.receivers > 0
    }
}

impl<T> Clone for MailboxReceiver<T> {
    fn clone(&self) -> Self {
        self.shared.state.lock().unwrap().receivers += 1;
        MailboxReceiver { shared: self.shared.clone() }
    }
}

impl<T> Drop for MailboxReceiver<T> {
    fn drop(&mut self) {
        self.shared.state.lock().unwrap().receivers -= 1;
    }
}

//! Per-session inactivity countdown.
//!
//! Each idle session owns one sleeping Tokio task. Resetting replaces the
//! task, stopping aborts it, and a task that runs to completion closes its
//! session. Tasks only hold a weak reference, so a session that is dropped
//! elsewhere does not linger because of its timer.
//!
//! Session events may reach the timer in a different order than the state
//! changes behind them, so [`InactivityTimer::sync`] looks at the session
//! itself rather than at the event.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::session::HttpSession;
use super::stream_id::StreamId;

pub struct InactivityTimer {
    runtime: Handle,
    tasks: Mutex<HashMap<StreamId, JoinHandle<()>>>,
}

impl InactivityTimer {
    /// Timer tasks are spawned on `runtime`, so resets may come from any
    /// thread, including ones outside Tokio.
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    fn lock_tasks(&self) -> MutexGuard<'_, HashMap<StreamId, JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Cancel the pending countdown of `session`, if any, and start a new one
    /// from its current inactivity timeout.
    pub fn reset(&self, session: &Arc<HttpSession>) {
        let mut tasks = self.lock_tasks();
        self.arm(&mut tasks, session);
    }

    /// Run the countdown of `session` only while it holds no connection.
    ///
    /// The session is read under the timer lock, so whichever call comes
    /// last sees the latest state and decides.
    pub fn sync(&self, session: &Arc<HttpSession>) {
        let mut tasks = self.lock_tasks();
        match session.open_connections() {
            Some(0) => self.arm(&mut tasks, session),
            Some(open) => {
                if let Some(task) = tasks.remove(session.stream_id()) {
                    task.abort();
                    debug!(stream_id = %session.stream_id(), open, "Inactivity timer stopped");
                }
            }
            None => {
                if let Some(task) = tasks.remove(session.stream_id()) {
                    task.abort();
                }
            }
        }
    }

    fn arm(&self, tasks: &mut HashMap<StreamId, JoinHandle<()>>, session: &Arc<HttpSession>) {
        let timeout = session.inactivity_timeout();
        let stream_id = session.stream_id().clone();
        let task = self
            .runtime
            .spawn(countdown(stream_id.clone(), Arc::downgrade(session)));
        if let Some(previous) = tasks.insert(stream_id.clone(), task) {
            previous.abort();
        }
        debug!(stream_id = %stream_id, timeout_secs = timeout.as_secs(), "Inactivity timer armed");
    }

    /// Cancel the countdown of `stream_id` without rescheduling.
    pub fn stop(&self, stream_id: &StreamId) {
        let task = self.lock_tasks().remove(stream_id);
        if let Some(task) = task {
            task.abort();
            debug!(stream_id = %stream_id, "Inactivity timer stopped");
        }
    }

    /// Cancel every countdown.
    pub fn stop_all(&self) {
        let tasks: Vec<_> = self.lock_tasks().drain().collect();
        for (_, task) in tasks {
            task.abort();
        }
    }

    /// Number of sessions currently counting down.
    pub fn armed(&self) -> usize {
        self.lock_tasks()
            .values()
            .filter(|task| !task.is_finished())
            .count()
    }

    /// Whether `stream_id` is counting down.
    pub fn is_armed(&self, stream_id: &StreamId) -> bool {
        self.lock_tasks()
            .get(stream_id)
            .is_some_and(|task| !task.is_finished())
    }
}

/// Sleep out the inactivity timeout of `session`, then close it unless it
/// holds a connection or saw a request in the meantime.
async fn countdown(stream_id: StreamId, weak: Weak<HttpSession>) {
    let Some(mut remaining) = weak.upgrade().map(|s| s.inactivity_timeout()) else {
        return;
    };
    loop {
        tokio::time::sleep(remaining).await;
        let Some(session) = weak.upgrade() else {
            return;
        };
        match session.open_connections() {
            Some(0) => {}
            Some(open) => {
                debug!(stream_id = %stream_id, open, "Session holds connections, countdown dropped");
                return;
            }
            None => return,
        }

        let timeout = session.inactivity_timeout();
        let idle = session.last_activity().elapsed();
        if idle >= timeout {
            info!(stream_id = %stream_id, timeout_secs = timeout.as_secs(), "BOSH session inactive, closing");
            session.close();
            return;
        }
        remaining = timeout - idle;
    }
}

impl Drop for InactivityTimer {
    fn drop(&mut self) {
        self.stop_all();
    }
}

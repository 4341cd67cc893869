//! Typing indicators: our own outgoing notices and the remote typists of a
//! group.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use parley_shared::{topics, GroupId, TypingAction, TypingEvent, TypingRequest, UserId};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::connection::FrameSink;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct NotifierState {
    active: bool,
    /// Bumped on every keystroke and stop; a timer only fires for its own epoch.
    epoch: u64,
    timer: Option<JoinHandle<()>>,
}

/// Sends `typing` / `stop_typing` for one group.
///
/// Dropping the notifier clears its timer without sending anything.
pub struct TypingNotifier<S> {
    sink: Arc<S>,
    group_id: GroupId,
    idle: Duration,
    state: Arc<Mutex<NotifierState>>,
}

impl<S> TypingNotifier<S>
where
    S: FrameSink + Send + Sync + 'static,
{
    pub fn new(sink: S, group_id: GroupId, idle: Duration) -> Self {
        Self {
            sink: Arc::new(sink),
            group_id,
            idle,
            state: Arc::new(Mutex::new(NotifierState::default())),
        }
    }

    pub fn group_id(&self) -> GroupId {
        self.group_id
    }

    pub fn is_typing(&self) -> bool {
        lock(&self.state).active
    }

    /// Record a keystroke. The first one sends `typing`; each one pushes the
    /// automatic `stop_typing` back by the idle window.
    pub fn keystroke(&self) {
        let newly_active = {
            let mut state = lock(&self.state);
            state.epoch += 1;
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            let newly_active = !state.active;
            state.active = true;
            state.timer = self.arm(state.epoch);
            newly_active
        };
        if newly_active {
            send(self.sink.as_ref(), self.group_id, TypingAction::Typing);
        }
    }

    /// Send `stop_typing` now, e.g. when the message is submitted.
    pub fn stop(&self) {
        if self.clear() {
            send(self.sink.as_ref(), self.group_id, TypingAction::StopTyping);
        }
    }

    /// Clear the timer without telling the server.
    pub fn cancel(&self) {
        self.clear();
    }

    /// Returns whether we were typing.
    fn clear(&self) -> bool {
        let mut state = lock(&self.state);
        state.epoch += 1;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        std::mem::replace(&mut state.active, false)
    }

    fn arm(&self, epoch: u64) -> Option<JoinHandle<()>> {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                tracing::warn!("No async runtime, typing indicator will not expire");
                return None;
            }
        };
        let sink = Arc::clone(&self.sink);
        let state = Arc::clone(&self.state);
        let group_id = self.group_id;
        let idle = self.idle;
        Some(runtime.spawn(async move {
            tokio::time::sleep(idle).await;
            {
                let mut state = lock(&state);
                if state.epoch != epoch {
                    return;
                }
                state.active = false;
                state.timer = None;
            }
            send(sink.as_ref(), group_id, TypingAction::StopTyping);
        }))
    }
}

impl<S> Drop for TypingNotifier<S> {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        state.epoch += 1;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
    }
}

fn send<S: FrameSink>(sink: &S, group_id: GroupId, action: TypingAction) {
    let request = TypingRequest { group_id, action };
    if !sink.send_json(&topics::group_typing(group_id), &request) {
        tracing::debug!("Typing notice for group {} not sent", group_id);
    }
}

/// Someone currently typing in a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Typist {
    pub user_id: UserId,
    pub username: Option<String>,
}

/// Remote users typing, per group.
///
/// Entries expire after the idle window in case the `stop_typing` is lost.
#[derive(Debug)]
pub struct TypingRoster {
    idle: Duration,
    groups: HashMap<GroupId, HashMap<UserId, (Typist, Instant)>>,
}

impl TypingRoster {
    pub fn new(idle: Duration) -> Self {
        Self {
            idle,
            groups: HashMap::new(),
        }
    }

    pub fn apply(&mut self, event: &TypingEvent, now: Instant) {
        match event.action {
            TypingAction::Typing => {
                let typist = Typist {
                    user_id: event.user_id,
                    username: event.username.clone(),
                };
                self.groups
                    .entry(event.group_id)
                    .or_default()
                    .insert(event.user_id, (typist, now));
            }
            TypingAction::StopTyping => {
                if let Some(group) = self.groups.get_mut(&event.group_id) {
                    group.remove(&event.user_id);
                    if group.is_empty() {
                        self.groups.remove(&event.group_id);
                    }
                }
            }
        }
    }

    /// Typists in `group_id` seen within the idle window, by user id.
    pub fn typing_in(&self, group_id: GroupId, now: Instant) -> Vec<Typist> {
        let mut typists: Vec<Typist> = self
            .groups
            .get(&group_id)
            .into_iter()
            .flat_map(|group| group.values())
            .filter(|(_, seen)| now.saturating_duration_since(*seen) < self.idle)
            .map(|(typist, _)| typist.clone())
            .collect();
        typists.sort_by_key(|t| t.user_id);
        typists
    }

    pub fn forget_group(&mut self, group_id: GroupId) {
        self.groups.remove(&group_id);
    }
}

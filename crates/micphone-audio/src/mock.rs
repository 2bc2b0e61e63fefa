//! Mock mixing group for testing.

use std::net::SocketAddr;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::{AudioError, AudioStream, MixingGroup, StreamId, StreamMode};

/// A stream recorded by [`MockMixingGroup::join`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinedStream {
    pub id: StreamId,
    /// Peer address the stream was created for.
    pub remote: SocketAddr,
    pub mode: StreamMode,
    /// Whether the stream arrived carrying its payload connection.
    pub had_source: bool,
}

#[derive(Debug, Default)]
struct MockGroupState {
    joined: Vec<JoinedStream>,
    active: Vec<StreamId>,
    left: Vec<StreamId>,
    ended: Vec<mpsc::UnboundedSender<StreamId>>,
    next_id: u32,
    fail_joins: bool,
    gate_closed: bool,
    blocked: usize,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<MockGroupState>,
    changed: Condvar,
}

/// Mixing group that records joins and leaves.
///
/// Joins can be forced to fail, or held at a gate so tests can act while a
/// join is in progress.
pub struct MockMixingGroup {
    shared: Arc<Shared>,
}

impl Default for MockMixingGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl MockMixingGroup {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared::default()),
        }
    }

    /// Get a clonable handle for observing and steering the group.
    pub fn handle(&self) -> MockMixingGroupHandle {
        MockMixingGroupHandle {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl MixingGroup for MockMixingGroup {
    fn join(&self, stream: AudioStream) -> Result<StreamId, AudioError> {
        let mut state = self.shared.state.lock().unwrap();
        state.blocked += 1;
        self.shared.changed.notify_all();
        while state.gate_closed {
            state = self.shared.changed.wait(state).unwrap();
        }
        state.blocked -= 1;

        if state.fail_joins {
            return Err(AudioError::JoinRejected("mock join failure".to_string()));
        }
        state.next_id += 1;
        let id = StreamId(state.next_id);
        state.joined.push(JoinedStream {
            id,
            remote: stream.remote(),
            mode: stream.mode(),
            had_source: stream.has_source(),
        });
        state.active.push(id);
        self.shared.changed.notify_all();
        Ok(id)
    }

    fn leave(&self, id: StreamId) -> Result<(), AudioError> {
        let mut state = self.shared.state.lock().unwrap();
        let pos = state
            .active
            .iter()
            .position(|active| *active == id)
            .ok_or(AudioError::UnknownStream(id))?;
        state.active.remove(pos);
        state.left.push(id);
        Ok(())
    }

    fn stream_count(&self) -> usize {
        self.shared.state.lock().unwrap().active.len()
    }

    fn subscribe_ended(&self) -> mpsc::UnboundedReceiver<StreamId> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.state.lock().unwrap().ended.push(tx);
        rx
    }
}

/// Clonable observer handle for [`MockMixingGroup`].
#[derive(Clone)]
pub struct MockMixingGroupHandle {
    shared: Arc<Shared>,
}

impl MockMixingGroupHandle {
    /// Snapshot of every successful join.
    pub fn joined(&self) -> Vec<JoinedStream> {
        self.shared.state.lock().unwrap().joined.clone()
    }

    /// Snapshot of every stream that left.
    pub fn left(&self) -> Vec<StreamId> {
        self.shared.state.lock().unwrap().left.clone()
    }

    /// Drop an active stream as if its peer hung up, notifying subscribers.
    ///
    /// Returns `false` if the stream is not in the group.
    pub fn end_stream(&self, id: StreamId) -> bool {
        let mut state = self.shared.state.lock().unwrap();
        let Some(pos) = state.active.iter().position(|active| *active == id) else {
            return false;
        };
        state.active.remove(pos);
        state.ended.retain(|subscriber| subscriber.send(id).is_ok());
        true
    }

    pub fn fail_joins(&self, fail: bool) {
        self.shared.state.lock().unwrap().fail_joins = fail;
    }

    /// Hold every subsequent join until [`open_gate`](Self::open_gate).
    pub fn close_gate(&self) {
        self.shared.state.lock().unwrap().gate_closed = true;
    }

    pub fn open_gate(&self) {
        self.shared.state.lock().unwrap().gate_closed = false;
        self.shared.changed.notify_all();
    }

    /// Wait until a join is parked at the closed gate.
    pub fn wait_for_blocked_join(&self, timeout: Duration) -> bool {
        self.wait_until(timeout, |state| state.blocked > 0)
    }

    /// Wait until at least `count` joins have succeeded.
    pub fn wait_for_joins(&self, count: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, |state| state.joined.len() >= count)
    }

    fn wait_until(&self, timeout: Duration, pred: impl Fn(&MockGroupState) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock().unwrap();
        while !pred(&state) {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .shared
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap()
                .0;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream() -> AudioStream {
        let mut stream = AudioStream::new("10.1.1.1:4000".parse().unwrap());
        stream.set_mode(StreamMode::ReceiveOnly);
        stream
    }

    #[test]
    fn records_joins_and_leaves() {
        let group = MockMixingGroup::new();
        let handle = group.handle();

        let id = group.join(stream()).unwrap();
        assert_eq!(group.stream_count(), 1);
        assert_eq!(handle.joined()[0].mode, StreamMode::ReceiveOnly);

        group.leave(id).unwrap();
        assert_eq!(group.stream_count(), 0);
        assert_eq!(handle.left(), vec![id]);
        assert!(group.leave(id).is_err());
    }

    #[test]
    fn ended_stream_is_reported_and_cannot_leave() {
        let group = MockMixingGroup::new();
        let handle = group.handle();
        let mut ended = group.subscribe_ended();

        let id = group.join(stream()).unwrap();
        assert!(handle.end_stream(id));
        assert!(!handle.end_stream(id));
        assert_eq!(ended.try_recv().unwrap(), id);
        assert_eq!(group.stream_count(), 0);
        assert!(matches!(group.leave(id), Err(AudioError::UnknownStream(_))));
        assert!(handle.left().is_empty());
    }

    #[test]
    fn gate_holds_join() {
        let group = Arc::new(MockMixingGroup::new());
        let handle = group.handle();
        handle.close_gate();

        let joiner = {
            let group = Arc::clone(&group);
            std::thread::spawn(move || group.join(stream()))
        };
        assert!(handle.wait_for_blocked_join(Duration::from_secs(2)));
        assert!(handle.joined().is_empty());

        handle.open_gate();
        assert!(joiner.join().unwrap().is_ok());
        assert_eq!(handle.joined().len(), 1);
    }
}

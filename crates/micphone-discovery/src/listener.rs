//! Drives a [`DiscoveryBackend`] through the [`DiscoveryMachine`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use micphone_types::{DiscoveryState, ServiceRecord};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::state::{DiscoveryMachine, Effect};
use crate::{BackendEvent, DiscoveryBackend, DiscoveryError, DiscoveryTarget, ListenerEvent};

const BACKEND_CHANNEL: usize = 64;

/// Watches advertisements for one target service and resolves it.
///
/// Notifications go to the receiver returned by [`DiscoveryListener::new`].
/// Once [`stop`](Self::stop) returns, nothing more is sent on it.
pub struct DiscoveryListener<B: DiscoveryBackend> {
    backend: Arc<tokio::sync::Mutex<B>>,
    machine: Arc<Mutex<DiscoveryMachine>>,
    notify_tx: mpsc::Sender<ListenerEvent>,
    pump: Option<JoinHandle<()>>,
}

impl<B: DiscoveryBackend> DiscoveryListener<B> {
    /// Create a listener and the receiver for its notifications.
    pub fn new(backend: B, target: DiscoveryTarget) -> (Self, mpsc::Receiver<ListenerEvent>) {
        let (notify_tx, notify_rx) = mpsc::channel(BACKEND_CHANNEL);
        let listener = Self {
            backend: Arc::new(tokio::sync::Mutex::new(backend)),
            machine: Arc::new(Mutex::new(DiscoveryMachine::new(target))),
            notify_tx,
            pump: None,
        };
        (listener, notify_rx)
    }

    pub fn state(&self) -> DiscoveryState {
        lock(&self.machine).state()
    }

    pub fn resolved(&self) -> Option<ServiceRecord> {
        lock(&self.machine).resolved().cloned()
    }

    pub fn is_resolving(&self) -> bool {
        lock(&self.machine).is_resolving()
    }

    pub fn target(&self) -> DiscoveryTarget {
        lock(&self.machine).target().clone()
    }

    /// Begin discovery. A backend failure is reported as a
    /// `DiscoveryStartFailure` notification rather than returned.
    pub async fn start(&mut self) {
        let service_type = {
            let mut machine = lock(&self.machine);
            if !machine.begin() {
                debug!("discovery already running");
                return;
            }
            machine.target().service_type.clone()
        };

        let (events_tx, events_rx) = mpsc::channel(BACKEND_CHANNEL);
        let started = self
            .backend
            .lock()
            .await
            .start_discovery(&service_type, events_tx)
            .await;

        if let Err(e) = started {
            warn!(service_type = %service_type, error = %e, "discovery failed to start");
            lock(&self.machine).fail_start();
            let failure = match e {
                e @ DiscoveryError::StartFailed { .. } => e,
                other => DiscoveryError::StartFailed {
                    service_type,
                    code: other.code(),
                },
            };
            let _ = self.notify_tx.send(ListenerEvent::Failed(failure)).await;
            return;
        }

        info!(service_type = %service_type, "discovering services");
        self.pump = Some(tokio::spawn(pump(
            events_rx,
            Arc::clone(&self.machine),
            Arc::clone(&self.backend),
            self.notify_tx.clone(),
        )));
    }

    /// Stop discovery. Calling it on a listener that is not discovering is
    /// a no-op.
    pub async fn stop(&mut self) {
        let was_active = lock(&self.machine).stop();

        if let Some(pump) = self.pump.take() {
            pump.abort();
            let _ = pump.await;
        }

        if !was_active {
            debug!("discovery not running, nothing to stop");
            return;
        }

        let service_type = lock(&self.machine).target().service_type.clone();
        match self.backend.lock().await.stop_discovery().await {
            Ok(()) => {
                info!(service_type = %service_type, "discovery stopped");
                let _ = self.notify_tx.send(ListenerEvent::Stopped).await;
            }
            Err(e) => {
                warn!(service_type = %service_type, error = %e, "discovery failed to stop");
                let failure = match e {
                    e @ DiscoveryError::StopFailed { .. } => e,
                    other => DiscoveryError::StopFailed {
                        service_type,
                        code: other.code(),
                    },
                };
                let _ = self.notify_tx.send(ListenerEvent::Failed(failure)).await;
            }
        }
    }
}

impl<B: DiscoveryBackend> Drop for DiscoveryListener<B> {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

async fn pump<B: DiscoveryBackend>(
    mut events: mpsc::Receiver<BackendEvent>,
    machine: Arc<Mutex<DiscoveryMachine>>,
    backend: Arc<tokio::sync::Mutex<B>>,
    notify_tx: mpsc::Sender<ListenerEvent>,
) {
    while let Some(event) = events.recv().await {
        let mut next = Some(event);
        while let Some(event) = next.take() {
            let effect = lock(&machine).on_event(event);
            match effect {
                Some(Effect::Notify(notification)) => {
                    if notify_tx.send(notification).await.is_err() {
                        debug!("listener owner gone, ending discovery pump");
                        return;
                    }
                }
                Some(Effect::Resolve(record)) => {
                    debug!(service = %record, "resolving service");
                    if let Err(e) = backend.lock().await.resolve(record.clone()).await {
                        warn!(service = %record, error = %e, "backend rejected resolution");
                        next = Some(BackendEvent::ResolveFailed {
                            record,
                            code: e.code(),
                        });
                    }
                }
                None => {}
            }
        }
    }
    debug!("backend event channel closed");
}

fn lock(machine: &Mutex<DiscoveryMachine>) -> MutexGuard<'_, DiscoveryMachine> {
    machine.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;
    use std::time::Duration;

    use micphone_types::{FailureCode, FailureKind};

    use super::*;
    use crate::mock::{MockDiscovery, MockDiscoveryHandle, MockResolution};

    const TYPE: &str = "_rtp._udp.";
    const NAME: &str = "KboxServer";

    fn host() -> IpAddr {
        "192.168.1.50".parse().unwrap()
    }

    fn listener() -> (
        DiscoveryListener<MockDiscovery>,
        mpsc::Receiver<ListenerEvent>,
        MockDiscoveryHandle,
    ) {
        let (backend, handle) = MockDiscovery::new();
        let (listener, rx) = DiscoveryListener::new(backend, DiscoveryTarget::new(TYPE, NAME));
        (listener, rx, handle)
    }

    async fn next_event(rx: &mut mpsc::Receiver<ListenerEvent>) -> ListenerEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for listener event")
            .expect("listener channel closed")
    }

    async fn next_non_started(rx: &mut mpsc::Receiver<ListenerEvent>) -> ListenerEvent {
        loop {
            match next_event(rx).await {
                ListenerEvent::Started => continue,
                other => return other,
            }
        }
    }

    #[tokio::test]
    async fn kbox_server_resolves_once() {
        let (mut listener, mut rx, handle) = listener();
        handle.set_resolution(NAME, MockResolution::Resolve(host(), 5004));

        listener.start().await;
        assert!(matches!(next_event(&mut rx).await, ListenerEvent::Started));

        handle.advertise(ServiceRecord::discovered(NAME, TYPE)).await;
        match next_non_started(&mut rx).await {
            ListenerEvent::Resolved(record) => {
                assert_eq!(record.host, Some(host()));
                assert_eq!(record.port, Some(5004));
            }
            other => panic!("expected Resolved, got {other:?}"),
        }

        for _ in 0..3 {
            handle.advertise(ServiceRecord::discovered(NAME, TYPE)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.resolve_calls().len(), 1);
        assert_eq!(listener.resolved().and_then(|r| r.port), Some(5004));

        // Explicit restart clears the resolution.
        listener.stop().await;
        listener.start().await;
        handle.advertise(ServiceRecord::discovered(NAME, TYPE)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.resolve_calls().len(), 2);
    }

    #[tokio::test]
    async fn non_matching_advertisements_never_resolve() {
        let (mut listener, _rx, handle) = listener();
        listener.start().await;

        handle.advertise(ServiceRecord::discovered(NAME, "_http._tcp.")).await;
        handle.advertise(ServiceRecord::discovered("Printer", TYPE)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(handle.resolve_calls().is_empty());
        assert!(!listener.is_resolving());
    }

    #[tokio::test]
    async fn held_resolution_blocks_further_requests() {
        let (mut listener, mut rx, handle) = listener();
        listener.start().await;

        handle.advertise(ServiceRecord::discovered(NAME, TYPE)).await;
        handle.advertise(ServiceRecord::discovered(NAME, TYPE)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.resolve_calls().len(), 1);
        assert!(listener.is_resolving());

        handle
            .fail_resolve(ServiceRecord::discovered(NAME, TYPE), FailureCode::Internal)
            .await;
        match next_non_started(&mut rx).await {
            ListenerEvent::Failed(err) => {
                assert_eq!(err.kind(), Some(FailureKind::ResolutionFailure));
            }
            other => panic!("expected resolve failure, got {other:?}"),
        }
        assert_eq!(listener.state(), DiscoveryState::Discovering);

        handle.advertise(ServiceRecord::discovered(NAME, TYPE)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.resolve_calls().len(), 2);

        assert!(
            handle
                .complete_resolve(ServiceRecord::discovered(NAME, TYPE), host(), 5004)
                .await
        );
        match next_non_started(&mut rx).await {
            ListenerEvent::Resolved(record) => {
                assert_eq!(record.socket_addr(), Some((host(), 5004).into()));
            }
            other => panic!("expected Resolved, got {other:?}"),
        }
        assert!(!listener.is_resolving());
    }

    #[tokio::test]
    async fn start_failure_is_reported() {
        let (mut listener, mut rx, handle) = listener();
        handle.fail_start(FailureCode::MaxLimit);

        listener.start().await;
        match next_event(&mut rx).await {
            ListenerEvent::Failed(err) => {
                assert_eq!(err.kind(), Some(FailureKind::DiscoveryStartFailure));
                assert_eq!(err.code(), FailureCode::MaxLimit);
            }
            other => panic!("expected start failure, got {other:?}"),
        }
        assert_eq!(listener.state(), DiscoveryState::Stopped);
        assert_eq!(handle.start_count(), 1);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let (mut listener, mut rx, handle) = listener();
        listener.start().await;
        listener.stop().await;
        listener.stop().await;

        assert_eq!(handle.stop_count(), 1);
        assert_eq!(listener.state(), DiscoveryState::Stopped);

        let mut stopped = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, ListenerEvent::Stopped) {
                stopped += 1;
            }
        }
        assert_eq!(stopped, 1);
    }

    #[tokio::test]
    async fn no_notifications_after_stop() {
        let (mut listener, mut rx, handle) = listener();
        handle.set_resolution(NAME, MockResolution::Resolve(host(), 5004));
        listener.start().await;
        listener.stop().await;
        while rx.try_recv().is_ok() {}

        // The backend keeps calling back after stop was acknowledged.
        handle
            .inject(BackendEvent::ServiceFound(ServiceRecord::discovered(NAME, TYPE)))
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(rx.try_recv().is_err());
        assert!(handle.resolve_calls().is_empty());
    }

    #[tokio::test]
    async fn stop_failure_is_reported() {
        let (mut listener, mut rx, handle) = listener();
        handle.fail_stop(FailureCode::Internal);
        listener.start().await;
        listener.stop().await;

        let mut saw_failure = false;
        while let Ok(event) = rx.try_recv() {
            if let ListenerEvent::Failed(err) = event {
                assert_eq!(err.kind(), Some(FailureKind::DiscoveryStopFailure));
                saw_failure = true;
            }
        }
        assert!(saw_failure);
        assert_eq!(listener.state(), DiscoveryState::Stopped);
    }

    #[tokio::test]
    async fn lost_service_is_reported() {
        let (mut listener, mut rx, handle) = listener();
        handle.set_resolution(NAME, MockResolution::Resolve(host(), 5004));
        listener.start().await;
        handle.advertise(ServiceRecord::discovered(NAME, TYPE)).await;
        assert!(matches!(
            next_non_started(&mut rx).await,
            ListenerEvent::Resolved(_)
        ));

        handle.lose(ServiceRecord::discovered(NAME, TYPE)).await;
        assert!(matches!(next_event(&mut rx).await, ListenerEvent::Lost(_)));
        assert!(listener.resolved().is_none());
        assert_eq!(listener.state(), DiscoveryState::Discovering);
    }
}

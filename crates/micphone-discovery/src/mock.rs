//! Mock discovery backend for testing.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use micphone_types::{FailureCode, ServiceRecord};
use tokio::sync::mpsc;

use crate::{BackendEvent, DiscoveryBackend, DiscoveryError};

/// Scripted answer for a resolution request, keyed by instance name.
#[derive(Debug, Clone, Copy)]
pub enum MockResolution {
    Resolve(IpAddr, u16),
    Fail(FailureCode),
    /// Leave the request outstanding until the test completes it.
    Hold,
}

#[derive(Debug, Default)]
struct MockDiscoveryState {
    events: Option<mpsc::Sender<BackendEvent>>,
    service_type: Option<String>,
    browsing: bool,
    resolutions: HashMap<String, MockResolution>,
    resolve_calls: Vec<ServiceRecord>,
    start_failure: Option<FailureCode>,
    stop_failure: Option<FailureCode>,
    start_count: usize,
    stop_count: usize,
}

/// Mock discovery backend.
///
/// Tests drive it through the [`MockDiscoveryHandle`] returned by
/// [`MockDiscovery::new`]: advertise and lose services, script resolution
/// outcomes, and inspect which resolutions were requested.
pub struct MockDiscovery {
    state: Arc<Mutex<MockDiscoveryState>>,
}

impl MockDiscovery {
    pub fn new() -> (Self, MockDiscoveryHandle) {
        let state = Arc::new(Mutex::new(MockDiscoveryState::default()));
        let handle = MockDiscoveryHandle {
            state: Arc::clone(&state),
        };
        (Self { state }, handle)
    }
}

#[async_trait]
impl DiscoveryBackend for MockDiscovery {
    async fn start_discovery(
        &mut self,
        service_type: &str,
        events: mpsc::Sender<BackendEvent>,
    ) -> Result<(), DiscoveryError> {
        let mut state = self.state.lock().unwrap();
        state.start_count += 1;
        if let Some(code) = state.start_failure {
            return Err(DiscoveryError::StartFailed {
                service_type: service_type.to_string(),
                code,
            });
        }
        let _ = events.try_send(BackendEvent::DiscoveryStarted);
        state.events = Some(events);
        state.service_type = Some(service_type.to_string());
        state.browsing = true;
        Ok(())
    }

    async fn stop_discovery(&mut self) -> Result<(), DiscoveryError> {
        let mut state = self.state.lock().unwrap();
        state.stop_count += 1;
        state.browsing = false;
        if let Some(code) = state.stop_failure {
            return Err(DiscoveryError::StopFailed {
                service_type: state.service_type.clone().unwrap_or_default(),
                code,
            });
        }
        // The sender is kept so tests can emulate a backend that calls back late.
        Ok(())
    }

    async fn resolve(&mut self, record: ServiceRecord) -> Result<(), DiscoveryError> {
        let (events, outcome) = {
            let mut state = self.state.lock().unwrap();
            state.resolve_calls.push(record.clone());
            let outcome = state
                .resolutions
                .get(&record.name)
                .copied()
                .unwrap_or(MockResolution::Hold);
            (state.events.clone(), outcome)
        };

        let event = match outcome {
            MockResolution::Resolve(host, port) => BackendEvent::Resolved(record.resolved(host, port)),
            MockResolution::Fail(code) => BackendEvent::ResolveFailed { record, code },
            MockResolution::Hold => return Ok(()),
        };
        if let Some(events) = events {
            tokio::spawn(async move {
                let _ = events.send(event).await;
            });
        }
        Ok(())
    }
}

/// Clonable control handle for [`MockDiscovery`].
#[derive(Clone)]
pub struct MockDiscoveryHandle {
    state: Arc<Mutex<MockDiscoveryState>>,
}

impl MockDiscoveryHandle {
    /// Deliver any backend event. Returns `false` if nobody is listening.
    pub async fn inject(&self, event: BackendEvent) -> bool {
        let events = self.state.lock().unwrap().events.clone();
        match events {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    pub async fn advertise(&self, record: ServiceRecord) -> bool {
        self.inject(BackendEvent::ServiceFound(record)).await
    }

    pub async fn lose(&self, record: ServiceRecord) -> bool {
        self.inject(BackendEvent::ServiceLost(record)).await
    }

    /// Complete a held resolution successfully.
    pub async fn complete_resolve(&self, record: ServiceRecord, host: IpAddr, port: u16) -> bool {
        self.inject(BackendEvent::Resolved(record.resolved(host, port)))
            .await
    }

    /// Complete a held resolution with a failure.
    pub async fn fail_resolve(&self, record: ServiceRecord, code: FailureCode) -> bool {
        self.inject(BackendEvent::ResolveFailed { record, code }).await
    }

    pub fn set_resolution(&self, name: &str, resolution: MockResolution) {
        self.state
            .lock()
            .unwrap()
            .resolutions
            .insert(name.to_string(), resolution);
    }

    pub fn fail_start(&self, code: FailureCode) {
        self.state.lock().unwrap().start_failure = Some(code);
    }

    pub fn fail_stop(&self, code: FailureCode) {
        self.state.lock().unwrap().stop_failure = Some(code);
    }

    pub fn resolve_calls(&self) -> Vec<ServiceRecord> {
        self.state.lock().unwrap().resolve_calls.clone()
    }

    pub fn is_browsing(&self) -> bool {
        self.state.lock().unwrap().browsing
    }

    pub fn start_count(&self) -> usize {
        self.state.lock().unwrap().start_count
    }

    pub fn stop_count(&self) -> usize {
        self.state.lock().unwrap().stop_count
    }
}

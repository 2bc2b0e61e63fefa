//! Discovery state machine.
//!
//! Owns the `Idle -> Discovering -> Stopped` lifecycle plus the
//! outstanding-resolution slot. It performs no I/O: each backend event goes
//! in, at most one [`Effect`] comes out, and the listener executes it.

use micphone_types::{same_service_type, DiscoveryState, ServiceRecord};
use tracing::{debug, info, warn};

use crate::{BackendEvent, DiscoveryError, DiscoveryTarget, ListenerEvent};

/// Work the listener must carry out after an event.
#[derive(Debug)]
pub enum Effect {
    /// Ask the backend to resolve this record.
    Resolve(ServiceRecord),
    /// Deliver a notification to the listener's owner.
    Notify(ListenerEvent),
}

#[derive(Debug)]
pub struct DiscoveryMachine {
    target: DiscoveryTarget,
    state: DiscoveryState,
    /// Resolution issued to the backend and not yet answered.
    resolving: Option<ServiceRecord>,
    resolved: Option<ServiceRecord>,
    lost: Vec<ServiceRecord>,
}

impl DiscoveryMachine {
    pub fn new(target: DiscoveryTarget) -> Self {
        Self {
            target,
            state: DiscoveryState::Idle,
            resolving: None,
            resolved: None,
            lost: Vec::new(),
        }
    }

    pub fn target(&self) -> &DiscoveryTarget {
        &self.target
    }

    pub fn state(&self) -> DiscoveryState {
        self.state
    }

    /// The last successfully resolved target, until it is lost.
    pub fn resolved(&self) -> Option<&ServiceRecord> {
        self.resolved.as_ref()
    }

    pub fn is_resolving(&self) -> bool {
        self.resolving.is_some()
    }

    /// Instances reported lost during this session.
    pub fn lost(&self) -> &[ServiceRecord] {
        &self.lost
    }

    /// Enter `Discovering`, clearing all resolution bookkeeping.
    ///
    /// Returns `false` if discovery was already running.
    pub fn begin(&mut self) -> bool {
        if self.state.is_active() {
            return false;
        }
        self.state = DiscoveryState::Discovering;
        self.resolving = None;
        self.resolved = None;
        self.lost.clear();
        true
    }

    /// Enter `Stopped`. Returns `false` if discovery was not running, in
    /// which case there is nothing for the backend to stop.
    pub fn stop(&mut self) -> bool {
        let was_active = self.state.is_active();
        if was_active {
            self.state = DiscoveryState::Stopped;
        }
        self.resolving = None;
        was_active
    }

    /// Mark a failed start: the session ends without a backend stop.
    pub fn fail_start(&mut self) {
        self.state = DiscoveryState::Stopped;
        self.resolving = None;
    }

    /// Feed one backend callback through the machine.
    pub fn on_event(&mut self, event: BackendEvent) -> Option<Effect> {
        if !self.state.is_active() {
            debug!(?event, state = %self.state, "dropping discovery event");
            return None;
        }

        match event {
            BackendEvent::DiscoveryStarted => {
                debug!(service_type = %self.target.service_type, "service discovery started");
                Some(Effect::Notify(ListenerEvent::Started))
            }
            BackendEvent::DiscoveryStopped => {
                info!(service_type = %self.target.service_type, "discovery stopped by backend");
                self.state = DiscoveryState::Stopped;
                self.resolving = None;
                Some(Effect::Notify(ListenerEvent::Stopped))
            }
            BackendEvent::ServiceFound(record) => self.on_found(record),
            BackendEvent::ServiceLost(record) => self.on_lost(record),
            BackendEvent::Resolved(record) => self.on_resolved(record),
            BackendEvent::ResolveFailed { record, code } => {
                if !self.is_outstanding(&record) {
                    debug!(service = %record, "ignoring failure for a resolution not in flight");
                    return None;
                }
                self.resolving = None;
                warn!(service = %record, %code, "resolve failed");
                Some(Effect::Notify(ListenerEvent::Failed(
                    DiscoveryError::ResolveFailed {
                        name: record.name,
                        service_type: record.service_type,
                        code,
                    },
                )))
            }
            BackendEvent::StartFailed { code } => {
                warn!(service_type = %self.target.service_type, %code, "discovery failed to start");
                self.fail_start();
                Some(Effect::Notify(ListenerEvent::Failed(
                    DiscoveryError::StartFailed {
                        service_type: self.target.service_type.clone(),
                        code,
                    },
                )))
            }
            BackendEvent::StopFailed { code } => {
                warn!(service_type = %self.target.service_type, %code, "discovery failed to stop");
                self.state = DiscoveryState::Stopped;
                self.resolving = None;
                Some(Effect::Notify(ListenerEvent::Failed(
                    DiscoveryError::StopFailed {
                        service_type: self.target.service_type.clone(),
                        code,
                    },
                )))
            }
        }
    }

    fn on_found(&mut self, record: ServiceRecord) -> Option<Effect> {
        debug!(service = %record, "service found");
        if !same_service_type(&record.service_type, &self.target.service_type) {
            debug!(service_type = %record.service_type, "unknown service type");
            return None;
        }
        if record.name != self.target.service_name {
            return None;
        }
        if let Some(pending) = &self.resolving {
            debug!(service = %pending, "resolution already in flight");
            return None;
        }
        if self.resolved.is_some() {
            debug!(service = %record, "target already resolved");
            return None;
        }

        self.lost.retain(|lost| !lost.same_identity(&record));
        self.resolving = Some(record.clone());
        Some(Effect::Resolve(record))
    }

    fn on_lost(&mut self, record: ServiceRecord) -> Option<Effect> {
        warn!(service = %record, "service lost");
        if self
            .resolved
            .as_ref()
            .is_some_and(|resolved| resolved.same_identity(&record))
        {
            self.resolved = None;
        }
        if !self.lost.iter().any(|lost| lost.same_identity(&record)) {
            self.lost.push(record.clone());
        }
        Some(Effect::Notify(ListenerEvent::Lost(record)))
    }

    fn on_resolved(&mut self, record: ServiceRecord) -> Option<Effect> {
        if !self.is_outstanding(&record) {
            debug!(service = %record, "ignoring resolution not in flight");
            return None;
        }
        if !record.is_resolved() {
            warn!(service = %record, "backend resolved a record without host or port");
            self.resolving = None;
            return None;
        }
        self.resolving = None;
        info!(service = %record, "resolve succeeded");
        self.resolved = Some(record.clone());
        Some(Effect::Notify(ListenerEvent::Resolved(record)))
    }

    fn is_outstanding(&self, record: &ServiceRecord) -> bool {
        self.resolving
            .as_ref()
            .is_some_and(|pending| pending.same_identity(record))
    }
}

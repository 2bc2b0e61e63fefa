//! mDNS/DNS-SD backend built on `mdns-sd`.
//!
//! mdns-sd resolves every instance it browses on its own, so a
//! [`resolve`](DiscoveryBackend::resolve) request is answered from the
//! cache of resolved instances, or deferred until the instance resolves.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use micphone_types::{qualified_service_type, FailureCode, ServiceRecord};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::{BackendEvent, DiscoveryBackend, DiscoveryError};

const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Default)]
struct Shared {
    /// Resolved instances keyed by instance name.
    resolved: HashMap<String, ServiceRecord>,
    pending: Option<ServiceRecord>,
}

struct Browse {
    qualified: String,
    stop: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

/// Discovery backend using the pure-Rust mdns-sd responder.
pub struct MdnsDiscovery {
    daemon: ServiceDaemon,
    shared: Arc<Mutex<Shared>>,
    events: Option<mpsc::Sender<BackendEvent>>,
    browse: Option<Browse>,
}

impl MdnsDiscovery {
    pub fn new() -> Result<Self, DiscoveryError> {
        let daemon = ServiceDaemon::new().map_err(|e| DiscoveryError::Backend(e.to_string()))?;
        Ok(Self {
            daemon,
            shared: Arc::new(Mutex::new(Shared::default())),
            events: None,
            browse: None,
        })
    }
}

#[async_trait]
impl DiscoveryBackend for MdnsDiscovery {
    async fn start_discovery(
        &mut self,
        service_type: &str,
        events: mpsc::Sender<BackendEvent>,
    ) -> Result<(), DiscoveryError> {
        if self.browse.is_some() {
            return Err(DiscoveryError::StartFailed {
                service_type: service_type.to_string(),
                code: FailureCode::AlreadyActive,
            });
        }

        let qualified = qualified_service_type(service_type);
        let receiver = self.daemon.browse(&qualified).map_err(|e| {
            warn!(service_type = %qualified, error = %e, "mDNS browse failed");
            DiscoveryError::StartFailed {
                service_type: service_type.to_string(),
                code: FailureCode::Internal,
            }
        })?;

        *lock(&self.shared) = Shared::default();
        let stop = Arc::new(AtomicBool::new(false));
        let task = {
            let shared = Arc::clone(&self.shared);
            let stop = Arc::clone(&stop);
            let events = events.clone();
            tokio::task::spawn_blocking(move || {
                let mut started = false;
                while !stop.load(Ordering::SeqCst) {
                    let event = match receiver.recv_timeout(POLL_INTERVAL) {
                        Ok(event) => event,
                        Err(_) if receiver.is_disconnected() => break,
                        Err(_) => continue,
                    };
                    for translated in translate(event, &shared, &mut started) {
                        if stop.load(Ordering::SeqCst) || events.blocking_send(translated).is_err()
                        {
                            return;
                        }
                    }
                }
                debug!("mDNS browse loop finished");
            })
        };

        info!(service_type = %qualified, "mDNS browse started");
        self.events = Some(events);
        self.browse = Some(Browse {
            qualified,
            stop,
            task,
        });
        Ok(())
    }

    async fn stop_discovery(&mut self) -> Result<(), DiscoveryError> {
        let Some(browse) = self.browse.take() else {
            return Ok(());
        };
        self.events = None;
        lock(&self.shared).pending = None;

        browse.stop.store(true, Ordering::SeqCst);
        let stopped = self.daemon.stop_browse(&browse.qualified);
        let _ = browse.task.await;

        stopped.map_err(|e| {
            warn!(service_type = %browse.qualified, error = %e, "mDNS stop_browse failed");
            DiscoveryError::StopFailed {
                service_type: browse.qualified.clone(),
                code: FailureCode::Internal,
            }
        })
    }

    async fn resolve(&mut self, record: ServiceRecord) -> Result<(), DiscoveryError> {
        let Some(events) = self.events.clone() else {
            return Err(DiscoveryError::ResolveFailed {
                name: record.name,
                service_type: record.service_type,
                code: FailureCode::Internal,
            });
        };

        match lookup_or_defer(&self.shared, &record) {
            Some(resolved) => {
                debug!(service = %resolved, "answering resolve from cache");
                // The caller drains `events`; never block it on its own channel.
                tokio::spawn(async move {
                    let _ = events.send(BackendEvent::Resolved(resolved)).await;
                });
            }
            None => debug!(service = %record, "waiting for mDNS to resolve"),
        }
        Ok(())
    }
}

impl Drop for MdnsDiscovery {
    fn drop(&mut self) {
        if let Some(browse) = self.browse.take() {
            browse.stop.store(true, Ordering::SeqCst);
        }
        if let Err(e) = self.daemon.shutdown() {
            debug!(error = %e, "mDNS daemon shutdown failed");
        }
    }
}

fn translate(event: ServiceEvent, shared: &Mutex<Shared>, started: &mut bool) -> Vec<BackendEvent> {
    match event {
        ServiceEvent::SearchStarted(ty) => {
            trace!(service_type = %ty, "mDNS query sent");
            if *started {
                return Vec::new();
            }
            *started = true;
            vec![BackendEvent::DiscoveryStarted]
        }
        ServiceEvent::SearchStopped(ty) => {
            debug!(service_type = %ty, "mDNS search stopped");
            vec![BackendEvent::DiscoveryStopped]
        }
        ServiceEvent::ServiceFound(ty, fullname) => {
            match ServiceRecord::from_fullname(&fullname, &ty) {
                Ok(record) => vec![BackendEvent::ServiceFound(record)],
                Err(e) => {
                    debug!(error = %e, "skipping unparseable instance");
                    Vec::new()
                }
            }
        }
        ServiceEvent::ServiceResolved(info) => on_resolved(&info, shared),
        ServiceEvent::ServiceRemoved(ty, fullname) => {
            match ServiceRecord::from_fullname(&fullname, &ty) {
                Ok(record) => {
                    lock(shared).resolved.remove(&record.name);
                    vec![BackendEvent::ServiceLost(record)]
                }
                Err(e) => {
                    debug!(error = %e, "skipping unparseable instance");
                    Vec::new()
                }
            }
        }
        #[allow(unreachable_patterns)]
        _ => Vec::new(),
    }
}

fn on_resolved(info: &ServiceInfo, shared: &Mutex<Shared>) -> Vec<BackendEvent> {
    let record = match ServiceRecord::from_fullname(info.get_fullname(), info.get_type()) {
        Ok(record) => record,
        Err(e) => {
            debug!(error = %e, "skipping unparseable instance");
            return Vec::new();
        }
    };

    let addresses: Vec<IpAddr> = info
        .get_addresses()
        .iter()
        .map(|addr| IpAddr::from(*addr))
        .collect();
    let Some(host) = addresses
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addresses.first())
        .copied()
    else {
        debug!(service = %record, "resolved instance has no address yet");
        return Vec::new();
    };

    let resolved = record.resolved(host, info.get_port());
    let mut shared = lock(shared);
    shared
        .resolved
        .insert(resolved.name.clone(), resolved.clone());

    match &shared.pending {
        Some(pending) if pending.same_identity(&resolved) => {
            shared.pending = None;
            vec![BackendEvent::Resolved(resolved)]
        }
        _ => Vec::new(),
    }
}

/// The cached resolution for `record`, or `None` after marking it pending.
fn lookup_or_defer(shared: &Mutex<Shared>, record: &ServiceRecord) -> Option<ServiceRecord> {
    let mut shared = lock(shared);
    match shared.resolved.get(&record.name) {
        Some(resolved) if resolved.same_identity(record) => Some(resolved.clone()),
        _ => {
            shared.pending = Some(record.clone());
            None
        }
    }
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

//! Endpoint resolution with a shared lookup cache.
//!
//! Direct references resolve to their own endpoints. Indirect references go
//! through the [`LocationService`]; successful answers are cached per adapter
//! id or identity, failed lookups never are. Concurrent resolves of the same
//! key share one in-flight lookup.

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::endpoint::EndpointDescriptor;
use crate::location::{LocationService, LocatorError};
use crate::reference::{Identity, Reference, Target};
use crate::{RemotingError, Result};

/// Resolved endpoints in the order they should be tried
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub endpoints: Vec<EndpointDescriptor>,
    /// True when no location service call was needed
    pub from_cache: bool,
}

/// Resolver counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolverStats {
    pub locator_calls: u64,
    pub cache_hits: u64,
    pub cached_entries: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CacheKey {
    Adapter(String),
    Object(Identity),
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::Adapter(adapter) => write!(f, "adapter {}", adapter),
            CacheKey::Object(identity) => write!(f, "object {}", identity),
        }
    }
}

struct CacheEntry {
    endpoints: Vec<EndpointDescriptor>,
    inserted_at: Instant,
}

type LookupOutcome = Option<Result<Vec<EndpointDescriptor>>>;

#[derive(Default)]
struct ResolverState {
    cache: HashMap<CacheKey, CacheEntry>,
    inflight: HashMap<CacheKey, watch::Receiver<LookupOutcome>>,
}

enum Step {
    Hit(Vec<EndpointDescriptor>),
    Wait(watch::Receiver<LookupOutcome>),
    Lead(watch::Sender<LookupOutcome>),
}

/// Removes the in-flight marker if the leading lookup is dropped midway
struct InflightGuard<'a> {
    state: &'a Mutex<ResolverState>,
    key: CacheKey,
    armed: bool,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.state.lock().inflight.remove(&self.key);
        }
    }
}

pub struct EndpointResolver {
    locator: Arc<dyn LocationService>,
    state: Mutex<ResolverState>,
    lookup_timeout: Duration,
    default_cache_timeout: Option<Duration>,
    locator_calls: AtomicU64,
    cache_hits: AtomicU64,
}

impl EndpointResolver {
    pub fn new(
        locator: Arc<dyn LocationService>,
        lookup_timeout: Duration,
        default_cache_timeout: Option<Duration>,
    ) -> Self {
        Self {
            locator,
            state: Mutex::new(ResolverState::default()),
            lookup_timeout,
            default_cache_timeout,
            locator_calls: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
        }
    }

    /// Resolve a reference to its candidate endpoints.
    ///
    /// Unreachable location services are reported, not retried here; the
    /// invocation retry loop decides.
    pub async fn resolve(&self, reference: &Reference) -> Result<Resolution> {
        let ttl = reference.locator_cache_timeout().or(self.default_cache_timeout);

        let (endpoints, from_cache) = match reference.target() {
            Target::Direct(endpoints) => (endpoints.clone(), true),
            Target::Adapter(adapter) => self.lookup(CacheKey::Adapter(adapter.clone()), ttl).await?,
            Target::WellKnown => self.lookup(CacheKey::Object(reference.identity().clone()), ttl).await?,
        };

        if endpoints.is_empty() {
            return Err(RemotingError::no_endpoints(reference.to_string()));
        }

        Ok(Resolution {
            endpoints: reference.endpoint_selection().arrange(endpoints),
            from_cache,
        })
    }

    /// Drop the cache entry for this reference's own key; returns whether one existed
    pub fn invalidate(&self, reference: &Reference) -> bool {
        let key = match reference.target() {
            Target::Direct(_) => return false,
            Target::Adapter(adapter) => CacheKey::Adapter(adapter.clone()),
            Target::WellKnown => CacheKey::Object(reference.identity().clone()),
        };

        let removed = self.state.lock().cache.remove(&key).is_some();
        if removed {
            debug!(%key, "Invalidated resolution cache entry");
        }
        removed
    }

    pub fn stats(&self) -> ResolverStats {
        ResolverStats {
            locator_calls: self.locator_calls.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cached_entries: self.state.lock().cache.len(),
        }
    }

    fn lookup(&self, key: CacheKey, ttl: Option<Duration>) -> BoxFuture<'_, Result<(Vec<EndpointDescriptor>, bool)>> {
        async move {
            loop {
                let step = {
                    let mut state = self.state.lock();
                    let fresh = state.cache.get(&key).and_then(|entry| {
                        let expired = match ttl {
                            Some(ttl) => entry.inserted_at.elapsed() >= ttl,
                            None => false,
                        };
                        (!expired).then(|| entry.endpoints.clone())
                    });

                    if let Some(endpoints) = fresh {
                        Step::Hit(endpoints)
                    } else if let Some(rx) = state.inflight.get(&key) {
                        Step::Wait(rx.clone())
                    } else {
                        let (tx, rx) = watch::channel(None);
                        state.inflight.insert(key.clone(), rx);
                        Step::Lead(tx)
                    }
                };

                match step {
                    Step::Hit(endpoints) => {
                        self.cache_hits.fetch_add(1, Ordering::Relaxed);
                        debug!(%key, "Resolution cache hit");
                        return Ok((endpoints, true));
                    }
                    Step::Lead(tx) => {
                        let endpoints = self.lead_lookup(&key, ttl, tx).await?;
                        return Ok((endpoints, false));
                    }
                    Step::Wait(mut rx) => {
                        let outcome = rx.wait_for(Option::is_some).await.map(|outcome| outcome.clone());
                        match outcome {
                            Ok(Some(result)) => return result.map(|endpoints| (endpoints, false)),
                            // The leader was cancelled; take over
                            _ => continue,
                        }
                    }
                }
            }
        }
        .boxed()
    }

    async fn lead_lookup(
        &self,
        key: &CacheKey,
        ttl: Option<Duration>,
        tx: watch::Sender<LookupOutcome>,
    ) -> Result<Vec<EndpointDescriptor>> {
        let mut guard = InflightGuard {
            state: &self.state,
            key: key.clone(),
            armed: true,
        };

        let result = self.query_locator(key, ttl).await;

        {
            let mut state = self.state.lock();
            if let Ok(endpoints) = &result {
                // A zero timeout bypasses the cache entirely
                if ttl != Some(Duration::ZERO) {
                    state.cache.insert(
                        key.clone(),
                        CacheEntry {
                            endpoints: endpoints.clone(),
                            inserted_at: Instant::now(),
                        },
                    );
                }
            }
            state.inflight.remove(key);
            guard.armed = false;
        }

        let _ = tx.send(Some(result.clone()));
        result
    }

    async fn query_locator(&self, key: &CacheKey, ttl: Option<Duration>) -> Result<Vec<EndpointDescriptor>> {
        self.locator_calls.fetch_add(1, Ordering::Relaxed);
        info!(%key, "Querying location service");

        match key {
            CacheKey::Adapter(adapter) => {
                let answer = tokio::time::timeout(self.lookup_timeout, self.locator.find_adapter_endpoints(adapter))
                    .await
                    .map_err(|_| self.lookup_timed_out(key))?;
                answer.map_err(|e| Self::locator_error(key, e))
            }
            CacheKey::Object(identity) => {
                let answer = tokio::time::timeout(self.lookup_timeout, self.locator.find_object_by_id(identity))
                    .await
                    .map_err(|_| self.lookup_timed_out(key))?;
                let reference = answer.map_err(|e| Self::locator_error(key, e))?;

                match reference.target() {
                    Target::Direct(endpoints) => Ok(endpoints.clone()),
                    // One further level; the adapter lookup keeps its own entry
                    Target::Adapter(adapter) => {
                        let (endpoints, _) = self.lookup(CacheKey::Adapter(adapter.clone()), ttl).await?;
                        Ok(endpoints)
                    }
                    Target::WellKnown => Err(RemotingError::no_endpoints(identity.to_string())),
                }
            }
        }
    }

    fn lookup_timed_out(&self, key: &CacheKey) -> RemotingError {
        warn!(%key, timeout_ms = self.lookup_timeout.as_millis() as u64, "Location service lookup timed out");
        RemotingError::locator_unreachable(format!(
            "lookup of {} timed out after {}ms",
            key,
            self.lookup_timeout.as_millis()
        ))
    }

    fn locator_error(key: &CacheKey, error: LocatorError) -> RemotingError {
        match (error, key) {
            (LocatorError::NotRegistered, CacheKey::Adapter(adapter)) => {
                RemotingError::adapter_not_registered(adapter.clone())
            }
            (LocatorError::NotRegistered, CacheKey::Object(identity)) => {
                RemotingError::object_not_registered(identity.to_string())
            }
            (LocatorError::Unreachable { message }, _) => {
                warn!(%key, %message, "Location service unreachable");
                RemotingError::locator_unreachable(message)
            }
        }
    }
}

// Resource manager - Shared context, reverb cache and idle sweep
//
// Owns the one AudioContext (created lazily), caches reverb nodes by profile
// id and keeps a registry of last-use times for notes and reverbs. The idle
// sweep evicts entries nobody touched within the threshold and caps the
// impulse-response cache.
//
// Registry stamps and sweeps use the context's uptime, which keeps counting
// while the context is suspended and its sample clock is frozen.
//
// A failure to create the context is permanent for the process: it is
// recorded once and every later get_context() reports it without retrying.

use super::AudioError;
use super::context::AudioContext;
use crate::config::{AudioConfig, LatencyPreference, QualityTier, ResourceConfig};
use crate::messaging::note::NoteId;
use crate::synth::reverb::{ReverbNode, ReverbProfile};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

/// Handle shared by the facade and the synthesis engine
pub type SharedResources = Arc<Mutex<ResourceManager>>;

/// Lock shared resources, recovering from a poisoned lock
pub fn lock_resources(resources: &SharedResources) -> MutexGuard<'_, ResourceManager> {
    resources.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceKey {
    Note(NoteId),
    Reverb(String),
}

/// What one sweep removed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    /// Notes whose registry entry went stale (their timer never fired)
    pub evicted_notes: Vec<NoteId>,
    pub evicted_reverbs: Vec<String>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.evicted_notes.is_empty() && self.evicted_reverbs.is_empty()
    }
}

enum ContextSlot {
    Uninitialised,
    Ready(Arc<AudioContext>),
    Unavailable(String),
}

pub struct ResourceManager {
    audio: AudioConfig,
    limits: ResourceConfig,
    latency: LatencyPreference,
    quality: QualityTier,
    context: ContextSlot,
    reverbs: HashMap<String, Arc<ReverbNode>>,
    /// Cache insertion order, oldest first
    reverb_order: VecDeque<String>,
    registry: HashMap<ResourceKey, f64>,
    last_sweep: f64,
}

impl ResourceManager {
    pub fn new(audio: AudioConfig, limits: ResourceConfig, latency: LatencyPreference) -> Self {
        Self {
            audio,
            limits,
            latency,
            quality: QualityTier::default(),
            context: ContextSlot::Uninitialised,
            reverbs: HashMap::new(),
            reverb_order: VecDeque::new(),
            registry: HashMap::new(),
            last_sweep: 0.0,
        }
    }

    pub fn shared(self) -> SharedResources {
        Arc::new(Mutex::new(self))
    }

    /// The shared context, created on first call
    ///
    /// Repeated calls return the same instance. A creation failure is
    /// remembered and returned as `AudioError::Unavailable` from then on.
    pub fn get_context(&mut self) -> Result<Arc<AudioContext>, AudioError> {
        match &self.context {
            ContextSlot::Ready(context) => return Ok(Arc::clone(context)),
            ContextSlot::Unavailable(reason) => return Err(AudioError::Unavailable(reason.clone())),
            ContextSlot::Uninitialised => {}
        }

        match AudioContext::new(&self.audio, self.latency) {
            Ok(context) => {
                self.context = ContextSlot::Ready(Arc::clone(&context));
                Ok(context)
            }
            Err(err) => {
                tracing::warn!(error = %err, "Audio unavailable, continuing muted");
                self.context = ContextSlot::Unavailable(err.to_string());
                Err(err)
            }
        }
    }

    /// Install an already built context (offline hosts, tests)
    pub fn install_context(&mut self, context: Arc<AudioContext>) {
        self.context = ContextSlot::Ready(context);
    }

    /// The context if it exists, without creating it
    pub fn context(&self) -> Option<Arc<AudioContext>> {
        match &self.context {
            ContextSlot::Ready(context) => Some(Arc::clone(context)),
            _ => None,
        }
    }

    /// None until the first get_context()
    pub fn is_available(&self) -> Option<bool> {
        match self.context {
            ContextSlot::Uninitialised => None,
            ContextSlot::Ready(_) => Some(true),
            ContextSlot::Unavailable(_) => Some(false),
        }
    }

    /// Context time, 0 before the context exists
    pub fn now(&self) -> f64 {
        self.context().map(|c| c.now()).unwrap_or(0.0)
    }

    /// Context uptime (suspended wall time included), 0 before the context exists
    pub fn uptime(&self) -> f64 {
        self.context().map(|c| c.uptime()).unwrap_or(0.0)
    }

    pub fn limits(&self) -> &ResourceConfig {
        &self.limits
    }

    pub fn set_latency(&mut self, latency: LatencyPreference) {
        // Only consulted when the context is (re)created
        self.latency = latency;
    }

    /// Impulse responses generated from now on use this tier
    pub fn set_quality(&mut self, quality: QualityTier) {
        self.quality = quality;
    }

    /// Cached reverb node for `profile_id`, generated on first request
    ///
    /// Unknown ids resolve to the default profile and share its node.
    pub fn get_reverb(&mut self, profile_id: &str) -> Result<Arc<ReverbNode>, AudioError> {
        let profile = ReverbProfile::resolve(profile_id);
        let now = self.uptime();

        if let Some(node) = self.reverbs.get(&profile.id) {
            let node = Arc::clone(node);
            self.registry.insert(ResourceKey::Reverb(profile.id), now);
            return Ok(node);
        }

        let sample_rate = self.get_context()?.sample_rate();
        let id = profile.id.clone();
        let node = Arc::new(ReverbNode::new(
            profile,
            sample_rate,
            self.quality.impulse_length_scale(),
        ));
        tracing::debug!(
            profile = %id,
            seconds = node.duration_secs(),
            "Generated impulse response"
        );

        self.reverbs.insert(id.clone(), Arc::clone(&node));
        self.reverb_order.push_back(id.clone());
        self.registry.insert(ResourceKey::Reverb(id), now);
        Ok(node)
    }

    pub fn cached_reverbs(&self) -> usize {
        self.reverbs.len()
    }

    pub fn is_reverb_cached(&self, profile_id: &str) -> bool {
        self.reverbs.contains_key(profile_id)
    }

    /// Record use of a resource at `now`
    pub fn touch(&mut self, key: ResourceKey, now: f64) {
        self.registry.insert(key, now);
    }

    /// Record use of a resource at the current uptime
    pub fn touch_now(&mut self, key: ResourceKey) {
        let now = self.uptime();
        self.touch(key, now);
    }

    pub fn forget(&mut self, key: &ResourceKey) {
        self.registry.remove(key);
    }

    pub fn last_used(&self, key: &ResourceKey) -> Option<f64> {
        self.registry.get(key).copied()
    }

    pub fn registry_len(&self) -> usize {
        self.registry.len()
    }

    /// True once `sweep_interval_secs` elapsed since the last sweep
    pub fn sweep_due(&self, now: f64) -> bool {
        now - self.last_sweep >= self.limits.sweep_interval_secs
    }

    /// Evict everything idle longer than the threshold, then cap the cache
    pub fn sweep(&mut self, now: f64) -> SweepReport {
        self.last_sweep = now;
        let threshold = self.limits.idle_threshold_secs;
        let mut report = SweepReport::default();

        let stale: Vec<ResourceKey> = self
            .registry
            .iter()
            .filter(|(_, last_used)| now - **last_used > threshold)
            .map(|(key, _)| key.clone())
            .collect();

        for key in stale {
            self.registry.remove(&key);
            match key {
                ResourceKey::Note(id) => report.evicted_notes.push(id),
                ResourceKey::Reverb(id) => {
                    if self.reverbs.remove(&id).is_some() {
                        self.reverb_order.retain(|cached| cached != &id);
                        report.evicted_reverbs.push(id);
                    }
                }
            }
        }

        while self.reverbs.len() > self.limits.max_impulse_responses {
            let Some(oldest) = self.reverb_order.pop_front() else {
                break;
            };
            if self.reverbs.remove(&oldest).is_some() {
                self.registry.remove(&ResourceKey::Reverb(oldest.clone()));
                report.evicted_reverbs.push(oldest);
            }
        }

        if !report.is_empty() {
            tracing::debug!(
                notes = report.evicted_notes.len(),
                reverbs = report.evicted_reverbs.len(),
                "Idle sweep evicted resources"
            );
        }
        report
    }

    /// Visibility lost. Safe to call repeatedly.
    pub fn suspend(&self) -> bool {
        self.context().is_some_and(|c| c.suspend())
    }

    /// Visibility regained. Safe to call repeatedly.
    pub fn resume(&self) -> bool {
        self.context().is_some_and(|c| c.resume())
    }

    pub fn notify_gesture(&self) -> bool {
        self.context().is_some_and(|c| c.notify_gesture())
    }

    /// Approximate bytes held by cached impulse responses
    pub fn reverb_memory_bytes(&self) -> usize {
        self.reverbs.values().map(|node| node.memory_bytes()).sum()
    }

    /// Close the context and drop every cached resource
    pub fn close(&mut self) {
        if let ContextSlot::Ready(context) = &self.context {
            context.close();
        }
        self.reverbs.clear();
        self.reverb_order.clear();
        self.registry.clear();
    }
}

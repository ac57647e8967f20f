//! Global component registry
//!
//! A process-wide directory mapping component ids to their input
//! channels, plus the health and buffer-load signals that routing and
//! scaling consume. The registry is an explicit handle passed to every
//! actor constructor, never a singleton.

use crate::{channel_fill, Envelope};
use flux_common::{clamp_health, BufferStatus, SimError, SimResult};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Default interval between buffer-load samples.
pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug)]
struct Entry {
    sender: mpsc::Sender<Envelope>,
    health: f64,
    load: BufferStatus,
    fill: f64,
}

/// Process-wide directory of component input channels.
#[derive(Debug)]
pub struct ComponentRegistry {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
    running: AtomicBool,
    sample_interval: Duration,
    shutdown: watch::Sender<bool>,
    sampler: Mutex<Option<JoinHandle<()>>>,
}

impl ComponentRegistry {
    /// Registry sampling at the default interval.
    pub fn new() -> Self {
        Self::with_interval(SAMPLE_INTERVAL)
    }

    /// Registry with a custom sampling interval.
    pub fn with_interval(sample_interval: Duration) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            running: AtomicBool::new(false),
            sample_interval,
            shutdown,
            sampler: Mutex::new(None),
        }
    }

    /// Register a component's input channel. Registration with an
    /// empty id is a no-op; re-registration replaces the entry.
    pub fn register(&self, id: &str, sender: mpsc::Sender<Envelope>) {
        if id.is_empty() {
            tracing::warn!("ignoring registration with empty component id");
            return;
        }
        let mut entries = self.entries.write();
        if entries
            .insert(
                id.to_string(),
                Entry { sender, health: 1.0, load: BufferStatus::Normal, fill: 0.0 },
            )
            .is_some()
        {
            tracing::warn!(component = id, "re-registered existing component");
        } else {
            tracing::info!(component = id, "component registered");
        }
    }

    /// Remove a component from the directory.
    pub fn unregister(&self, id: &str) {
        if self.entries.write().remove(id).is_some() {
            tracing::info!(component = id, "component unregistered");
        }
    }

    /// Input channel of a component, if registered.
    pub fn channel(&self, id: &str) -> Option<mpsc::Sender<Envelope>> {
        self.entries.read().get(id).map(|e| e.sender.clone())
    }

    /// Ids of all registered components.
    pub fn all(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    /// Number of registered components.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the directory is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Health of a component. Unknown ids read as 0.0 so routing
    /// treats unknown targets as dead.
    pub fn health(&self, id: &str) -> f64 {
        self.entries.read().get(id).map(|e| e.health).unwrap_or(0.0)
    }

    /// Set a component's health, clamped into [0,1].
    pub fn update_health(&self, id: &str, health: f64) {
        if let Some(entry) = self.entries.write().get_mut(id) {
            entry.health = clamp_health(health);
        }
    }

    /// Buffer status of a component. Unknown ids read as Emergency.
    pub fn load(&self, id: &str) -> BufferStatus {
        self.entries
            .read()
            .get(id)
            .map(|e| e.load)
            .unwrap_or(BufferStatus::Emergency)
    }

    /// Set a component's buffer status directly.
    pub fn update_load(&self, id: &str, load: BufferStatus) {
        if let Some(entry) = self.entries.write().get_mut(id) {
            entry.load = load;
        }
    }

    /// Last sampled input-channel fill fraction of a component.
    pub fn fill(&self, id: &str) -> f64 {
        self.entries.read().get(id).map(|e| e.fill).unwrap_or(1.0)
    }

    /// Start the background buffer sampler.
    pub fn start(&self) -> SimResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SimError::Lifecycle("registry already started".into()));
        }
        let entries = Arc::clone(&self.entries);
        let interval = self.sample_interval;
        let mut shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tick.tick() => Self::sample_entries(&entries),
                }
            }
            tracing::debug!("registry sampler stopped");
        });
        *self.sampler.lock() = Some(handle);
        tracing::info!("registry started");
        Ok(())
    }

    /// Stop the background sampler.
    pub async fn stop(&self) -> SimResult<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(SimError::Lifecycle("registry not running".into()));
        }
        let _ = self.shutdown.send(true);
        let sampler = self.sampler.lock().take();
        if let Some(handle) = sampler {
            let _ = handle.await;
        }
        let _ = self.shutdown.send(false);
        tracing::info!("registry stopped");
        Ok(())
    }

    /// One sampling pass: classify every component's input fill and
    /// derive health = 1 − fill.
    pub fn sample(&self) {
        Self::sample_entries(&self.entries);
    }

    fn sample_entries(entries: &RwLock<HashMap<String, Entry>>) {
        let mut entries = entries.write();
        for (id, entry) in entries.iter_mut() {
            let fill = channel_fill(&entry.sender);
            entry.fill = fill;
            entry.load = BufferStatus::from_fill(fill);
            entry.health = clamp_health(1.0 - fill);
            tracing::trace!(component = %id, fill, status = ?entry.load, "sampled buffer");
        }
    }
}

impl Default for ComponentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::config::SelectionPolicy;
use crate::device::{DeviceId, DeviceMonitor, DeviceSnapshot};
use crate::error::Result;

#[derive(Debug, Default)]
struct DeviceCounters {
    in_flight: usize,
    peak: usize,
}

#[derive(Debug, Default)]
struct Counters {
    devices: BTreeMap<DeviceId, DeviceCounters>,
    last_selected: Option<DeviceId>,
}

/// A device that passed the memory and capacity filters
#[derive(Debug, Clone, Copy)]
struct Candidate {
    id: DeviceId,
    free_bytes: u64,
    in_flight: usize,
}

/// Tracks in-flight jobs per device and decides where the next job may run.
///
/// `try_admit` holds the admission lock across snapshot, filter and
/// increment, so concurrent callers never admit past a device's cap.
/// `release` only touches the counters and may run at any time.
pub struct DeviceAdmissionTable {
    monitor: Arc<dyn DeviceMonitor>,
    policy: SelectionPolicy,
    admission: tokio::sync::Mutex<()>,
    counters: Mutex<Counters>,
}

/// Why no device could take a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refusal {
    /// A device with enough total memory is running jobs admitted here and
    /// will have room once they finish
    Busy,
    /// No device has the memory free, and none of them is running our jobs
    OutOfMemory,
}

/// Outcome of `DeviceAdmissionTable::admit`
#[derive(Debug)]
pub enum Admission<'a> {
    Granted(AdmissionSlot<'a>),
    Refused(Refusal),
}

/// Admission that releases its device slot when dropped
#[derive(Debug)]
pub struct AdmissionSlot<'a> {
    table: &'a DeviceAdmissionTable,
    device: DeviceId,
}

impl AdmissionSlot<'_> {
    pub fn device(&self) -> DeviceId {
        self.device
    }
}

impl Drop for AdmissionSlot<'_> {
    fn drop(&mut self) {
        self.table.release(self.device);
    }
}

impl std::fmt::Debug for DeviceAdmissionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceAdmissionTable")
            .field("policy", &self.policy)
            .field("counters", &*self.counters())
            .finish()
    }
}

impl DeviceAdmissionTable {
    pub fn new(monitor: Arc<dyn DeviceMonitor>, policy: SelectionPolicy) -> Self {
        Self {
            monitor,
            policy,
            admission: tokio::sync::Mutex::new(()),
            counters: Mutex::new(Counters::default()),
        }
    }

    fn counters(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fresh device memory snapshot from the underlying monitor
    pub async fn snapshot(&self) -> Result<DeviceSnapshot> {
        self.monitor.snapshot().await
    }

    /// Reserve a slot on the best qualifying device.
    ///
    /// Returns `Ok(None)` when no device has `required_bytes` free and a
    /// slot below `max_jobs_per_device`. Every `Some` must be paired with
    /// exactly one `release`.
    pub async fn try_admit(
        &self,
        required_bytes: u64,
        max_jobs_per_device: usize,
    ) -> Result<Option<DeviceId>> {
        Ok(self.decide(required_bytes, max_jobs_per_device).await?.ok())
    }

    /// Like `try_admit`, but the granted slot releases itself on drop and a
    /// refusal says whether waiting can help
    pub async fn admit(
        &self,
        required_bytes: u64,
        max_jobs_per_device: usize,
    ) -> Result<Admission<'_>> {
        Ok(match self.decide(required_bytes, max_jobs_per_device).await? {
            Ok(device) => Admission::Granted(AdmissionSlot { table: self, device }),
            Err(refusal) => Admission::Refused(refusal),
        })
    }

    async fn decide(
        &self,
        required_bytes: u64,
        max_jobs_per_device: usize,
    ) -> Result<std::result::Result<DeviceId, Refusal>> {
        let _admission = self.admission.lock().await;
        let snapshot = self.monitor.snapshot().await?;

        let mut counters = self.counters();
        let in_flight = |counters: &Counters, id: &DeviceId| {
            counters.devices.get(id).map_or(0, |c| c.in_flight)
        };
        let candidates: Vec<Candidate> = snapshot
            .iter()
            .map(|(&id, memory)| Candidate {
                id,
                free_bytes: memory.free_bytes,
                in_flight: in_flight(&*counters, &id),
            })
            .filter(|c| c.free_bytes >= required_bytes && c.in_flight < max_jobs_per_device)
            .collect();

        let Some(device) = select_device(self.policy, &candidates, counters.last_selected) else {
            let busy = snapshot
                .iter()
                .any(|(id, memory)| memory.total_bytes >= required_bytes && in_flight(&*counters, id) > 0);
            let refusal = if busy { Refusal::Busy } else { Refusal::OutOfMemory };
            debug!(
                ?refusal,
                "No admissible device among {} (need {} bytes, cap {})",
                snapshot.len(),
                required_bytes,
                max_jobs_per_device
            );
            return Ok(Err(refusal));
        };

        counters.last_selected = Some(device);
        let entry = counters.devices.entry(device).or_default();
        entry.in_flight += 1;
        entry.peak = entry.peak.max(entry.in_flight);
        debug!(device, in_flight = entry.in_flight, "Admitted job");

        Ok(Ok(device))
    }

    /// Give back a slot obtained from `try_admit`
    pub fn release(&self, device: DeviceId) {
        let mut counters = self.counters();
        match counters.devices.get_mut(&device) {
            Some(entry) if entry.in_flight > 0 => {
                entry.in_flight -= 1;
                debug!(device, in_flight = entry.in_flight, "Released device slot");
            }
            _ => warn!(device, "Release without a matching admission"),
        }
    }

    /// Jobs currently admitted on `device`
    pub fn in_flight(&self, device: DeviceId) -> usize {
        self.counters().devices.get(&device).map_or(0, |c| c.in_flight)
    }

    /// Highest in-flight count ever observed on `device`
    pub fn peak_in_flight(&self, device: DeviceId) -> usize {
        self.counters().devices.get(&device).map_or(0, |c| c.peak)
    }

    /// Total jobs currently admitted across all devices
    pub fn total_in_flight(&self) -> usize {
        self.counters().devices.values().map(|c| c.in_flight).sum()
    }
}

fn select_device(
    policy: SelectionPolicy,
    candidates: &[Candidate],
    last_selected: Option<DeviceId>,
) -> Option<DeviceId> {
    // Candidates arrive in ascending id order; min_by_key keeps the first
    // minimum, so remaining ties go to the lowest id.
    let chosen = match policy {
        SelectionPolicy::LeastLoaded => candidates
            .iter()
            .min_by_key(|c| (c.in_flight, Reverse(c.free_bytes))),
        SelectionPolicy::MostFreeMemory => candidates
            .iter()
            .min_by_key(|c| (Reverse(c.free_bytes), c.in_flight)),
        SelectionPolicy::FirstFit => candidates.first(),
        SelectionPolicy::RoundRobin => last_selected
            .and_then(|last| candidates.iter().find(|c| c.id > last))
            .or_else(|| candidates.first()),
    };
    chosen.map(|c| c.id)
}

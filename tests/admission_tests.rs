mod common;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

use common::{FixedMonitor, GIB};
use subdispatch::admission::DeviceAdmissionTable;
use subdispatch::config::SelectionPolicy;

const CAP: usize = 2;
const DEVICES: u32 = 3;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_admissions_never_exceed_cap() {
    // A slow snapshot widens the window between reading memory and counting the job
    let monitor = Arc::new(FixedMonitor::slow(
        (0..DEVICES).map(|id| (id, 16 * GIB)).collect(),
        Duration::from_millis(2),
    ));
    let table = Arc::new(DeviceAdmissionTable::new(monitor, SelectionPolicy::LeastLoaded));
    let running: Arc<BTreeMap<u32, AtomicUsize>> =
        Arc::new((0..DEVICES).map(|id| (id, AtomicUsize::new(0))).collect());
    let completed = Arc::new(AtomicUsize::new(0));

    let mut tasks = JoinSet::new();
    for _ in 0..32 {
        let table = Arc::clone(&table);
        let running = Arc::clone(&running);
        let completed = Arc::clone(&completed);
        tasks.spawn(async move {
            for _ in 0..3 {
                let device = loop {
                    match table.try_admit(4 * GIB, CAP).await.unwrap() {
                        Some(device) => break device,
                        None => tokio::time::sleep(Duration::from_millis(1)).await,
                    }
                };

                let now = running[&device].fetch_add(1, Ordering::SeqCst) + 1;
                assert!(now <= CAP, "device {} ran {} jobs at once", device, now);
                assert!(table.in_flight(device) <= CAP);

                tokio::time::sleep(Duration::from_millis(3)).await;
                running[&device].fetch_sub(1, Ordering::SeqCst);
                table.release(device);
                completed.fetch_add(1, Ordering::SeqCst);
            }
        });
    }
    while let Some(joined) = tasks.join_next().await {
        joined.unwrap();
    }

    assert_eq!(completed.load(Ordering::SeqCst), 96);
    assert_eq!(table.total_in_flight(), 0);
    for device in 0..DEVICES {
        assert!(table.peak_in_flight(device) <= CAP);
        assert!(table.peak_in_flight(device) >= 1);
    }
}

#[tokio::test]
async fn test_memory_filter_is_respected_under_load() {
    let monitor = Arc::new(FixedMonitor::new(vec![(0, 2 * GIB), (1, 12 * GIB)]));
    let table = Arc::new(DeviceAdmissionTable::new(monitor, SelectionPolicy::MostFreeMemory));

    let mut admitted = Vec::new();
    while let Some(device) = table.try_admit(4 * GIB, CAP).await.unwrap() {
        admitted.push(device);
    }

    assert_eq!(admitted, vec![1; CAP]);
    assert_eq!(table.in_flight(0), 0);
    for device in admitted {
        table.release(device);
    }
    assert_eq!(table.total_in_flight(), 0);
}

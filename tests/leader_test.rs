//! Leader election across several electors sharing one lease store.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use addon_controller::leader::{
    LeaderElectionConfig, LeaderElector, LeaderState, LeaseStore, MemoryLeaseStore, RenewOutcome,
};

fn fast_config(identity: &str) -> LeaderElectionConfig {
    LeaderElectionConfig {
        lease_duration: Duration::from_millis(400),
        renew_deadline: Duration::from_millis(200),
        retry_period: Duration::from_millis(20),
        ..LeaderElectionConfig::new("addon-test", identity)
    }
}

fn elector(store: &Arc<MemoryLeaseStore>, identity: &str) -> Arc<LeaderElector> {
    let store: Arc<dyn LeaseStore> = store.clone();
    Arc::new(LeaderElector::new(store, fast_config(identity)).unwrap())
}

/// Acquire, then renew until the lease is lost or `cancel` fires; repeat.
fn campaign(elector: Arc<LeaderElector>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while elector.acquire(&cancel).await {
            if elector.renew(&cancel).await == RenewOutcome::Cancelled {
                break;
            }
        }
        elector.release().await.unwrap();
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn at_most_one_leader_at_a_time() {
    let store = Arc::new(MemoryLeaseStore::new());
    let electors: Vec<_> = ["a", "b", "c"].iter().map(|id| elector(&store, id)).collect();
    let cancel = CancellationToken::new();
    let tasks: Vec<_> = electors
        .iter()
        .map(|e| campaign(e.clone(), cancel.clone()))
        .collect();

    let mut saw_leader = false;
    for _ in 0..100 {
        let leaders = electors.iter().filter(|e| e.is_leading()).count();
        assert!(leaders <= 1, "{leaders} electors leading at once");
        saw_leader |= leaders == 1;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(saw_leader);

    cancel.cancel();
    for task in tasks {
        task.await.unwrap();
    }
    for e in &electors {
        assert_eq!(e.state(), LeaderState::Standby);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn standby_takes_over_after_release() {
    let store = Arc::new(MemoryLeaseStore::new());
    let first = elector(&store, "first");
    let second = elector(&store, "second");

    let first_cancel = CancellationToken::new();
    let first_task = campaign(first.clone(), first_cancel.clone());
    tokio::time::timeout(Duration::from_secs(5), async {
        while !first.is_leading() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let second_cancel = CancellationToken::new();
    let second_task = campaign(second.clone(), second_cancel.clone());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!second.is_leading());

    first_cancel.cancel();
    first_task.await.unwrap();

    // Released, so the standby does not wait out the lease duration.
    tokio::time::timeout(Duration::from_millis(300), async {
        while !second.is_leading() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    let lease = store.snapshot("addon-test").unwrap();
    assert_eq!(lease.holder_identity, "second");
    assert_eq!(lease.lease_transitions, 1);

    second_cancel.cancel();
    second_task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn subscribers_see_state_changes() {
    let store = Arc::new(MemoryLeaseStore::new());
    let e = elector(&store, "watcher");
    let mut states = e.subscribe();
    let cancel = CancellationToken::new();

    assert!(e.acquire(&cancel).await);
    states
        .wait_for(|s| *s == LeaderState::Leading)
        .await
        .unwrap();

    e.release().await.unwrap();
    states
        .wait_for(|s| *s == LeaderState::Standby)
        .await
        .unwrap();
}

//! Integration tests for persistent disk migration under concurrency.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use rollout_director::plan::{DiskPolicy, InstancePlan};
use rollout_director::store::Store;
use rollout_director::GroupRollout;
use rollout_reconcile::ChangeKind;

use common::{plan, update_config, Env};

fn resize_plans(env: &Env, n: u32, from_mb: u64, to_mb: u64) -> Vec<InstancePlan> {
    (0..n)
        .map(|i| {
            let mut p = plan("db", i, &[ChangeKind::PersistentDisk]);
            p.desired.persistent_disk = DiskPolicy::sized(to_mb);
            env.seed(&p, Some(from_mb));
            p
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reader_always_sees_one_active_disk() {
    let dir = tempfile::tempdir().unwrap();
    let env = Env::with_store(Store::open(dir.path().join("director.db")).unwrap());
    let plans = resize_plans(&env, 6, 1024, 2048);
    let ids: Vec<_> = plans.iter().map(|p| p.instance).collect();

    let done = Arc::new(AtomicBool::new(false));
    let reader = {
        let store = env.store.clone();
        let done = done.clone();
        thread::spawn(move || {
            let mut observed = Vec::new();
            loop {
                for id in &ids {
                    observed.push(store.count_active_disks(id).unwrap());
                }
                if done.load(Ordering::SeqCst) {
                    break;
                }
            }
            observed
        })
    };

    let report = env
        .scheduler()
        .run(GroupRollout {
            name: "db".to_string(),
            update: update_config(1, 6),
            plans: plans.clone(),
            unneeded: vec![],
        })
        .await
        .unwrap();
    done.store(true, Ordering::SeqCst);
    let observed = reader.join().unwrap();

    assert_eq!(report.converged.len(), 6);
    assert!(!observed.is_empty());
    assert!(observed.iter().all(|&n| n == 1), "saw {observed:?}");

    for p in &plans {
        let active = env.store.active_disk(&p.instance).unwrap().unwrap();
        assert_eq!(active.size_mb, 2048);
        assert!(env.store.inactive_disks(&p.instance).unwrap().is_empty());
    }
    assert_eq!(env.store.list_orphan_disks().unwrap().len(), 6);
}

#[tokio::test]
async fn test_failed_migration_leaves_instance_usable() {
    let env = Env::new();
    let plans = resize_plans(&env, 1, 1024, 4096);
    let p = &plans[0];
    let old = env.store.active_disk(&p.instance).unwrap().unwrap();
    env.fleet.fail_migrate(p.instance);

    let err = env
        .updater()
        .update(p, &update_config(1, 1), true)
        .await
        .unwrap_err();

    assert!(!err.is_consistency());
    let active = env.store.active_disk(&p.instance).unwrap().unwrap();
    assert_eq!(active.cid, old.cid);
    assert_eq!(env.fleet.mounted_disks(&p.instance), vec![old.cid.clone()]);
    assert_eq!(env.store.count_active_disks(&p.instance).unwrap(), 1);

    // The half-migrated disk is orphaned, not left on the instance.
    let orphans = env.store.list_orphan_disks().unwrap();
    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0].size_mb, 4096);
    assert_eq!(env.fleet.attachment(&orphans[0].cid), None);
}

#[tokio::test]
async fn test_disk_out_of_sync_is_fatal() {
    let env = Env::new();
    let plans = resize_plans(&env, 1, 1024, 1024);
    let p = &plans[0];
    env.fleet.phantom_disk(p.instance);

    let err = env
        .updater()
        .update(p, &update_config(1, 1), false)
        .await
        .unwrap_err();

    assert!(err.is_consistency());
    assert_eq!(env.fleet.count("create_disk 1024"), 0);
    assert_eq!(env.fleet.count("apply"), 0);
}

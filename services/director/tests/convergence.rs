//! Integration tests for single-instance convergence.
//!
//! Each test drives `InstanceUpdater` against the simulated fleet and checks
//! which agent, cloud and collaborator calls were made.

mod common;

use rollout_director::agent::JobState;
use rollout_director::cloud::CloudError;
use rollout_director::plan::{DiskPolicy, TargetState};
use rollout_director::UpdateError;
use rollout_reconcile::ChangeKind;

use common::{plan, update_config, Env};

#[tokio::test]
async fn test_dns_only_change_touches_nothing_else() {
    let env = Env::new();
    let p = plan("web", 0, &[ChangeKind::Dns]);
    env.seed(&p, Some(1024));

    let report = env
        .updater()
        .update(&p, &update_config(1, 1), true)
        .await
        .unwrap();

    assert!(env.fleet.calls_for(&p.instance).is_empty());
    assert_eq!(env.fleet.count("upsert_record"), 2);
    assert_eq!(env.fleet.dns_flushes(), 1);
    assert_eq!(env.fleet.count("stop"), 0);
    assert_eq!(env.fleet.count("start"), 0);
    assert!(report.drain.is_none());

    let records = env.fleet.dns_records();
    assert_eq!(records.get("0.web.private.default.bosh").map(String::as_str), Some("10.0.1.20"));
    let by_id = format!("{}.web.private.default.bosh", p.instance.label());
    assert!(records.contains_key(&by_id));
}

#[tokio::test]
async fn test_resource_profile_change_recreates_with_disk() {
    let env = Env::new();
    let mut p = plan("db", 0, &[ChangeKind::ResourceProfile, ChangeKind::Network]);
    p.desired.resource_profile = "large".to_string();
    p.desired.persistent_disk = DiskPolicy::sized(1024);
    let old_vm = env.seed(&p, Some(1024));
    let disk = env.store.active_disk(&p.instance).unwrap().unwrap();

    let report = env
        .updater()
        .update(&p, &update_config(1, 1), false)
        .await
        .unwrap();

    assert!(report.vm_recreated);
    assert_eq!(env.fleet.count("update_network"), 0);
    assert_eq!(env.fleet.count("delete_vm"), 1);
    assert_eq!(env.fleet.count("create_vm"), 1);

    let calls = env.fleet.calls_for(&p.instance);
    let at = |op: &str| calls.iter().position(|c| c == op).unwrap();
    assert!(at("unmount_disk") < at("detach_disk"));
    assert!(at("detach_disk") < at("delete_vm"));
    assert!(at("create_vm") < at("attach_disk"));
    assert!(at("attach_disk") < at("mount_disk"));

    let new_vm = env.store.vm(&p.instance).unwrap().unwrap();
    assert_ne!(new_vm.cid, old_vm.cid);
    assert_eq!(env.fleet.attachment(&disk.cid), Some(new_vm.cid));
    assert_eq!(env.fleet.mounted_disks(&p.instance), vec![disk.cid]);
    assert_eq!(env.fleet.job_state(&p.instance), Some(JobState::Running));
}

#[tokio::test]
async fn test_attach_retried_after_recreate() {
    let env = Env::new();
    let mut p = plan("db", 0, &[ChangeKind::PersistentDisk]);
    p.desired.persistent_disk = DiskPolicy::sized(4096);
    env.seed(&p, Some(1024));
    let old = env.store.active_disk(&p.instance).unwrap().unwrap();
    env.fleet
        .fail_next_attach(CloudError::NoDiskSpace { ok_to_retry: true });

    let report = env
        .updater()
        .update(&p, &update_config(1, 1), false)
        .await
        .unwrap();

    assert_eq!(env.fleet.count("create_vm"), 1);
    // Failed attach, old disk onto the new VM, retried attach.
    assert_eq!(env.fleet.count("attach_disk"), 3);
    let requests = env.fleet.vm_requests();
    assert_eq!(requests[0].disks.len(), 2);
    assert_eq!(requests[0].disks[0], old.cid);
    assert_eq!(report.final_state, Some(JobState::Running));

    let active = env.store.active_disk(&p.instance).unwrap().unwrap();
    assert_eq!(active.size_mb, 4096);
    assert_ne!(active.cid, old.cid);
    assert_eq!(env.store.count_active_disks(&p.instance).unwrap(), 1);

    let orphans = env.store.list_orphan_disks().unwrap();
    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0].cid, old.cid);
}

#[tokio::test]
async fn test_trusted_certs_only_skips_restart() {
    let env = Env::new();
    let mut p = plan("web", 1, &[ChangeKind::TrustedCerts]);
    p.desired.trusted_certs = "-----BEGIN CERTIFICATE-----".to_string();
    env.seed(&p, None);

    env.updater()
        .update(&p, &update_config(1, 1), false)
        .await
        .unwrap();

    assert_eq!(
        env.fleet.calls_for(&p.instance),
        vec!["update_settings", "apply"]
    );
    assert!(env.store.vm(&p.instance).unwrap().unwrap().applied_spec.is_some());
}

#[tokio::test]
async fn test_full_update_call_order() {
    let env = Env::new();
    let p = plan("web", 0, &[ChangeKind::JobTemplates]);
    env.seed(&p, None);

    env.updater()
        .update(&p, &update_config(1, 1), true)
        .await
        .unwrap();

    assert_eq!(
        env.fleet.calls_for(&p.instance),
        vec![
            "prepare",
            "drain update",
            "stop",
            "list_disk",
            "apply",
            "clean_templates",
            "run_script pre-start",
            "start",
            "get_state",
            "run_script post-start",
        ]
    );
}

#[tokio::test]
async fn test_detach_deletes_vm_and_keeps_disk() {
    let env = Env::new();
    let mut p = plan("db", 0, &[ChangeKind::JobTemplates]);
    p.desired.target_state = TargetState::Detached;
    env.seed(&p, Some(1024));
    let disk = env.store.active_disk(&p.instance).unwrap().unwrap();

    env.updater()
        .update(&p, &update_config(1, 1), false)
        .await
        .unwrap();

    assert!(env.store.vm(&p.instance).unwrap().is_none());
    assert_eq!(env.fleet.vm_count(), 0);
    assert_eq!(env.fleet.count("drain shutdown"), 1);
    assert_eq!(env.fleet.count("snapshot"), 1);
    assert_eq!(env.store.active_disk(&p.instance).unwrap().map(|d| d.cid), Some(disk.cid));
    assert_eq!(
        env.store.instance(&p.instance).unwrap().unwrap().state,
        TargetState::Detached
    );
}

#[tokio::test]
async fn test_snapshot_failure_is_not_fatal() {
    let env = Env::new();
    let p = plan("db", 0, &[ChangeKind::JobTemplates]);
    env.seed(&p, Some(1024));
    env.fleet.fail_snapshots();

    let report = env
        .updater()
        .update(&p, &update_config(1, 1), false)
        .await
        .unwrap();

    assert_eq!(report.snapshot_failures, 1);
    assert_eq!(report.final_state, Some(JobState::Running));
}

#[tokio::test]
async fn test_legacy_agent_start_is_tolerated() {
    let env = Env::new();
    let p = plan("web", 0, &[ChangeKind::JobTemplates]);
    env.seed(&p, None);
    env.fleet.legacy_agents();

    let report = env
        .updater()
        .update(&p, &update_config(1, 1), false)
        .await
        .unwrap();

    assert_eq!(report.tolerated_start_failures, 1);
    assert_eq!(report.final_state, Some(JobState::Running));
}

#[tokio::test]
async fn test_job_that_never_runs_is_a_mismatch() {
    let env = Env::new();
    let p = plan("web", 0, &[ChangeKind::JobTemplates]);
    env.seed(&p, None);
    env.fleet.never_running(p.instance);

    let err = env
        .updater()
        .update(&p, &update_config(1, 1), false)
        .await
        .unwrap_err();

    assert!(err.is_state_mismatch());
    assert!(matches!(
        err,
        UpdateError::JobNotRunning {
            observed: JobState::Failing,
            ..
        }
    ));
    // 1000..3000 with a 1000ms step: every poll of the schedule was used.
    assert_eq!(env.fleet.count("get_state"), 3);
    assert_eq!(env.fleet.count("run_script post-start"), 0);
}

#[tokio::test]
async fn test_prepare_failure_aborts_before_stop() {
    let env = Env::new();
    let p = plan("web", 0, &[ChangeKind::JobTemplates]);
    env.seed(&p, None);
    env.fleet.fail_prepare(p.instance);

    let err = env
        .updater()
        .update(&p, &update_config(1, 1), false)
        .await
        .unwrap_err();

    assert!(matches!(err, UpdateError::Agent(_)));
    assert_eq!(env.fleet.calls_for(&p.instance), vec!["prepare"]);
    assert_eq!(env.fleet.job_state(&p.instance), Some(JobState::Running));
}

#[tokio::test]
async fn test_compilation_instance_is_not_drained() {
    let env = Env::new();
    let mut p = plan("compilation", 0, &[ChangeKind::JobTemplates]);
    p.desired.compilation = true;
    env.seed(&p, None);

    let report = env
        .updater()
        .update(&p, &update_config(1, 1), false)
        .await
        .unwrap();

    assert!(report.drain.is_none());
    assert_eq!(env.fleet.count("stop"), 0);
}

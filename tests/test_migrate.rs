use simon::core::cluster::ResourceTypes;
use simon::core::common::{
    OwnerReference, LABEL_MASTER_ROLE, TAINT_EFFECT_NO_SCHEDULE,
};
use simon::core::node::Taint;
use simon::migrate::{DownScaler, MigrationResult, MigrationStatus};
use simon::test_util::*;

fn evacuation_cluster() -> ResourceTypes {
    let mut cluster = ResourceTypes::default();
    cluster.nodes.push(make_fake_node(
        "master-1",
        "8",
        "16Gi",
        vec![
            with_node_labels(&[(LABEL_MASTER_ROLE, "")]),
            with_node_taints(vec![Taint {
                key: LABEL_MASTER_ROLE.to_string(),
                value: String::new(),
                effect: TAINT_EFFECT_NO_SCHEDULE.to_string(),
            }]),
        ],
    ));
    for name in ["worker-1", "worker-2", "worker-3"] {
        cluster
            .nodes
            .push(make_fake_node(name, "8", "16Gi", vec![]));
    }

    // worker-1 is nearly idle, the others run at 50% CPU
    cluster.pods.push(make_fake_pod(
        "idle-app",
        "default",
        "800m",
        "1Gi",
        vec![with_pod_node_name("worker-1")],
    ));
    let mut daemon_pod = make_fake_pod(
        "proxy-worker-1",
        "kube-system",
        "100m",
        "64Mi",
        vec![with_pod_node_name("worker-1")],
    );
    daemon_pod
        .metadata
        .owner_references
        .push(OwnerReference::new("DaemonSet", "proxy"));
    cluster.pods.push(daemon_pod);

    cluster.pods.push(make_fake_pod(
        "busy-app-2",
        "default",
        "4000m",
        "2Gi",
        vec![with_pod_node_name("worker-2")],
    ));
    cluster.pods.push(make_fake_pod(
        "busy-app-3",
        "default",
        "4000m",
        "2Gi",
        vec![with_pod_node_name("worker-3")],
    ));
    cluster
}

fn status_of<'a>(result: &'a MigrationResult, node: &str) -> &'a MigrationStatus {
    result
        .nodes_migration_status
        .iter()
        .find(|s| s.node_name == node)
        .unwrap_or_else(|| panic!("no status for {}", node))
}

#[test]
fn test_evacuation_happy_path() {
    let _ = env_logger::try_init();

    let cluster = evacuation_cluster();
    let down_scaler = DownScaler::new(vec![], vec![], 100);
    let result = down_scaler.migrate(&cluster).unwrap();

    let master = status_of(&result, "master-1");
    assert!(!master.is_removable);
    assert!(master.reason.contains("Not a worker"));

    // the idle worker drains; its daemon-set pod is not part of the plan
    let idle = status_of(&result, "worker-1");
    assert!(idle.is_removable, "reason: {}", idle.reason);
    assert_eq!(1, idle.pod_plans.len());
    let plan = &idle.pod_plans[0];
    assert_eq!("idle-app", plan.pod_name);
    assert_eq!("worker-1", plan.from_node);
    assert!(
        plan.to_node == "worker-2" || plan.to_node == "worker-3",
        "unexpected target {}",
        plan.to_node
    );

    // the busy workers cannot hand off 4 cores once worker-1 is gone
    for busy in ["worker-2", "worker-3"] {
        let status = status_of(&result, busy);
        assert!(!status.is_removable, "{} should be pinned", busy);
        assert!(!status.reason.is_empty());
    }
}

#[test]
fn test_evacuation_blocked_by_label_filter() {
    let _ = env_logger::try_init();

    let mut cluster = evacuation_cluster();
    // pin the idle worker through a labeled pod
    for pod in cluster.pods.iter_mut() {
        if pod.metadata.name == "idle-app" {
            pod.metadata.set_label("app", "critical");
        }
    }
    let down_scaler = DownScaler::new(vec![], vec!["app=critical".to_string()], 100);
    let result = down_scaler.migrate(&cluster).unwrap();

    let pinned = status_of(&result, "worker-1");
    assert!(!pinned.is_removable);
    assert!(
        pinned.reason.contains("app=critical"),
        "reason: {}",
        pinned.reason
    );
    assert!(pinned.reason.contains("idle-app"));
}

#[test]
fn test_explicit_remove_list_limits_the_search() {
    let _ = env_logger::try_init();

    let cluster = evacuation_cluster();
    let down_scaler = DownScaler::new(vec!["worker-2".to_string()], vec![], 100);
    let result = down_scaler.migrate(&cluster).unwrap();

    assert_eq!(1, result.nodes_migration_status.len());
    let status = &result.nodes_migration_status[0];
    assert_eq!("worker-2", status.node_name);
    // 4 cores spill over to worker-1 (7.2 free) or worker-3 (4.0 free)
    assert!(status.is_removable, "reason: {}", status.reason);
    assert_eq!(1, status.pod_plans.len());
    assert_eq!("busy-app-2", status.pod_plans[0].pod_name);
}

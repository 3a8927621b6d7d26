use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tessera_events::{event_types, MemoryEventSink};
use tessera_id::{ComponentKind, PassId};
use tessera_operator::controller::ClusterController;
use tessera_operator::driver::{ClusterStore, FileReplicaSetDriver, ReplicaSetDriver};
use tessera_operator::member::{component_for, ClusterStatus, MemberError, MemberManager, Phase};
use tessera_operator::replica_set::{ReplicaSet, DELETE_SLOTS_ANNOTATION};
use tessera_operator::topology::Topology;
use tessera_operator::worker::{ReconcileWorker, TickStats, WorkerConfig};
use tessera_reconcile::{Backoff, Classify, ConvergenceStatus, Severity};
use tessera_testing::fixtures::{placement_member, revision};
use tessera_testing::{identity, template, topology, FakeHealthClient, ReplicaSetBuilder};

const PLACEMENT: ComponentKind = ComponentKind::Placement;

struct Env {
    _dir: TempDir,
    driver: Arc<FileReplicaSetDriver>,
    client: Arc<FakeHealthClient>,
    sink: Arc<MemoryEventSink>,
    controller: Arc<ClusterController>,
}

impl Env {
    async fn new(topology: &Topology) -> Self {
        let dir = TempDir::new().unwrap();
        let driver = Arc::new(FileReplicaSetDriver::new(dir.path()));
        driver.save_topology(topology).await.unwrap();

        let client = Arc::new(
            FakeHealthClient::new()
                .with_members((0..3).map(|o| placement_member(o, true)).collect())
                .with_leader("basic-placement-0"),
        );
        let sink = Arc::new(MemoryEventSink::new());
        let controller = Arc::new(ClusterController::new(
            driver.clone(),
            client.clone(),
            sink.clone(),
            Duration::from_secs(1),
        ));

        Self {
            _dir: dir,
            driver,
            client,
            sink,
            controller,
        }
    }

    /// Seed a placement replica set whose pods all run `version`.
    async fn seed(&self, replicas: u32, version: &str) {
        let rev = revision(PLACEMENT, version);
        let set = ReplicaSetBuilder::new(PLACEMENT, replicas)
            .template(template(version))
            .rolling(&rev, &rev)
            .build();
        self.driver.apply(&identity(), PLACEMENT, &set).await.unwrap();
    }

    async fn observe(&self) -> ReplicaSet {
        self.driver
            .observe(&identity(), PLACEMENT)
            .await
            .unwrap()
            .unwrap()
    }

    /// Stand in for the replica set's own rollout: restart every stale pod
    /// at or above the partition.
    async fn roll_pods(&self) {
        let mut set = self.observe().await;
        let update = set.status.as_ref().unwrap().update_revision.clone();
        let partition = set.partition().unwrap_or(0);
        for (ordinal, pod) in set.pods.iter_mut() {
            if *ordinal >= partition {
                pod.revision = Some(update.clone());
            }
        }
        self.driver.apply(&identity(), PLACEMENT, &set).await.unwrap();
    }

    /// Stand in for the replica set controller creating and removing pods.
    async fn sync_pods(&self) {
        let mut set = self.observe().await;
        let current = set.status.as_ref().unwrap().current_revision.clone();
        let live = set.live_ordinals().unwrap();
        set.pods.retain(|ordinal, _| live.contains(ordinal));
        for ordinal in live {
            set.pods.entry(ordinal).or_insert_with(|| {
                let mut pods = ReplicaSetBuilder::new(PLACEMENT, ordinal + 1)
                    .rolling(&current, &current)
                    .build()
                    .pods;
                pods.remove(&ordinal).unwrap()
            });
        }
        self.driver.apply(&identity(), PLACEMENT, &set).await.unwrap();
    }
}

async fn pass(
    env: &Env,
    topology: &Topology,
    statuses: &mut BTreeMap<ComponentKind, ClusterStatus>,
) -> Result<ConvergenceStatus, MemberError> {
    let report = env
        .controller
        .reconcile(PassId::new(), topology, statuses)
        .await?;
    Ok(report.components[&PLACEMENT])
}

#[tokio::test]
async fn steady_cluster_converges() {
    let topology = topology(PLACEMENT, 3, "v1");
    let env = Env::new(&topology).await;
    env.seed(3, "v1").await;
    let before = env.observe().await;
    let mut statuses = BTreeMap::new();

    let convergence = pass(&env, &topology, &mut statuses).await.unwrap();

    assert_eq!(convergence, ConvergenceStatus::Converged);
    assert_eq!(env.observe().await, before);
    let status = &statuses[&PLACEMENT];
    assert!(status.synced);
    assert_eq!(status.phase, Phase::Normal);
    assert!(status.is_leader("basic-placement-0"));
}

#[tokio::test]
async fn missing_replica_set_is_unknown() {
    let topology = topology(PLACEMENT, 3, "v1");
    let env = Env::new(&topology).await;
    let mut statuses = BTreeMap::new();

    let convergence = pass(&env, &topology, &mut statuses).await.unwrap();

    assert_eq!(convergence, ConvergenceStatus::Unknown);
    assert!(statuses.is_empty());
}

#[tokio::test]
async fn scale_out_one_replica_per_pass() {
    let topology = topology(PLACEMENT, 5, "v1");
    let env = Env::new(&topology).await;
    env.seed(3, "v1").await;
    let mut statuses = BTreeMap::new();

    let mut replicas = Vec::new();
    for _ in 0..4 {
        pass(&env, &topology, &mut statuses).await.unwrap();
        env.sync_pods().await;
        replicas.push(env.observe().await.replicas);
    }

    assert_eq!(replicas, vec![4, 5, 5, 5]);
    assert_eq!(
        pass(&env, &topology, &mut statuses).await.unwrap(),
        ConvergenceStatus::Converged
    );
    assert_eq!(
        env.sink.event_types(),
        vec![event_types::MEMBER_SCALED_OUT, event_types::MEMBER_SCALED_OUT]
    );
}

#[tokio::test]
async fn rolling_upgrade_walks_down_and_hands_off_leadership() {
    let topology = topology(PLACEMENT, 3, "v2");
    let env = Env::new(&topology).await;
    env.seed(3, "v1").await;
    let mut statuses = BTreeMap::new();

    let mut partitions = Vec::new();
    let mut transfers = 0;
    for _ in 0..10 {
        match pass(&env, &topology, &mut statuses).await {
            Ok(ConvergenceStatus::Converged) => break,
            Ok(_) => {}
            Err(MemberError::LeaderTransferring { .. }) => transfers += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
        partitions.push(env.observe().await.partition());
        env.roll_pods().await;
    }

    let set = env.observe().await;
    assert_eq!(set.template, template("v2"));
    assert!(set
        .pods
        .values()
        .all(|pod| pod.revision.as_deref() == Some(revision(PLACEMENT, "v2").as_str())));
    assert_eq!(transfers, 1);
    assert_eq!(env.client.transfers(), vec!["basic-placement-2".to_string()]);

    // Held back, then one ordinal at a time from the top.
    partitions.dedup();
    assert_eq!(partitions, vec![Some(3), Some(2), Some(1), Some(0)]);
    assert_eq!(statuses[&PLACEMENT].phase, Phase::Normal);
}

#[tokio::test]
async fn injected_predicate_keeps_the_cluster_upgrading() {
    let topology = topology(PLACEMENT, 3, "v1");
    let env = Env::new(&topology).await;
    env.seed(3, "v1").await;
    let manager = MemberManager::new(component_for(
        PLACEMENT,
        env.client.clone(),
        Duration::from_secs(1),
    ))
    .with_predicate(|_| Ok(true));
    let controller = ClusterController::with_managers(
        env.driver.clone(),
        env.sink.clone(),
        BTreeMap::from([(PLACEMENT, manager)]),
    );
    let mut statuses = BTreeMap::new();

    let report = controller
        .reconcile(PassId::new(), &topology, &mut statuses)
        .await
        .unwrap();

    assert_eq!(report.components[&PLACEMENT], ConvergenceStatus::Converging);
    assert!(!report.converged());
    assert_eq!(statuses[&PLACEMENT].phase, Phase::Upgrading);
}

#[tokio::test]
async fn worker_tick_persists_status() {
    let topology = topology(PLACEMENT, 3, "v1");
    let env = Env::new(&topology).await;
    env.seed(3, "v1").await;
    let worker = ReconcileWorker::new(env.controller.clone(), env.driver.clone(), WorkerConfig::default());

    let stats = worker.tick().await.unwrap();

    assert_eq!(
        stats,
        TickStats {
            clusters_reconciled: 1,
            clusters_converged: 1,
            ..TickStats::default()
        }
    );
    let saved = env.driver.load_status(&identity()).await.unwrap();
    assert!(saved[&PLACEMENT].synced);
}

#[tokio::test]
async fn worker_requeues_and_backs_off() {
    let topology = topology(PLACEMENT, 3, "v2");
    let env = Env::new(&topology).await;
    env.seed(3, "v1").await;
    env.client.update(|s| s.leader = Some("basic-placement-2".to_string()));
    let config = WorkerConfig {
        backoff: Backoff {
            base: Duration::from_secs(60),
            max: Duration::from_secs(60),
        },
        ..WorkerConfig::default()
    };
    let worker = ReconcileWorker::new(env.controller.clone(), env.driver.clone(), config);

    // Hold the rollout back, then move the partition onto the leader.
    worker.tick().await.unwrap();
    let stats = worker.tick().await.unwrap();
    assert_eq!(stats.clusters_requeued, 1);

    let stats = worker.tick().await.unwrap();
    assert_eq!(stats.clusters_backing_off, 1);
    assert_eq!(stats.clusters_reconciled, 0);
}

#[tokio::test]
async fn worker_requeues_failed_status_queries() {
    let topology = topology(PLACEMENT, 3, "v2");
    let env = Env::new(&topology).await;
    env.seed(3, "v1").await;
    env.client.update(|s| {
        s.failing.insert("members_health");
    });
    let worker = ReconcileWorker::new(env.controller.clone(), env.driver.clone(), WorkerConfig::default());

    let stats = worker.tick().await.unwrap();

    assert_eq!(stats.clusters_requeued, 1);
    assert_eq!(stats.clusters_failed, 0);
    let saved = env.driver.load_status(&identity()).await.unwrap();
    assert!(!saved[&PLACEMENT].synced);
    assert_eq!(env.observe().await.template, template("v1"));
}

#[tokio::test]
async fn failed_status_query_stops_the_pass_as_retryable() {
    let topology = topology(PLACEMENT, 3, "v1");
    let env = Env::new(&topology).await;
    env.seed(3, "v1").await;
    env.client.update(|s| {
        s.failing.insert("members_health");
    });
    let mut statuses = BTreeMap::new();

    let err = pass(&env, &topology, &mut statuses).await.unwrap_err();

    assert!(matches!(err, MemberError::Query { .. }));
    assert_eq!(err.severity(), Severity::Retryable);
    assert!(!statuses[&PLACEMENT].synced);
}

#[tokio::test]
async fn worker_counts_fatal_failures() {
    let topology = topology(PLACEMENT, 3, "v1");
    let env = Env::new(&topology).await;
    env.seed(3, "v1").await;
    let mut set = env.observe().await;
    set.annotations
        .insert(DELETE_SLOTS_ANNOTATION.to_string(), "1,2".to_string());
    env.driver.apply(&identity(), PLACEMENT, &set).await.unwrap();
    let worker = ReconcileWorker::new(env.controller.clone(), env.driver.clone(), WorkerConfig::default());

    let stats = worker.tick().await.unwrap();

    assert_eq!(stats.clusters_failed, 1);
    assert_eq!(stats.clusters_requeued, 0);
    let saved = env.driver.load_status(&identity()).await.unwrap();
    assert!(saved[&PLACEMENT].synced);
}

#[tokio::test]
async fn topologies_are_discovered_from_the_state_dir() {
    let topology = topology(PLACEMENT, 3, "v1");
    let env = Env::new(&topology).await;

    let found = env.driver.topologies().await.unwrap();

    assert_eq!(found, vec![topology]);
}

#[tokio::test]
async fn worker_stops_on_shutdown() {
    let topology = topology(PLACEMENT, 3, "v1");
    let env = Env::new(&topology).await;
    env.seed(3, "v1").await;
    let worker = Arc::new(ReconcileWorker::new(
        env.controller.clone(),
        env.driver.clone(),
        WorkerConfig {
            interval: Duration::from_millis(10),
            ..WorkerConfig::default()
        },
    ));
    let (tx, rx) = tokio::sync::watch::channel(false);

    let handle = tokio::spawn({
        let worker = worker.clone();
        async move { worker.run(rx).await }
    });
    // The first tick fires immediately and persists status.
    tokio::time::sleep(Duration::from_millis(50)).await;
    tx.send(true).unwrap();

    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    assert!(env.driver.load_status(&identity()).await.unwrap()[&PLACEMENT].synced);
}

use std::sync::Arc;

use anyhow::Result;
use common::{
    ApiResource, DeleteOptions, DeletePropagationPolicy, ObjectMeta, OwnerReference,
    PartialObjectMeta,
};
use rkgc::{
    api::memory::MemoryStore, controllers::GarbageCollector,
    protocol::config::GarbageCollectorConfig,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, sleep};
use uuid::Uuid;

const TIMEOUT: Duration = Duration::from_secs(10);

struct Running {
    store: MemoryStore,
    gc: Arc<GarbageCollector>,
    stop: watch::Sender<bool>,
    handle: JoinHandle<Result<()>>,
}

impl Running {
    async fn shutdown(self) -> Result<()> {
        self.stop.send(true)?;
        tokio::time::timeout(TIMEOUT, self.handle).await???;
        Ok(())
    }
}

fn resources() -> Vec<ApiResource> {
    vec![
        ApiResource::new("", "v1", "Pod", "pods", true),
        ApiResource::new("apps", "v1", "ReplicaSet", "replicasets", true),
        ApiResource::new("apps", "v1", "Deployment", "deployments", true),
        ApiResource::new("", "v1", "Event", "events", true),
    ]
}

async fn start(store: MemoryStore) -> Result<Running> {
    let config = GarbageCollectorConfig {
        base_retry_delay: Duration::from_millis(5),
        max_retry_delay: Duration::from_millis(200),
        ..Default::default()
    };
    let gc = Arc::new(GarbageCollector::new(&store, config).await?);
    let (stop, stop_rx) = watch::channel(false);
    let handle = tokio::spawn({
        let gc = gc.clone();
        async move { gc.run(2, stop_rx).await }
    });
    Ok(Running {
        store,
        gc,
        stop,
        handle,
    })
}

fn api_version(kind: &str) -> &'static str {
    match kind {
        "Pod" | "Event" => "v1",
        _ => "apps/v1",
    }
}

fn object(kind: &str, name: &str, owners: Vec<OwnerReference>) -> PartialObjectMeta {
    PartialObjectMeta::new(
        api_version(kind),
        kind,
        ObjectMeta {
            name: name.to_string(),
            namespace: "default".to_string(),
            owner_references: (!owners.is_empty()).then_some(owners),
            ..Default::default()
        },
    )
}

fn owned_by(owner: &PartialObjectMeta, block: bool) -> OwnerReference {
    OwnerReference {
        api_version: owner.api_version.clone(),
        kind: owner.kind.clone(),
        name: owner.metadata.name.clone(),
        uid: owner.uid(),
        controller: true,
        block_owner_deletion: Some(block),
    }
}

async fn get(store: &MemoryStore, kind: &str, name: &str) -> Option<PartialObjectMeta> {
    store
        .get_object(api_version(kind), kind, "default", name)
        .await
}

async fn delete(
    store: &MemoryStore,
    kind: &str,
    name: &str,
    policy: DeletePropagationPolicy,
) -> Result<()> {
    store
        .delete_object(
            api_version(kind),
            kind,
            "default",
            name,
            &DeleteOptions::with_policy(policy),
        )
        .await?;
    Ok(())
}

async fn wait_until_gone(store: &MemoryStore, kind: &str, name: &str) -> Result<()> {
    let start = Instant::now();
    loop {
        if get(store, kind, name).await.is_none() {
            return Ok(());
        }
        if Instant::now().duration_since(start) > TIMEOUT {
            anyhow::bail!("timeout waiting for {kind} {name} to be deleted");
        }
        sleep(Duration::from_millis(20)).await;
    }
}

async fn wait_for_owner_count(
    store: &MemoryStore,
    kind: &str,
    name: &str,
    expected: usize,
) -> Result<PartialObjectMeta> {
    let start = Instant::now();
    loop {
        if let Some(obj) = get(store, kind, name).await
            && obj.metadata.owner_references().len() == expected
        {
            return Ok(obj);
        }
        if Instant::now().duration_since(start) > TIMEOUT {
            anyhow::bail!("timeout waiting for {kind} {name} to have {expected} owners");
        }
        sleep(Duration::from_millis(20)).await;
    }
}

async fn wait_for_graph(gc: &GarbageCollector, uids: &[Uuid], present: bool) -> Result<()> {
    let start = Instant::now();
    loop {
        let all = {
            let mut all = true;
            for uid in uids {
                if gc.graph_has_uid(&[*uid]).await != present {
                    all = false;
                }
            }
            all
        };
        if all {
            return Ok(());
        }
        if Instant::now().duration_since(start) > TIMEOUT {
            anyhow::bail!("timeout waiting for graph membership {present} of {uids:?}");
        }
        sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_background_deletion_cascades() -> Result<()> {
    let store = MemoryStore::new(resources());
    let deployment = store.create(object("Deployment", "web", vec![])).await?;
    let rs = store
        .create(object("ReplicaSet", "web-1", vec![owned_by(&deployment, true)]))
        .await?;
    let pod_a = store
        .create(object("Pod", "web-1-a", vec![owned_by(&rs, true)]))
        .await?;
    let pod_b = store
        .create(object("Pod", "web-1-b", vec![owned_by(&rs, false)]))
        .await?;
    let running = start(store.clone()).await?;
    wait_for_graph(
        &running.gc,
        &[deployment.uid(), rs.uid(), pod_a.uid(), pod_b.uid()],
        true,
    )
    .await?;

    delete(&store, "Deployment", "web", DeletePropagationPolicy::Background).await?;

    wait_until_gone(&store, "ReplicaSet", "web-1").await?;
    wait_until_gone(&store, "Pod", "web-1-a").await?;
    wait_until_gone(&store, "Pod", "web-1-b").await?;
    wait_for_graph(&running.gc, &[deployment.uid(), rs.uid(), pod_a.uid()], false).await?;
    running.shutdown().await
}

#[tokio::test]
async fn test_foreground_deletion_removes_dependents_first() -> Result<()> {
    let store = MemoryStore::new(resources());
    let rs = store.create(object("ReplicaSet", "rs1", vec![])).await?;
    for name in ["rs1-a", "rs1-b"] {
        store
            .create(object("Pod", name, vec![owned_by(&rs, true)]))
            .await?;
    }
    let running = start(store.clone()).await?;

    delete(&store, "ReplicaSet", "rs1", DeletePropagationPolicy::Foreground).await?;
    let owner = get(&store, "ReplicaSet", "rs1").await;
    assert!(owner.is_some_and(|o| o.metadata.is_being_deleted()));

    let start = Instant::now();
    loop {
        let owner_left = get(&store, "ReplicaSet", "rs1").await.is_some();
        let pods_left = get(&store, "Pod", "rs1-a").await.is_some()
            || get(&store, "Pod", "rs1-b").await.is_some();
        if pods_left {
            assert!(owner_left, "owner removed while blocking dependents remain");
        } else if !owner_left {
            break;
        }
        if Instant::now().duration_since(start) > TIMEOUT {
            anyhow::bail!("timeout waiting for foreground deletion of rs1");
        }
        sleep(Duration::from_millis(5)).await;
    }
    running.shutdown().await
}

#[tokio::test]
async fn test_mutually_blocking_foreground_deletions_terminate() -> Result<()> {
    let store = MemoryStore::new(resources());
    let a = store.create(object("ReplicaSet", "cycle-a", vec![])).await?;
    let b = store
        .create(object("ReplicaSet", "cycle-b", vec![owned_by(&a, true)]))
        .await?;
    let mut a = a;
    a.metadata.owner_references = Some(vec![owned_by(&b, true)]);
    store.update(a.clone()).await?;
    let running = start(store.clone()).await?;
    wait_for_graph(&running.gc, &[a.uid(), b.uid()], true).await?;

    delete(&store, "ReplicaSet", "cycle-a", DeletePropagationPolicy::Foreground).await?;
    delete(&store, "ReplicaSet", "cycle-b", DeletePropagationPolicy::Foreground).await?;

    wait_until_gone(&store, "ReplicaSet", "cycle-a").await?;
    wait_until_gone(&store, "ReplicaSet", "cycle-b").await?;
    running.shutdown().await
}

#[tokio::test]
async fn test_owner_of_unmonitored_kind_is_resolved() -> Result<()> {
    let store = MemoryStore::new(resources());
    let missing_event = OwnerReference {
        api_version: "v1".to_string(),
        kind: "Event".to_string(),
        name: "gone".to_string(),
        uid: Uuid::new_v4(),
        controller: false,
        block_owner_deletion: None,
    };
    store
        .create(object("Pod", "owned-by-event", vec![missing_event]))
        .await?;
    let event = store.create(object("Event", "present", vec![])).await?;
    store
        .create(object("Pod", "owned-by-live-event", vec![owned_by(&event, false)]))
        .await?;
    let running = start(store.clone()).await?;

    wait_until_gone(&store, "Pod", "owned-by-event").await?;
    assert!(get(&store, "Pod", "owned-by-live-event").await.is_some());
    running.shutdown().await
}

#[tokio::test]
async fn test_orphan_deletion_keeps_dependents() -> Result<()> {
    let store = MemoryStore::new(resources());
    let rs = store.create(object("ReplicaSet", "rs1", vec![])).await?;
    let other = store.create(object("ReplicaSet", "rs2", vec![])).await?;
    store
        .create(object("Pod", "p1", vec![owned_by(&rs, true)]))
        .await?;
    store
        .create(object("Pod", "p2", vec![owned_by(&rs, false), owned_by(&other, false)]))
        .await?;
    let running = start(store.clone()).await?;

    delete(&store, "ReplicaSet", "rs1", DeletePropagationPolicy::Orphan).await?;

    wait_until_gone(&store, "ReplicaSet", "rs1").await?;
    let p1 = wait_for_owner_count(&store, "Pod", "p1", 0).await?;
    assert!(p1.metadata.owner_references().is_empty());
    let p2 = wait_for_owner_count(&store, "Pod", "p2", 1).await?;
    assert_eq!(p2.metadata.owner_references()[0].uid, other.uid());
    running.shutdown().await
}

#[tokio::test]
async fn test_dangling_and_solid_owners() -> Result<()> {
    let store = MemoryStore::new(resources());
    let rs = store.create(object("ReplicaSet", "rs1", vec![])).await?;
    let ghost = OwnerReference {
        api_version: "apps/v1".to_string(),
        kind: "ReplicaSet".to_string(),
        name: "never-existed".to_string(),
        uid: Uuid::new_v4(),
        controller: false,
        block_owner_deletion: None,
    };
    store
        .create(object("Pod", "kept", vec![owned_by(&rs, true), ghost.clone()]))
        .await?;
    store.create(object("Pod", "collected", vec![ghost])).await?;
    store.create(object("Pod", "standalone", vec![])).await?;
    let running = start(store.clone()).await?;

    wait_until_gone(&store, "Pod", "collected").await?;
    let kept = wait_for_owner_count(&store, "Pod", "kept", 1).await?;
    assert_eq!(kept.metadata.owner_references()[0].uid, rs.uid());
    assert!(get(&store, "Pod", "standalone").await.is_some());
    running.shutdown().await
}

#[tokio::test]
async fn test_owner_recreated_with_new_uid() -> Result<()> {
    let store = MemoryStore::new(resources());
    let old = store.create(object("ReplicaSet", "rs1", vec![])).await?;
    let running = start(store.clone()).await?;

    // Replace the owner behind the collector's back, then point a pod at the
    // old incarnation.
    delete(&store, "ReplicaSet", "rs1", DeletePropagationPolicy::Background).await?;
    let new = store.create(object("ReplicaSet", "rs1", vec![])).await?;
    assert_ne!(old.uid(), new.uid());
    store
        .create(object("Pod", "stale", vec![owned_by(&old, true)]))
        .await?;

    wait_until_gone(&store, "Pod", "stale").await?;
    assert!(get(&store, "ReplicaSet", "rs1").await.is_some());
    running.shutdown().await
}

#[tokio::test]
async fn test_transient_failures_are_retried() -> Result<()> {
    let store = MemoryStore::new(resources());
    let rs = store.create(object("ReplicaSet", "rs1", vec![])).await?;
    store
        .create(object("Pod", "p1", vec![owned_by(&rs, true)]))
        .await?;
    let running = start(store.clone()).await?;
    wait_for_graph(&running.gc, &[rs.uid()], true).await?;

    delete(&store, "ReplicaSet", "rs1", DeletePropagationPolicy::Background).await?;
    store.fail_next_writes(3);

    wait_until_gone(&store, "Pod", "p1").await?;
    running.shutdown().await
}

#[tokio::test]
async fn test_ignored_resources_are_not_monitored() -> Result<()> {
    let store = MemoryStore::new(resources());
    let rs = store.create(object("ReplicaSet", "rs1", vec![])).await?;
    let event = store
        .create(object("Event", "e1", vec![owned_by(&rs, false)]))
        .await?;
    let running = start(store.clone()).await?;
    wait_for_graph(&running.gc, &[rs.uid()], true).await?;

    delete(&store, "ReplicaSet", "rs1", DeletePropagationPolicy::Background).await?;
    wait_for_graph(&running.gc, &[rs.uid()], false).await?;
    sleep(Duration::from_millis(100)).await;

    assert!(!running.gc.graph_has_uid(&[event.uid()]).await);
    assert!(get(&store, "Event", "e1").await.is_some());
    running.shutdown().await
}

#[tokio::test]
async fn test_run_twice_is_rejected() -> Result<()> {
    let store = MemoryStore::new(resources());
    let gc = GarbageCollector::new(&store, GarbageCollectorConfig::default()).await?;

    let (_stopped, rx) = watch::channel(true);
    tokio::time::timeout(TIMEOUT, gc.run(1, rx)).await??;

    let (_tx, rx) = watch::channel(false);
    assert!(gc.run(1, rx).await.is_err());
    Ok(())
}

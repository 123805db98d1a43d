//! Integration tests for image acquisition and registry back-off.
//!
//! These tests drive the image puller the way a sync loop would: repeated
//! passes on a fake clock, against the mock runtime, with events captured
//! by the fake recorder.

use std::sync::Arc;
use std::time::Duration;

use podlet_backoff::{BackoffConfig, Clock, FakeClock};
use podlet_node_agent::events::reason;
use podlet_node_agent::image::{ImagePullError, ImagePuller, ImagePullerConfig, PullOutcome};
use podlet_node_agent::pod::{Container, Pod, PodMeta, PodSpec, PullPolicy, PullSecret};
use podlet_node_agent::runtime::MockRuntime;
use podlet_node_agent::FakeRecorder;

const SECOND: Duration = Duration::from_secs(1);
const FLOOR: Duration = Duration::from_secs(10);
const CEILING: Duration = Duration::from_secs(300);

struct Node {
    puller: Arc<ImagePuller>,
    runtime: Arc<MockRuntime>,
    recorder: Arc<FakeRecorder>,
    clock: FakeClock,
}

fn node(runtime: MockRuntime) -> Node {
    let runtime = Arc::new(runtime);
    let recorder = Arc::new(FakeRecorder::new());
    let clock = FakeClock::new();
    let puller = ImagePuller::with_clock(
        ImagePullerConfig {
            backoff: BackoffConfig::new(FLOOR, CEILING),
        },
        runtime.clone(),
        recorder.clone(),
        Arc::new(clock.clone()),
    )
    .unwrap();

    Node {
        puller: Arc::new(puller),
        runtime,
        recorder,
        clock,
    }
}

fn pod_for(container: &Container) -> Pod {
    Pod {
        metadata: PodMeta {
            name: "pod-back-off-image".to_string(),
            namespace: "e2e".to_string(),
            uid: "12345678".to_string(),
        },
        spec: PodSpec {
            containers: vec![container.clone()],
            image_pull_secrets: vec![],
        },
    }
}

/// Run one pass per second until `attempts` pulls reached the runtime, and
/// return the gaps between consecutive attempts.
async fn attempt_gaps(node: &Node, container: &Container, attempts: usize) -> Vec<Duration> {
    let pod = pod_for(container);
    let mut attempt_times = Vec::new();

    while attempt_times.len() < attempts {
        let before = node.runtime.pull_count(&container.image);
        let _ = node.puller.pull(&pod, container, &[]).await;
        if node.runtime.pull_count(&container.image) > before {
            attempt_times.push(node.clock.now());
        }
        node.clock.advance(SECOND);
    }

    attempt_times.windows(2).map(|w| w[1] - w[0]).collect()
}

#[tokio::test]
async fn test_always_policy_pulls_missing_image_end_to_end() {
    let node = node(MockRuntime::new());
    let container = Container::new("back-off", "gcr.io/google_containers/busybox", PullPolicy::Always);
    let secrets = vec![PullSecret {
        name: "regcred".to_string(),
        registry: "gcr.io".to_string(),
        username: "bot".to_string(),
        password: "secret".to_string(),
    }];

    let outcome = node
        .puller
        .pull(&pod_for(&container), &container, &secrets)
        .await
        .unwrap();

    assert_eq!(outcome, PullOutcome::Pulled);
    assert_eq!(node.recorder.count(reason::PULLING), 1);
    assert_eq!(node.recorder.count(reason::PULLED), 1);
    assert_eq!(node.recorder.events().len(), 2);

    node.clock.advance(2 * CEILING + SECOND);
    node.puller.backoff().gc_now();
    assert_eq!(node.puller.backoff().delay(&container.image), None);
    assert!(node.puller.backoff().is_empty());
}

#[tokio::test]
async fn test_event_targets_the_container() {
    let node = node(MockRuntime::new());
    let container = Container::new("back-off", "nginx:1.25", PullPolicy::IfNotPresent);

    node.puller
        .pull(&pod_for(&container), &container, &[])
        .await
        .unwrap();

    let events = node.recorder.events();
    assert_eq!(events[0].involved_object.name, "pod-back-off-image");
    assert_eq!(events[0].involved_object.field_path, "spec.containers{back-off}");
    assert!(events[1].message.contains("nginx:1.25"));
}

#[tokio::test]
async fn test_failing_registry_delays_double() {
    let runtime = MockRuntime::new();
    runtime.set_pull_failing("busybox:broken", true);
    let node = node(runtime);
    let container = Container::new("back-off", "busybox:broken", PullPolicy::Always);

    let gaps = attempt_gaps(&node, &container, 4).await;

    assert_eq!(gaps, vec![FLOOR, 2 * FLOOR, 4 * FLOOR]);
    let ratio = gaps[1].as_secs_f64() / gaps[0].as_secs_f64();
    assert_eq!(ratio.round(), 2.0);
}

#[tokio::test]
async fn test_failing_registry_delay_is_capped() {
    let runtime = MockRuntime::new();
    runtime.set_pull_failing("busybox:broken", true);
    let node = node(runtime);
    let container = Container::new("back-off-cap", "busybox:broken", PullPolicy::Always);

    let gaps = attempt_gaps(&node, &container, 9).await;

    assert!(gaps.iter().all(|gap| *gap <= CEILING));
    let capped = &gaps[gaps.len() - 2..];
    for gap in capped {
        assert!(*gap >= CEILING);
        assert!(gap.as_secs_f64() <= CEILING.as_secs_f64() * 1.3);
    }
}

#[tokio::test]
async fn test_backed_off_passes_report_waiting_not_failure() {
    let runtime = MockRuntime::new();
    runtime.set_pull_failing("busybox:broken", true);
    let node = node(runtime);
    let container = Container::new("back-off", "busybox:broken", PullPolicy::Always);
    let pod = pod_for(&container);

    let first = node.puller.pull(&pod, &container, &[]).await.unwrap_err();
    assert!(!first.is_backoff());

    node.clock.advance(SECOND);
    let second = node.puller.pull(&pod, &container, &[]).await.unwrap_err();
    assert!(second.is_backoff());
    assert_eq!(second.outcome(), PullOutcome::BackedOff);
    assert!(second.to_string().contains("back-off pulling image"));
    assert_eq!(node.runtime.pull_count("busybox:broken"), 1);
}

#[tokio::test]
async fn test_image_update_is_not_penalized_by_old_failures() {
    let runtime = MockRuntime::new();
    runtime.set_pull_failing("busybox:broken", true);
    let node = node(runtime);
    let broken = Container::new("back-off", "busybox:broken", PullPolicy::Always);
    attempt_gaps(&node, &broken, 4).await;

    // The pod is updated to a working image; it pulls immediately.
    let fixed = Container::new("back-off", "nginx:1.25", PullPolicy::Always);
    let outcome = node
        .puller
        .pull(&pod_for(&fixed), &fixed, &[])
        .await
        .unwrap();
    assert_eq!(outcome, PullOutcome::Pulled);

    // Once the old image recovers, its history is cleared too.
    node.runtime.set_pull_failing("busybox:broken", false);
    node.clock.advance(CEILING);
    let outcome = node
        .puller
        .pull(&pod_for(&broken), &broken, &[])
        .await
        .unwrap();
    assert_eq!(outcome, PullOutcome::Pulled);

    node.runtime.set_pull_failing("busybox:broken", true);
    let _ = node.puller.pull(&pod_for(&broken), &broken, &[]).await;
    assert_eq!(node.puller.backoff().delay("busybox:broken"), Some(FLOOR));
}

#[tokio::test]
async fn test_restarts_of_present_image_are_never_backed_off() {
    let node = node(MockRuntime::with_images(["busybox:1.36"]));
    let container = Container::new("back-off-liveness", "busybox:1.36", PullPolicy::IfNotPresent);
    let pod = pod_for(&container);

    let mut restart_times = Vec::new();
    for _ in 0..5 {
        let outcome = node.puller.pull(&pod, &container, &[]).await.unwrap();
        assert_eq!(outcome, PullOutcome::AlreadyPresent);
        restart_times.push(node.clock.now());
        node.clock.advance(5 * SECOND);
    }

    let gaps: Vec<Duration> = restart_times.windows(2).map(|w| w[1] - w[0]).collect();
    for pair in gaps.windows(2) {
        let ratio = pair[1].as_secs_f64() / pair[0].as_secs_f64();
        assert_eq!(ratio.round(), 1.0);
    }
    assert_eq!(node.runtime.total_pulls(), 0);
    assert!(node.puller.backoff().is_empty());
}

#[tokio::test]
async fn test_failing_image_does_not_block_other_images() {
    let runtime = MockRuntime::new();
    runtime.set_pull_failing("busybox:broken", true);
    let node = node(runtime);
    let broken = Container::new("broken", "busybox:broken", PullPolicy::Always);
    let healthy = Container::new("healthy", "nginx:1.25", PullPolicy::Always);

    let _ = node.puller.pull(&pod_for(&broken), &broken, &[]).await;
    for _ in 0..3 {
        let outcome = node
            .puller
            .pull(&pod_for(&healthy), &healthy, &[])
            .await
            .unwrap();
        assert_eq!(outcome, PullOutcome::Pulled);
    }
    assert_eq!(node.runtime.pull_count("nginx:1.25"), 3);
}

#[tokio::test]
async fn test_never_policy_outcomes() {
    let node = node(MockRuntime::with_images(["busybox:1.36"]));

    for image in ["busybox:1.36", "nginx:1.25"] {
        let container = Container::new("app", image, PullPolicy::Never);
        let result = node.puller.pull(&pod_for(&container), &container, &[]).await;
        match result {
            Ok(outcome) => assert_eq!(outcome, PullOutcome::AlreadyPresent),
            Err(ImagePullError::NeverPullDenied { image: denied }) => {
                assert_eq!(denied, "nginx:1.25")
            }
            Err(other) => panic!("unexpected error {other}"),
        }
    }

    assert_eq!(node.runtime.total_pulls(), 0);
    assert_eq!(node.recorder.count(reason::ERR_IMAGE_NEVER_PULL), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_failures_on_one_image_are_serialized() {
    let node = node(MockRuntime::new());
    let backoff_owner = Arc::clone(&node.puller);
    let key = "busybox:broken";
    let now = node.clock.now();

    backoff_owner.backoff().record_failure(key, now);

    let tasks: Vec<_> = (0..5)
        .map(|_| {
            let puller = Arc::clone(&backoff_owner);
            tokio::spawn(async move {
                puller.backoff().record_failure(key, now);
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    // floor * 2^5 = 320s, capped at 300s.
    assert_eq!(backoff_owner.backoff().delay(key), Some(CEILING));

    backoff_owner.backoff().reset(key);
    backoff_owner.backoff().record_failure(key, now);
    let tasks: Vec<_> = (0..3)
        .map(|_| {
            let puller = Arc::clone(&backoff_owner);
            tokio::spawn(async move {
                puller.backoff().record_failure(key, now);
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(backoff_owner.backoff().delay(key), Some(8 * FLOOR));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_pulls_across_pods() {
    let node = node(MockRuntime::with_images(["busybox:1.36"]));

    let tasks: Vec<_> = (0..16)
        .map(|i| {
            let puller = Arc::clone(&node.puller);
            tokio::spawn(async move {
                let image = if i % 2 == 0 { "busybox:1.36" } else { "nginx:1.25" };
                let container = Container::new(format!("c{i}"), image, PullPolicy::IfNotPresent);
                let pod = Pod {
                    metadata: PodMeta {
                        name: format!("pod-{i}"),
                        namespace: "e2e".to_string(),
                        uid: format!("uid-{i}"),
                    },
                    spec: PodSpec {
                        containers: vec![container.clone()],
                        image_pull_secrets: vec![],
                    },
                };
                puller.pull(&pod, &container, &[]).await
            })
        })
        .collect();

    for task in tasks {
        let outcome = task.await.unwrap().unwrap();
        assert!(outcome.is_success());
    }
    assert_eq!(node.runtime.pull_count("busybox:1.36"), 0);
    assert!(node.runtime.pull_count("nginx:1.25") >= 1);
    assert!(node.puller.backoff().is_empty());
}

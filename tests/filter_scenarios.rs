//! End-to-end filter scenarios against the in-memory backend

use std::time::Duration;

use tokio::time::{sleep, timeout};

use unit_filter::backend::memory::MemoryBackend;
use unit_filter::{CharmUrl, Error, EventFilter, EventStream, Life, ResolvedMode};

const UNIT: &str = "wordpress/0";
const SERVICE: &str = "wordpress";

/// Generous bound for events that must arrive
const LONG: Duration = Duration::from_secs(5);
/// Short bound for asserting that nothing arrives
const SHORT: Duration = Duration::from_millis(100);

fn curl(s: &str) -> CharmUrl {
    s.parse().expect("valid charm url")
}

/// Backend with one service and one unit, both on `charm`, filter running
async fn start(charm: &str) -> (MemoryBackend, EventFilter) {
    let backend = MemoryBackend::new();
    backend.add_service(SERVICE, curl(charm), false).await;
    backend.add_unit(UNIT, SERVICE, Some(curl(charm))).await;
    let filter = EventFilter::new(backend.clone(), UNIT);
    (backend, filter)
}

async fn read<T>(events: &mut EventStream<T>) -> T {
    timeout(LONG, events.next())
        .await
        .expect("timed out waiting for event")
        .expect("filter died while waiting for event")
}

async fn assert_no_event<T>(events: &mut EventStream<T>) {
    assert!(
        timeout(SHORT, events.next()).await.is_err(),
        "unexpected event delivered"
    );
}

/// Let in-flight notifications drain through the loop
async fn settle() {
    sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_upgrade_gated_on_baseline() {
    let (backend, filter) = start("cs:foo-1").await;
    let mut upgrades = filter.upgrade_events();

    backend.set_service_charm(SERVICE, curl("cs:foo-2"), false).await;

    // No baseline requested yet: nothing is observable
    assert_no_event(&mut upgrades).await;

    filter.want_upgrade_event(false).await;
    assert_eq!(read(&mut upgrades).await, curl("cs:foo-2"));

    filter.stop().await.unwrap();
}

#[tokio::test]
async fn test_forced_only_policy_filters_unforced() {
    let (backend, filter) = start("cs:foo-1").await;
    let mut upgrades = filter.upgrade_events();

    filter.want_upgrade_event(true).await;

    backend.set_service_charm(SERVICE, curl("cs:foo-2"), false).await;
    assert_no_event(&mut upgrades).await;

    backend.set_service_charm(SERVICE, curl("cs:foo-3"), true).await;
    assert_eq!(read(&mut upgrades).await, curl("cs:foo-3"));

    filter.stop().await.unwrap();
}

#[tokio::test]
async fn test_set_charm_restarts_watchers_and_clears_pending_upgrade() {
    let backend = MemoryBackend::new();
    backend.add_service(SERVICE, curl("cs:foo-1"), false).await;
    backend.add_relations(SERVICE, &[0]).await;
    backend.add_unit(UNIT, SERVICE, Some(curl("cs:foo-1"))).await;
    let filter = EventFilter::new(backend.clone(), UNIT);

    let mut upgrades = filter.upgrade_events();
    let mut configs = filter.config_events();
    let mut relations = filter.relations_events();

    // Drain the initial config and relations events
    read(&mut configs).await;
    assert_eq!(read(&mut relations).await, vec![0]);

    // Arm an upgrade for cs:foo-2 and leave it unread
    filter.want_upgrade_event(false).await;
    backend.set_service_charm(SERVICE, curl("cs:foo-2"), false).await;
    settle().await;

    filter.set_charm(curl("cs:foo-2")).await.unwrap();

    // Fresh config watcher announces itself
    read(&mut configs).await;
    // Fresh relations watcher delivers the full current view
    assert_eq!(read(&mut relations).await, vec![0]);
    // The pending upgrade to the now-adopted charm is gone
    assert_no_event(&mut upgrades).await;

    filter.stop().await.unwrap();
}

#[tokio::test]
async fn test_clear_resolved_race_safety() {
    let (backend, filter) = start("cs:foo-1").await;
    let mut resolved = filter.resolved_events();

    backend.set_resolved(UNIT, ResolvedMode::RetryHooks).await;
    assert_eq!(read(&mut resolved).await, ResolvedMode::RetryHooks);

    // Delivery disarmed the event; an explicit request re-arms it while the
    // backend still says RetryHooks
    filter.want_resolved_event().await;
    assert_eq!(read(&mut resolved).await, ResolvedMode::RetryHooks);

    filter.clear_resolved().await.unwrap();

    // No stale value can arrive now, even on request
    filter.want_resolved_event().await;
    assert_no_event(&mut resolved).await;

    filter.stop().await.unwrap();
}

#[tokio::test]
async fn test_relations_accumulate_and_sort() {
    let (backend, filter) = start("cs:foo-1").await;
    let mut relations = filter.relations_events();

    backend.add_relations(SERVICE, &[3, 1]).await;
    backend.add_relations(SERVICE, &[2, 1]).await;
    settle().await;

    assert_eq!(read(&mut relations).await, vec![1, 2, 3]);

    // Delivery cleared the pending set
    assert_no_event(&mut relations).await;

    filter.stop().await.unwrap();
}

#[tokio::test]
async fn test_dying_disarms_upgrade_but_not_relations() {
    let (backend, filter) = start("cs:foo-1").await;
    let mut upgrades = filter.upgrade_events();
    let mut relations = filter.relations_events();

    filter.want_upgrade_event(false).await;
    backend.set_service_charm(SERVICE, curl("cs:foo-2"), false).await;
    settle().await;

    backend.set_unit_life(UNIT, Life::Dying).await;

    timeout(LONG, filter.unit_dying())
        .await
        .expect("unit_dying did not become ready");

    // The armed upgrade was withdrawn for the dying unit
    assert_no_event(&mut upgrades).await;

    // Relations still flow
    backend.add_relations(SERVICE, &[7]).await;
    assert_eq!(read(&mut relations).await, vec![7]);

    filter.stop().await.unwrap();
}

#[tokio::test]
async fn test_terminate_agent_when_unit_removed() {
    let (backend, filter) = start("cs:foo-1").await;

    backend.remove_unit(UNIT).await;

    let err = filter.wait().await.unwrap_err();
    assert!(err.is_terminate_agent());
}

#[tokio::test]
async fn test_terminate_agent_when_unit_dies() {
    let (backend, filter) = start("cs:foo-1").await;

    backend.set_unit_life(UNIT, Life::Dead).await;

    let err = filter.wait().await.unwrap_err();
    assert!(err.is_terminate_agent());
}

#[tokio::test]
async fn test_fatal_when_service_removed() {
    let (backend, filter) = start("cs:foo-1").await;

    backend.remove_service(SERVICE).await;

    let err = filter.wait().await.unwrap_err();
    assert!(matches!(err, Error::ServiceRemoved));
}

#[tokio::test]
async fn test_fatal_when_service_dead() {
    let (backend, filter) = start("cs:foo-1").await;

    backend.set_service_life(SERVICE, Life::Dead).await;

    let err = filter.wait().await.unwrap_err();
    assert!(matches!(err, Error::ServiceDead));
}

#[tokio::test]
async fn test_service_dying_destroys_unit() {
    let (backend, filter) = start("cs:foo-1").await;

    backend.set_service_life(SERVICE, Life::Dying).await;

    // The filter asks the backend to destroy the unit, which in turn makes
    // the unit observably dying; the filter itself keeps running.
    timeout(LONG, filter.unit_dying())
        .await
        .expect("unit_dying did not become ready");
    assert!(!*filter.dead().borrow());

    filter.stop().await.unwrap();
}

#[tokio::test]
async fn test_set_charm_updates_upgrade_baseline() {
    let (backend, filter) = start("cs:foo-1").await;
    let mut upgrades = filter.upgrade_events();

    filter.want_upgrade_event(false).await;
    backend.set_service_charm(SERVICE, curl("cs:foo-2"), false).await;
    settle().await;

    filter.set_charm(curl("cs:foo-2")).await.unwrap();
    assert_no_event(&mut upgrades).await;

    // Announcing the adopted charm again indicates no upgrade
    backend.set_service_charm(SERVICE, curl("cs:foo-2"), false).await;
    assert_no_event(&mut upgrades).await;

    // A different charm does
    backend.set_service_charm(SERVICE, curl("cs:foo-3"), false).await;
    assert_eq!(read(&mut upgrades).await, curl("cs:foo-3"));

    filter.stop().await.unwrap();
}

#[tokio::test]
async fn test_identical_service_notifications_coalesce() {
    let (backend, filter) = start("cs:foo-1").await;
    let mut upgrades = filter.upgrade_events();

    filter.want_upgrade_event(false).await;
    backend.set_service_charm(SERVICE, curl("cs:foo-2"), false).await;
    settle().await;
    backend.set_service_charm(SERVICE, curl("cs:foo-2"), false).await;
    settle().await;

    // Two identical announcements produce at most one event until consumed
    assert_eq!(read(&mut upgrades).await, curl("cs:foo-2"));
    assert_no_event(&mut upgrades).await;

    filter.stop().await.unwrap();
}

#[tokio::test]
async fn test_discard_config_event() {
    let (backend, filter) = start("cs:foo-1").await;
    let mut configs = filter.config_events();

    // Initial config event from the freshly started watcher
    read(&mut configs).await;

    backend.update_config(&curl("cs:foo-1")).await;
    settle().await;

    filter.discard_config_event().await;
    settle().await;
    assert_no_event(&mut configs).await;

    // The next change is a fresh event
    backend.update_config(&curl("cs:foo-1")).await;
    read(&mut configs).await;

    filter.stop().await.unwrap();
}

#[tokio::test]
async fn test_resolved_modes_are_never_none() {
    let (backend, filter) = start("cs:foo-1").await;
    let mut resolved = filter.resolved_events();

    backend.set_resolved(UNIT, ResolvedMode::NoHooks).await;
    let mode = read(&mut resolved).await;
    assert_eq!(mode, ResolvedMode::NoHooks);
    assert!(mode.is_set());

    filter.stop().await.unwrap();
}

#[tokio::test]
async fn test_unit_without_charm_gets_no_upgrade_or_config_events() {
    let backend = MemoryBackend::new();
    backend.add_service(SERVICE, curl("cs:foo-1"), false).await;
    backend.add_unit(UNIT, SERVICE, None).await;
    let filter = EventFilter::new(backend.clone(), UNIT);

    let mut upgrades = filter.upgrade_events();
    let mut configs = filter.config_events();

    filter.want_upgrade_event(false).await;
    backend.set_service_charm(SERVICE, curl("cs:foo-2"), false).await;
    settle().await;

    // No charm adopted: no upgrade baseline, no config watcher
    assert_no_event(&mut upgrades).await;
    assert_no_event(&mut configs).await;

    // Adopting a charm brings both to life
    filter.set_charm(curl("cs:foo-2")).await.unwrap();
    read(&mut configs).await;
    assert_no_event(&mut upgrades).await;

    backend.set_service_charm(SERVICE, curl("cs:foo-3"), false).await;
    assert_eq!(read(&mut upgrades).await, curl("cs:foo-3"));

    filter.stop().await.unwrap();
}

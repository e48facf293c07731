//! End-to-end browsing, publishing and filtering over the in-memory adapter.

use std::sync::{Arc, Mutex};

use service_discovery::{
    FlagPattern, Flags, LocalService, MemoryAdapter, MultiPattern, PositionPattern, Position,
    PropertyPattern, ServiceBrowser, ServiceDiscovery, ServiceEvent, ServiceEventKind,
    ServicePattern,
};

const RIMRES: &str = "_rimres._tcp";

fn record_events(browser: &ServiceBrowser) -> Arc<Mutex<Vec<ServiceEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    browser.connect(move |event| sink.lock().unwrap().push(event.clone()));
    events
}

#[test]
fn test_publish_then_update_properties() {
    let _ = env_logger::builder().is_test(true).try_init();
    let adapter = Arc::new(MemoryAdapter::new());

    let browser = ServiceBrowser::new(adapter.clone(), RIMRES, "local").unwrap();
    let events = record_events(&browser);
    browser.start().unwrap();

    let mut local = LocalService::new(
        adapter.clone(),
        "MyTestService",
        RIMRES,
        10000,
        ["service_year=1999"],
    )
    .unwrap();
    local.publish().unwrap();
    adapter.run_pending();

    local
        .update_properties(["service_year=1999", "somethingelse=10"])
        .unwrap();
    adapter.run_pending();

    let events = events.lock().unwrap();
    let kinds: Vec<ServiceEventKind> = events.iter().map(|e| e.kind()).collect();
    assert_eq!(kinds, vec![ServiceEventKind::Added, ServiceEventKind::Updated]);

    let services = browser.get_services();
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].name(), "MyTestService");
    assert_eq!(services[0].port(), Some(10000));
    assert_eq!(services[0].get("somethingelse"), Some("10"));
}

#[test]
fn test_unpublish_removes_from_live_set() {
    let adapter = Arc::new(MemoryAdapter::new());
    let browser = ServiceBrowser::new(adapter.clone(), RIMRES, "local").unwrap();
    let events = record_events(&browser);
    browser.start().unwrap();

    let mut local = LocalService::new(adapter.clone(), "Crex", RIMRES, 1, Vec::<String>::new())
        .unwrap();
    local.publish().unwrap();
    adapter.run_pending();
    assert_eq!(browser.len(), 1);

    local.unpublish().unwrap();
    adapter.run_pending();
    assert!(browser.is_empty());
    assert_eq!(
        events.lock().unwrap().last().map(|e| e.kind()),
        Some(ServiceEventKind::Removed)
    );
}

#[test]
fn test_republishing_same_properties_emits_nothing() {
    let adapter = Arc::new(MemoryAdapter::new());
    let browser = ServiceBrowser::new(adapter.clone(), RIMRES, "local").unwrap();
    let events = record_events(&browser);
    browser.start().unwrap();

    let mut local =
        LocalService::new(adapter.clone(), "Crex", RIMRES, 1, ["a=1"]).unwrap();
    local.publish().unwrap();
    local.update_properties(["a=1"]).unwrap();
    adapter.run_pending();

    assert_eq!(events.lock().unwrap().len(), 1);
}

#[test]
fn test_pattern_queries_across_published_robots() {
    let adapter = Arc::new(MemoryAdapter::new());
    let discovery = ServiceDiscovery::new(adapter.clone());
    discovery.add_service_type(RIMRES).unwrap();
    discovery.add_service_type("_other._tcp").unwrap();
    discovery.listen_on(["local"]).unwrap();

    let near_ready = [
        (Flags::READY | Flags::SLAM | Flags::REMOTE).to_property(),
        Position::new(3.0, 4.0, 0.0).to_property(),
    ];
    let far_ready = [
        Flags::READY.to_property(),
        Position::new(3.0, 4.0, 1.0).to_property(),
    ];
    let mut near = LocalService::new(adapter.clone(), "near", RIMRES, 1, near_ready).unwrap();
    let mut far = LocalService::new(adapter.clone(), "far", RIMRES, 2, far_ready).unwrap();
    let mut other =
        LocalService::new(adapter.clone(), "other", "_other._tcp", 3, ["flags=6"]).unwrap();
    near.publish().unwrap();
    far.publish().unwrap();
    other.publish().unwrap();
    adapter.run_pending();

    let names = |pattern: &dyn ServicePattern| -> Vec<String> {
        discovery
            .find_services(pattern)
            .map(|s| s.name().to_string())
            .collect()
    };

    let rimres = PropertyPattern::new("type", "^_rimres").unwrap();
    assert_eq!(names(&rimres), vec!["near", "far"]);

    let slam = FlagPattern::new(Flags::READY | Flags::SLAM);
    assert_eq!(names(&slam), vec!["near", "other"]);

    let within = PositionPattern::new(0.0, 0.0, 0.0, 5.0);
    assert_eq!(names(&within), vec!["near"]);

    let mut both = MultiPattern::new();
    both.add_pattern(&rimres).add_pattern(&slam);
    assert_eq!(names(&both), vec!["near"]);

    assert_eq!(names(&MultiPattern::new()).len(), 3);
}

#[test]
fn test_faulty_subscriber_does_not_block_others() {
    let adapter = Arc::new(MemoryAdapter::new());
    let discovery = ServiceDiscovery::new(adapter.clone());
    discovery.added_component_connect(|_| panic!("faulty subscriber"));
    let added = Arc::new(Mutex::new(Vec::new()));
    let sink = added.clone();
    discovery.added_component_connect(move |e| sink.lock().unwrap().push(e.name().to_string()));
    discovery.add_service_type(RIMRES).unwrap();
    discovery.listen_on(["local"]).unwrap();

    let mut a = LocalService::new(adapter.clone(), "a", RIMRES, 1, ["x=1"]).unwrap();
    let mut b = LocalService::new(adapter.clone(), "b", RIMRES, 1, ["x=1"]).unwrap();
    a.publish().unwrap();
    b.publish().unwrap();
    adapter.run_pending();

    assert_eq!(*added.lock().unwrap(), vec!["a", "b"]);
    assert_eq!(discovery.get_services().len(), 2);
}

#[tokio::test]
async fn test_merged_stream_sees_teardown() {
    let adapter = Arc::new(MemoryAdapter::new());
    let discovery = ServiceDiscovery::new(adapter.clone());
    discovery.add_service_type(RIMRES).unwrap();
    discovery.listen_on(["local"]).unwrap();
    let mut receiver = discovery.subscribe();

    let mut local = LocalService::new(adapter.clone(), "crex", RIMRES, 1, ["x=1"]).unwrap();
    local.publish().unwrap();
    adapter.run_pending();
    discovery.stop().unwrap();

    let first = receiver.recv().await.unwrap();
    let second = receiver.recv().await.unwrap();
    assert_eq!(first.kind(), ServiceEventKind::Added);
    assert_eq!(second.kind(), ServiceEventKind::Removed);
    assert_eq!(second.name(), "crex");
}

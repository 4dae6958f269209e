use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::unbounded;
use perception::generator::MapFn;
use perception::{
    Co, EventSink, MetricKind, Pm, PrimitiveEvent, PrimitiveEventGenerator, PrimitiveMapper,
    ResourceGraph, ResourceType, Vm,
};

fn graph() -> Arc<ResourceGraph> {
    let graph = ResourceGraph::new();
    let pm = Arc::new(Pm::new("pm-1"));
    let vm = Arc::new(Vm::new("vm-1"));
    let co = Co::new("co-1");
    co.set_response_time(250);
    assert!(vm.add_co(co));
    assert!(pm.add_vm(vm));
    assert!(graph.add_pm(pm));
    Arc::new(graph)
}

fn within_one(actual: u64, expected: u64) -> bool {
    actual + 1 >= expected && actual <= expected + 1
}

#[test]
fn generators_tick_on_their_own_cadence() {
    let graph = graph();
    let (tx, rx) = unbounded();
    let sink: Arc<dyn EventSink> = Arc::new(tx);

    let mut fast =
        PrimitiveEventGenerator::with_millis("fast", PrimitiveMapper::CoResponseTime, 100)
            .unwrap()
            .start(Arc::clone(&graph), Arc::clone(&sink))
            .unwrap();
    let mut slow =
        PrimitiveEventGenerator::with_millis("slow", PrimitiveMapper::CoResponseTime, 250)
            .unwrap()
            .start(Arc::clone(&graph), Arc::clone(&sink))
            .unwrap();

    thread::sleep(Duration::from_millis(1020));
    fast.stop();
    slow.stop();

    assert!(within_one(fast.ticks(), 10), "fast ticked {} times", fast.ticks());
    assert!(within_one(slow.ticks(), 4), "slow ticked {} times", slow.ticks());
    assert_eq!(fast.emitted() + slow.emitted(), rx.try_iter().count() as u64);
}

#[test]
fn a_slow_mapping_does_not_delay_other_generators() {
    let graph = graph();
    let (tx, _rx) = unbounded();
    let sink: Arc<dyn EventSink> = Arc::new(tx);

    let sluggish: MapFn = Arc::new(|resource| {
        thread::sleep(Duration::from_millis(300));
        Ok(Some(PrimitiveEvent::from_resource(resource, MetricKind::Score, resource.score)))
    });
    let mut stalled = PrimitiveEventGenerator::with_millis(
        "stalled",
        PrimitiveMapper::Custom {
            resource_type: ResourceType::Co,
            map: sluggish,
        },
        50,
    )
    .unwrap()
    .start(Arc::clone(&graph), Arc::clone(&sink))
    .unwrap();
    let mut steady =
        PrimitiveEventGenerator::with_millis("steady", PrimitiveMapper::CoResponseTime, 100)
            .unwrap()
            .start(Arc::clone(&graph), Arc::clone(&sink))
            .unwrap();

    thread::sleep(Duration::from_millis(1020));
    steady.stop();
    stalled.stop();

    assert!(within_one(steady.ticks(), 10), "steady ticked {} times", steady.ticks());
    assert!(stalled.ticks() <= 5);
}

#[test]
fn stopped_generator_emits_nothing_more() {
    let graph = graph();
    let (tx, rx) = unbounded();
    let sink: Arc<dyn EventSink> = Arc::new(tx);

    let mut handle = PrimitiveEventGenerator::with_millis("rt", PrimitiveMapper::CoResponseTime, 20)
        .unwrap()
        .start(graph, sink)
        .unwrap();
    let first = rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(first.metric(MetricKind::ResponseTime), Some(250));

    handle.stop();
    assert!(!handle.is_running());
    let emitted = handle.emitted();
    thread::sleep(Duration::from_millis(100));
    assert_eq!(handle.emitted(), emitted);
    assert_eq!(rx.try_iter().count() as u64, emitted - 1);

    // Idempotent.
    handle.stop();
}

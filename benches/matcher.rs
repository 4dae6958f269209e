use std::time::{Duration, Instant};

use chrono::{TimeDelta, Utc};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use perception::config::{GeneratorCategory, GeneratorDefinition, Param, ParamType};
use perception::{
    BuiltGenerator, Co, Dispatcher, DispatcherConfig, Event, EventKind, GeneratorRegistry,
    MatcherConfig, MetricKind, PatternMatcher, Pm, PrimitiveEvent, PrimitiveEventGenerator,
    PrimitiveMapper, ResourceGraph, ResourceType, Vm,
};

fn high_rt_matcher() -> PatternMatcher {
    let def = GeneratorDefinition::derived(
        GeneratorCategory::Simple,
        "high-rt",
        "SEG_Co_HighResponseTime",
        vec![
            Param::new(ParamType::Long, "500"),
            Param::new(ParamType::Integer, "3"),
            Param::new(ParamType::Long, "10000"),
        ],
    );
    match GeneratorRegistry::with_builtins().build(&def).unwrap() {
        BuiltGenerator::Matcher(m) => m,
        BuiltGenerator::Primitive(_) => unreachable!("simple definition built a primitive"),
    }
}

/// 64 instances, a third of the readings above threshold.
fn readings(n: usize) -> Vec<Event> {
    let t0 = Utc::now();
    (0..n)
        .map(|i| {
            let value = if i % 3 == 0 { 900 } else { 120 };
            Event::primitive_at(
                PrimitiveEvent {
                    resource_name: format!("co-{}", i % 64),
                    resource_type: ResourceType::Co,
                    score: 0,
                    metric: MetricKind::ResponseTime,
                    value,
                },
                t0 + TimeDelta::milliseconds(i as i64),
            )
        })
        .collect()
}

fn bench_matcher_consume(c: &mut Criterion) {
    let events = readings(4096);
    let mut group = c.benchmark_group("matcher_consume");
    group.throughput(Throughput::Elements(events.len() as u64));
    group.bench_function("high_response_time_64_keys", |b| {
        b.iter(|| {
            let mut matcher = high_rt_matcher();
            let mut emitted = 0usize;
            for event in &events {
                emitted += matcher.consume(black_box(event)).len();
            }
            emitted
        });
    });
    group.finish();
}

fn bench_generator_tick(c: &mut Criterion) {
    let graph = ResourceGraph::new();
    for p in 0..8 {
        let pm = Pm::new(format!("pm-{p}"));
        for v in 0..8 {
            let vm = Vm::new(format!("vm-{p}-{v}"));
            for i in 0..4 {
                let co = Co::new(format!("co-{p}-{v}-{i}"));
                co.set_response_time(100 + i);
                vm.add_co(co);
            }
            pm.add_vm(vm);
        }
        graph.add_pm(pm);
    }
    let generator = PrimitiveEventGenerator::new(
        "rt",
        PrimitiveMapper::CoResponseTime,
        Duration::from_secs(1),
    )
    .unwrap();
    let (tx, rx) = crossbeam_channel::unbounded::<Event>();
    let stats = perception::generator::GeneratorStats::default();

    c.bench_function("generator/tick_256_cos", |b| {
        b.iter(|| {
            let report = generator.run_tick(&graph, &tx, &stats);
            black_box(rx.try_iter().count());
            report
        });
    });
}

fn bench_dispatcher_roundtrip(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatcher_roundtrip");
    group.throughput(Throughput::Elements(1));
    group.bench_function("publish_to_subscriber", |b| {
        b.iter_custom(|iters| {
            let dispatcher =
                Dispatcher::new(DispatcherConfig::default(), MatcherConfig::default()).unwrap();
            dispatcher.register_matcher(high_rt_matcher()).unwrap();
            let primitives = dispatcher.subscribe(&[EventKind::Primitive]).unwrap();
            let batch = readings(256);

            let start = Instant::now();
            for i in 0..iters {
                let event = &batch[(i % 256) as usize];
                dispatcher.publish(event.clone()).unwrap();
                black_box(primitives.recv().unwrap());
            }
            let elapsed = start.elapsed();
            dispatcher.shutdown();
            elapsed
        });
    });
    group.finish();
}

criterion_group!(matcher, bench_matcher_consume, bench_generator_tick, bench_dispatcher_roundtrip);
criterion_main!(matcher);

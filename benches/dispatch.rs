use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use corrflow::{
    DispatchCoordinator, DispatchRuntime, DispatchRuntimeConfig, EventInstance, EventSubscription, ExecutionEngine,
    InMemoryExecutionEngine, InMemoryStores, ScopeType, ScopeVariables,
};

/// Coordinator with `listeners` running listeners on distinct customers plus
/// one unique start subscription.
fn make_coordinator(listeners: usize) -> Arc<DispatchCoordinator> {
    let stores = InMemoryStores::new();
    let engine = Arc::new(InMemoryExecutionEngine::new());
    engine.deploy_definition("case-listener", ScopeType::Cmmn).unwrap();
    engine.deploy_definition("case-unique", ScopeType::Cmmn).unwrap();

    let coordinator = DispatchCoordinator::new(
        Arc::new(stores.subscriptions),
        Arc::new(stores.ledger),
        Arc::clone(&engine) as Arc<dyn ExecutionEngine>,
    );

    for i in 0..listeners {
        let inst = engine.start_instance("case-listener", ScopeVariables::new()).unwrap();
        coordinator
            .register_subscription(
                EventSubscription::running_listener("myEvent", inst.as_str())
                    .correlate("customerId", format!("customer-{i}"))
                    .map_payload("payload1", "lastPayload")
                    .build()
                    .unwrap(),
            )
            .unwrap();
    }
    coordinator
        .register_subscription(
            EventSubscription::start_definition("myEvent", "case-unique")
                .correlate("customerId", "customer-0")
                .unique_instance(true)
                .build()
                .unwrap(),
        )
        .unwrap();

    Arc::new(coordinator)
}

fn event(i: usize) -> EventInstance {
    EventInstance::builder("myEvent")
        .value("customerId", format!("customer-{i}"))
        .value("payload1", "Hello World")
        .build()
        .unwrap()
}

fn bench_coordinator_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch/coordinator");
    group.throughput(Throughput::Elements(1));

    for listeners in [16usize, 256, 4096] {
        let coordinator = make_coordinator(listeners);
        // Warm the ledger so the unique start measures the duplicate path.
        coordinator.dispatch(&event(0)).unwrap();

        group.bench_with_input(BenchmarkId::from_parameter(listeners), &listeners, |b, &n| {
            let mut i = 0usize;
            b.iter(|| {
                i = (i + 1) % n;
                coordinator.dispatch(&event(i)).unwrap()
            });
        });
    }
    group.finish();
}

fn bench_runtime_dispatch(c: &mut Criterion) {
    let coordinator = make_coordinator(256);
    coordinator.dispatch(&event(0)).unwrap();
    let runtime = DispatchRuntime::new(
        coordinator,
        DispatchRuntimeConfig {
            workers: 4,
            queue_capacity: 1024,
        },
    )
    .unwrap();

    let mut group = c.benchmark_group("dispatch/runtime");
    group.throughput(Throughput::Elements(64));
    group.bench_function("batch_64", |b| {
        b.iter(|| {
            let handles: Vec<_> = (0..64).map(|i| runtime.submit(event(i % 256)).unwrap()).collect();
            for handle in handles {
                handle.join().unwrap();
            }
        });
    });
    group.finish();
}

criterion_group!(benches, bench_coordinator_dispatch, bench_runtime_dispatch);
criterion_main!(benches);

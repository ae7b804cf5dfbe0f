use std::sync::Arc;
use std::time::Duration;

use kyroflux::testing::TestSubscriber;
use kyroflux::{Context, Flux, SchedulerConfig, Schedulers};

fn tenant(ctx: &Context) -> String {
    ctx.get_str("tenant").unwrap_or("none").to_string()
}

#[test]
fn context_write_is_visible_upstream_only() {
    let values = Flux::just(vec![1])
        .map_with_context(|n, ctx| format!("{n}@{}", tenant(ctx)))
        .context_write(|ctx| ctx.put("tenant", "acme"))
        .map_with_context(|s, ctx| format!("{s}/{}", tenant(ctx)))
        .block_collect()
        .unwrap();
    assert_eq!(values, vec!["1@acme/none".to_string()]);
}

#[test]
fn nearest_write_wins() {
    let values = Flux::just(vec![0])
        .map_with_context(|_, ctx| tenant(ctx))
        .context_write(|ctx| ctx.put("tenant", "inner"))
        .context_write(|ctx| ctx.put("tenant", "outer"))
        .block_collect()
        .unwrap();
    assert_eq!(values, vec!["inner".to_string()]);
}

#[test]
fn defer_contextual_reads_subscriber_context() {
    let greeting = Flux::defer_contextual(|ctx| Flux::just(vec![format!("hello {}", tenant(ctx))]));

    let probe = TestSubscriber::new();
    greeting.subscribe_with_context(probe.clone(), Context::empty().put("tenant", "globex"));
    assert_eq!(probe.values(), vec!["hello globex".to_string()]);

    assert_eq!(
        greeting.block_collect().unwrap(),
        vec!["hello none".to_string()]
    );
}

#[test]
fn context_is_immutable_across_writes() {
    let base = Context::empty().put("tenant", "acme");
    let probe = TestSubscriber::new();
    Flux::defer_contextual(|ctx| Flux::just(vec![ctx.len()]))
        .context_write(|ctx| ctx.put("region", "eu").delete("tenant"))
        .subscribe_with_context(probe.clone(), base.clone());
    assert_eq!(probe.values(), vec![1]);
    assert_eq!(base.get_str("tenant"), Some("acme"));
    assert!(!base.has_key("region"));
}

#[test]
fn context_crosses_publish_on_and_flat_map_inners() {
    let pool = Schedulers::new_parallel(SchedulerConfig {
        name: "ctx-hop".to_string(),
        workers: 2,
        queue_capacity: 256,
    });
    let inner_pool = Arc::clone(&pool);
    let probe = TestSubscriber::new();
    Flux::range(0, 3)
        .flat_map(
            move |n| {
                Flux::defer_contextual(move |ctx| Flux::just(vec![format!("{n}:{}", tenant(ctx))]))
                    .subscribe_on(Arc::clone(&inner_pool))
            },
            1,
            4,
        )
        .publish_on(Arc::clone(&pool))
        .map_with_context(|s, ctx| format!("{s}:{}", tenant(ctx)))
        .context_write(|ctx| ctx.put("tenant", "initech"))
        .subscribe(probe.clone());

    assert!(probe.await_terminal(Duration::from_secs(5)));
    assert_eq!(
        probe.values(),
        vec![
            "0:initech:initech".to_string(),
            "1:initech:initech".to_string(),
            "2:initech:initech".to_string(),
        ]
    );
    pool.dispose();
}

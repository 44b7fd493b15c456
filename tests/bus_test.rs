//! Integration tests for the event bus: ordering, matching, failure
//! isolation, capacity and shutdown.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use autorun::bus::{EventBus, SubscriptionOptions};
use autorun::config::EventBusConfig;
use autorun::error::Error;
use autorun::event::{Event, EventKind, EventPriority, EventType};
use autorun::model::{ExecutionId, ScheduleId};
use parking_lot::Mutex;

fn bus() -> EventBus {
    EventBus::new(EventBusConfig::default()).unwrap()
}

/// Poll `cond` until it holds or `timeout` passes.
fn eventually(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

fn failed_execution() -> Event {
    Event::new(EventKind::ExecutionFailed {
        execution_id: ExecutionId::new(),
        schedule_id: ScheduleId::new(),
        error: "boom".into(),
        duration_ms: 10,
    })
}

#[test]
fn higher_priority_subscription_runs_first() {
    for _ in 0..20 {
        let bus = bus();
        let order = Arc::new(Mutex::new(Vec::new()));

        let low = Arc::clone(&order);
        bus.subscribe_with(
            EventType::topic("job"),
            SubscriptionOptions::new().priority(EventPriority::Low),
            move |_| {
                low.lock().push("low");
                Ok(())
            },
        );
        let high = Arc::clone(&order);
        bus.subscribe_with(
            EventType::topic("job"),
            SubscriptionOptions::new().priority(EventPriority::High),
            move |_| {
                high.lock().push("high");
                Ok(())
            },
        );

        bus.publish(Event::custom("job", serde_json::Value::Null))
            .unwrap();
        assert!(eventually(Duration::from_secs(2), || order.lock().len() == 2));
        assert_eq!(*order.lock(), vec!["high", "low"]);
        assert!(bus.shutdown());
    }
}

#[test]
fn max_executions_limits_invocations() {
    let bus = bus();
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&calls);
    let once = bus.subscribe_with(
        EventType::topic("tick"),
        SubscriptionOptions::new().max_executions(1),
        move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        },
    );
    let all = Arc::clone(&seen);
    bus.subscribe(EventType::topic("tick"), move |_| {
        all.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    for _ in 0..5 {
        bus.publish(Event::custom("tick", serde_json::Value::Null))
            .unwrap();
    }
    assert!(eventually(Duration::from_secs(2), || seen.load(Ordering::SeqCst) == 5));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(bus.invocation_count(once), Some(1));
    bus.shutdown();
}

#[test]
fn unsubscribe_is_reported_once() {
    let bus = bus();
    let id = bus.subscribe(EventType::Any, |_| Ok(()));
    assert!(bus.unsubscribe(id));
    assert!(!bus.unsubscribe(id));
    assert_eq!(bus.invocation_count(id), None);
    bus.shutdown();
}

#[test]
fn group_subscription_receives_descendants() {
    let bus = bus();
    let groups = Arc::new(Mutex::new(Vec::new()));

    for event_type in [EventType::Execution, EventType::Schedule, EventType::Any] {
        let log = Arc::clone(&groups);
        let name = event_type.to_string();
        bus.subscribe(event_type, move |_| {
            log.lock().push(name.clone());
            Ok(())
        });
    }
    let leaf_only = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&leaf_only);
    bus.subscribe(EventType::ExecutionCompleted, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    bus.publish(failed_execution()).unwrap();
    assert!(eventually(Duration::from_secs(2), || groups.lock().len() == 3));
    assert_eq!(leaf_only.load(Ordering::SeqCst), 0);
    bus.shutdown();
}

#[test]
fn custom_topics_match_declared_ancestors() {
    let bus = bus();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    bus.subscribe(EventType::topic("device"), move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    bus.publish(Event::new(EventKind::Custom {
        topic: "device.keyboard".into(),
        ancestors: vec!["device".into()],
        data: serde_json::json!({ "key": "F5" }),
    }))
    .unwrap();
    // No ancestry: does not reach the "device" subscriber.
    bus.publish(Event::custom("device.mouse", serde_json::Value::Null))
        .unwrap();

    assert!(eventually(Duration::from_secs(2), || {
        bus.statistics().events_processed == 2
    }));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    bus.shutdown();
}

#[test]
fn filter_skips_rejected_events() {
    let bus = bus();
    let received = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&received);
    bus.subscribe_with(
        EventType::topic("reading"),
        SubscriptionOptions::new().filter(|event| event.source == "sensor-a"),
        move |event| {
            log.lock().push(event.source.clone());
            Ok(())
        },
    );

    for source in ["sensor-b", "sensor-a", "sensor-c"] {
        bus.publish(Event::custom("reading", serde_json::Value::Null).with_source(source))
            .unwrap();
    }
    assert!(eventually(Duration::from_secs(2), || {
        bus.statistics().events_processed == 3
    }));
    assert_eq!(*received.lock(), vec!["sensor-a".to_string()]);
    bus.shutdown();
}

#[test]
fn failing_handler_is_reported_and_isolated() {
    let bus = bus();
    let errors = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&errors);
    bus.subscribe(EventType::Error, move |event| {
        if let EventKind::Error { code, .. } = &event.kind {
            log.lock().push((code.clone(), event.correlation_id.clone()));
        }
        Ok(())
    });

    bus.subscribe(EventType::topic("work"), |_| anyhow::bail!("handler exploded"));
    bus.subscribe(EventType::topic("work"), |_| panic!("handler panicked"));
    let survivor = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&survivor);
    bus.subscribe(EventType::topic("work"), move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    let event = Event::custom("work", serde_json::Value::Null);
    let origin = event.id.0.to_string();
    bus.publish(event).unwrap();

    assert!(eventually(Duration::from_secs(2), || errors.lock().len() == 2));
    assert_eq!(survivor.load(Ordering::SeqCst), 1);
    for (code, correlation) in errors.lock().iter() {
        assert_eq!(code, "handler_execution_error");
        assert_eq!(correlation.as_deref(), Some(origin.as_str()));
    }
    assert_eq!(bus.statistics().handler_errors, 2);
    bus.shutdown();
}

#[test]
fn failing_error_handler_does_not_loop() {
    let bus = bus();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    bus.subscribe(EventType::Error, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("error handler broken")
    });

    bus.publish(Event::error("disk_full", "no space left")).unwrap();
    assert!(eventually(Duration::from_secs(2), || {
        bus.statistics().handler_errors == 1
    }));
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(bus.statistics().events_published, 1);
    bus.shutdown();
}

#[test]
fn queue_capacity_is_enforced() {
    let bus = EventBus::new(EventBusConfig {
        queue_capacity: 2,
        ..EventBusConfig::default()
    })
    .unwrap();

    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let entered_tx = Mutex::new(entered_tx);
    let release_rx = Mutex::new(release_rx);
    bus.subscribe(EventType::topic("slow"), move |_| {
        let _ = entered_tx.lock().send(());
        let _ = release_rx.lock().recv_timeout(Duration::from_secs(5));
        Ok(())
    });

    bus.publish(Event::custom("slow", serde_json::Value::Null))
        .unwrap();
    entered_rx.recv_timeout(Duration::from_secs(2)).unwrap();

    bus.publish(Event::custom("slow", serde_json::Value::Null))
        .unwrap();
    bus.publish(Event::custom("slow", serde_json::Value::Null))
        .unwrap();
    let overflow = bus.publish(Event::custom("slow", serde_json::Value::Null));
    assert!(matches!(overflow, Err(Error::QueueFull(2))));
    assert_eq!(bus.statistics().queue_depth, 2);

    for _ in 0..3 {
        let _ = release_tx.send(());
    }
    assert!(bus.shutdown());
}

#[test]
fn publish_after_shutdown_is_rejected() {
    let bus = bus();
    assert!(bus.is_running());
    assert!(bus.shutdown());
    assert!(!bus.is_running());

    let result = bus.publish(Event::custom("late", serde_json::Value::Null));
    assert!(matches!(result, Err(Error::ShutDown(_))));
    // Idempotent.
    assert!(bus.shutdown());
}

#[test]
fn shutdown_drains_queued_events() {
    let bus = bus();
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    bus.subscribe(EventType::Any, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    for _ in 0..10 {
        bus.publish(Event::custom("batch", serde_json::Value::Null))
            .unwrap();
    }
    assert!(bus.shutdown());
    assert_eq!(seen.load(Ordering::SeqCst), 10);
}

#[test]
fn async_handlers_need_a_runtime() {
    let bus = bus();
    let result =
        bus.subscribe_async(EventType::Any, |_event| async { Ok::<(), anyhow::Error>(()) });
    assert!(matches!(result, Err(Error::Config(_))));
    bus.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn async_handler_runs_on_runtime() {
    let bus = bus();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    bus.subscribe_async(EventType::ExecutionFailed, move |event| {
        let tx = tx.clone();
        async move {
            if let EventKind::ExecutionFailed { error, .. } = &event.kind {
                tx.send(error.clone())?;
            }
            Ok::<(), anyhow::Error>(())
        }
    })
    .unwrap();

    bus.publish_async(failed_execution()).await.unwrap();
    let received = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap();
    assert_eq!(received.as_deref(), Some("boom"));

    let bus_for_shutdown = bus.clone();
    assert!(
        tokio::task::spawn_blocking(move || bus_for_shutdown.shutdown())
            .await
            .unwrap()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn async_handler_failure_is_reported() {
    let bus = bus();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    bus.subscribe(EventType::Error, move |event| {
        if let EventKind::Error { code, .. } = &event.kind {
            let _ = tx.send(code.clone());
        }
        Ok(())
    });
    bus.subscribe_async(EventType::topic("job"), |_event| async {
        Err::<(), _>(anyhow::anyhow!("async failure"))
    })
    .unwrap();

    bus.publish(Event::custom("job", serde_json::Value::Null))
        .unwrap();
    let code = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap();
    assert_eq!(code.as_deref(), Some("handler_execution_error"));

    let bus_for_shutdown = bus.clone();
    tokio::task::spawn_blocking(move || bus_for_shutdown.shutdown())
        .await
        .unwrap();
}

#[test]
fn statistics_track_activity() {
    let bus = bus();
    bus.subscribe(EventType::Any, |_| Ok(()));
    bus.subscribe(EventType::System, |_| Ok(()));

    bus.publish(Event::new(EventKind::System {
        name: "boot".into(),
        info: serde_json::Value::Null,
    }))
    .unwrap();

    assert!(eventually(Duration::from_secs(2), || {
        bus.statistics().events_processed == 1
    }));
    let stats = bus.statistics();
    assert_eq!(stats.events_published, 1);
    assert_eq!(stats.handlers_invoked, 2);
    assert_eq!(stats.handler_errors, 0);
    assert_eq!(stats.active_subscriptions, 2);
    assert!(stats.is_running);

    assert_eq!(bus.clear_subscriptions(), 2);
    assert_eq!(bus.statistics().active_subscriptions, 0);
    bus.shutdown();
}

//! Integration tests for the coordination kernel
//!
//! These tests exercise the bus, protocol, workflow engine and agent
//! lifecycle together on a plain tokio runtime.

use agora::bus::{handler_fn, ContentMap, Message, MessageBus, MessageKind};
use agora::protocol::{protocol_fn, CommunicationProtocol, MessageType, StatusCode};
use agora::workflow::{
    task_fn, DecisionFn, InstanceStatus, WorkflowDefinition, WorkflowEngine, WorkflowStep,
};
use agora::{AgentState, BusError, ManagedAgent, NoopHooks};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn map(entries: &[(&str, serde_json::Value)]) -> ContentMap {
    let mut out = ContentMap::new();
    for (key, value) in entries {
        out.insert(key.to_string(), value.clone());
    }
    out
}

fn noop_handler() -> Arc<dyn agora::bus::MessageHandler> {
    handler_fn(|_message| async { Ok(()) })
}

// --- message bus -----------------------------------------------------------

#[tokio::test]
async fn test_publish_delivers_to_each_subscriber_once() {
    let bus = MessageBus::default();
    let first = Arc::new(AtomicUsize::new(0));
    let second = Arc::new(AtomicUsize::new(0));

    for (name, counter) in [("a", &first), ("b", &second)] {
        let counter = Arc::clone(counter);
        bus.subscribe(
            name,
            "agent.broadcast",
            handler_fn(move |_message| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
            None,
        );
    }

    let delivered = bus
        .publish(
            "agent.broadcast",
            Message::new(MessageKind::Broadcast, "tester", ContentMap::new()),
        )
        .await;

    assert_eq!(delivered, 2);
    assert_eq!(first.load(Ordering::SeqCst), 1);
    assert_eq!(second.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_handler_failure_does_not_abort_siblings() {
    let bus = MessageBus::default();
    let survivor = Arc::new(AtomicUsize::new(0));

    bus.subscribe(
        "flaky",
        "events",
        handler_fn(|_message| async { anyhow::bail!("handler bug") }),
        None,
    );
    let counter = Arc::clone(&survivor);
    bus.subscribe(
        "steady",
        "events",
        handler_fn(move |_message| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }),
        None,
    );

    let delivered = bus
        .publish(
            "events",
            Message::new(MessageKind::Event, "tester", ContentMap::new()),
        )
        .await;

    // The failing handler is excluded from the count; its sibling runs.
    assert_eq!(delivered, 1);
    assert_eq!(survivor.load(Ordering::SeqCst), 1);
    assert_eq!(bus.stats().failed_deliveries, 1);
}

#[tokio::test]
async fn test_broadcast_reaches_every_topic_without_dedup() {
    let bus = MessageBus::default();
    let counter = Arc::new(AtomicUsize::new(0));

    for topic in ["alpha", "beta"] {
        let counter = Arc::clone(&counter);
        bus.subscribe(
            "listener",
            topic,
            handler_fn(move |_message| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
            None,
        );
    }

    let delivered = bus
        .broadcast(Message::new(
            MessageKind::Broadcast,
            "tester",
            ContentMap::new(),
        ))
        .await;

    // Same subscriber on two topics sees the broadcast twice.
    assert_eq!(delivered, 2);
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let bus = MessageBus::default();
    let counter = Arc::new(AtomicUsize::new(0));

    let cloned = Arc::clone(&counter);
    let id = bus.subscribe(
        "listener",
        "events",
        handler_fn(move |_message| {
            let counter = cloned.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }),
        None,
    );

    bus.publish(
        "events",
        Message::new(MessageKind::Event, "tester", ContentMap::new()),
    )
    .await;
    assert!(bus.unsubscribe(id));
    bus.publish(
        "events",
        Message::new(MessageKind::Event, "tester", ContentMap::new()),
    )
    .await;

    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_request_times_out_and_late_respond_is_noop() {
    let bus = MessageBus::default();
    bus.subscribe("sleepy", "sleepy", noop_handler(), None);

    let message = Message::new(MessageKind::Request, "tester", ContentMap::new());
    let correlation_id = message.id;

    let started = Instant::now();
    let result = bus
        .request("sleepy", message, Duration::from_millis(100))
        .await;

    assert!(started.elapsed() >= Duration::from_millis(100));
    assert!(matches!(result, Err(BusError::Timeout(_))));

    // The slot was removed on timeout; resolving it now is a no-op.
    assert!(!bus.respond(correlation_id, json!({"late": true})));
}

#[tokio::test]
async fn test_request_to_unknown_target_fails_immediately() {
    let bus = MessageBus::default();

    let started = Instant::now();
    let result = bus
        .request(
            "nobody",
            Message::new(MessageKind::Request, "tester", ContentMap::new()),
            Duration::from_secs(5),
        )
        .await;

    assert!(matches!(result, Err(BusError::Unreachable(_))));
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[tokio::test]
async fn test_stop_cancels_outstanding_waits() {
    let bus = Arc::new(MessageBus::default());
    bus.subscribe("silent", "silent", noop_handler(), None);

    let waiter = {
        let bus = Arc::clone(&bus);
        tokio::spawn(async move {
            bus.request(
                "silent",
                Message::new(MessageKind::Request, "tester", ContentMap::new()),
                Duration::from_secs(30),
            )
            .await
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    bus.stop();

    let result = waiter.await.expect("waiter task completed");
    assert!(matches!(result, Err(BusError::Cancelled)));
}

// --- protocol --------------------------------------------------------------

#[tokio::test]
async fn test_request_unreachable_target_reports_not_found() {
    let bus = Arc::new(MessageBus::default());
    let caller = CommunicationProtocol::new("caller", Arc::clone(&bus));
    caller.start();

    let started = Instant::now();
    let response = caller
        .request(
            "director",
            MessageType::Ping,
            ContentMap::new(),
            Duration::from_secs(1),
        )
        .await;

    assert!(!response.success);
    assert_eq!(response.status, StatusCode::NotFound);
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[tokio::test]
async fn test_request_response_between_protocols() {
    let bus = Arc::new(MessageBus::default());

    let responder = CommunicationProtocol::new("responder", Arc::clone(&bus));
    responder.register_handler(
        MessageType::DataRequest,
        protocol_fn(|message| async move {
            let reply = message.create_response(
                StatusCode::Success,
                {
                    let mut data = ContentMap::new();
                    data.insert("rows".to_string(), json!(3));
                    data
                },
            );
            Ok(Some(reply))
        }),
    );
    responder.start();

    let caller = CommunicationProtocol::new("caller", Arc::clone(&bus));
    caller.start();

    let response = caller
        .request(
            "responder",
            MessageType::DataRequest,
            ContentMap::new(),
            Duration::from_secs(1),
        )
        .await;

    assert!(response.success);
    assert_eq!(response.status, StatusCode::Success);
    let reply = response.message.expect("reply envelope");
    assert_eq!(reply.payload.data.get("rows"), Some(&json!(3)));
    assert!(reply.header.correlation_id.is_some());
    assert!(response.latency < Duration::from_secs(1));
}

#[tokio::test]
async fn test_handler_error_synthesizes_internal_error_reply() {
    let bus = Arc::new(MessageBus::default());

    let responder = CommunicationProtocol::new("responder", Arc::clone(&bus));
    responder.register_handler(
        MessageType::DataRequest,
        protocol_fn(|_message| async move { anyhow::bail!("database exploded") }),
    );
    responder.start();

    let caller = CommunicationProtocol::new("caller", Arc::clone(&bus));
    caller.start();

    let started = Instant::now();
    let response = caller
        .request(
            "responder",
            MessageType::DataRequest,
            ContentMap::new(),
            Duration::from_secs(5),
        )
        .await;

    // The requester gets an answer well before its timeout, not a hang.
    assert!(!response.success);
    assert_eq!(response.status, StatusCode::InternalError);
    assert!(started.elapsed() < Duration::from_secs(1));

    let reply = response.message.expect("synthesized reply");
    assert_eq!(
        reply.payload.data.get("error"),
        Some(&json!("database exploded"))
    );
}

// --- workflow engine -------------------------------------------------------

#[tokio::test]
async fn test_wait_step_pauses_and_resume_continues() {
    let engine = WorkflowEngine::new();
    let touched = Arc::new(AtomicUsize::new(0));

    let after = Arc::clone(&touched);
    engine
        .register_workflow(
            WorkflowDefinition::new("approval", "Approval flow", "1.0", "prepare")
                .step(
                    WorkflowStep::task(
                        "prepare",
                        "Prepare",
                        task_fn(|_context, _metadata| async {
                            Ok(Some({
                                let mut out = ContentMap::new();
                                out.insert("prepared".to_string(), json!(true));
                                out
                            }))
                        }),
                    )
                    .next("approval"),
                )
                .step(WorkflowStep::wait("approval", "Wait for approval").next("finish"))
                .step(WorkflowStep::task(
                    "finish",
                    "Finish",
                    task_fn(move |_context, _metadata| {
                        let after = after.clone();
                        async move {
                            after.fetch_add(1, Ordering::SeqCst);
                            Ok(None)
                        }
                    }),
                )),
        )
        .expect("valid definition");

    let id = engine
        .create_instance("approval", ContentMap::new())
        .unwrap();
    engine.start_instance(id).await.unwrap();

    let paused = engine.get_instance(id).await.unwrap();
    assert_eq!(paused.status, InstanceStatus::Paused);
    assert_eq!(paused.current_step.as_deref(), Some("approval"));
    assert_eq!(touched.load(Ordering::SeqCst), 0);

    assert!(
        engine
            .resume_instance(id, map(&[("approved", json!(true))]))
            .await
    );

    let finished = engine.get_instance(id).await.unwrap();
    assert_eq!(finished.status, InstanceStatus::Completed);
    assert_eq!(finished.context.get("approved"), Some(&json!(true)));
    assert_eq!(finished.context.get("prepared"), Some(&json!(true)));
    assert_eq!(touched.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_resume_requires_paused_status() {
    let engine = WorkflowEngine::new();
    engine
        .register_workflow(
            WorkflowDefinition::new("plain", "Plain", "1.0", "only").step(WorkflowStep::task(
                "only",
                "Only",
                task_fn(|_context, _metadata| async { Ok(None) }),
            )),
        )
        .unwrap();

    let id = engine.create_instance("plain", ContentMap::new()).unwrap();
    assert!(!engine.resume_instance(id, ContentMap::new()).await);

    engine.start_instance(id).await.unwrap();
    assert_eq!(
        engine.instance_status(id).await,
        Some(InstanceStatus::Completed)
    );
    assert!(!engine.resume_instance(id, ContentMap::new()).await);
    assert!(!engine.cancel_instance(id).await);
}

#[tokio::test]
async fn test_failing_step_exhausts_retry_budget() {
    let engine = WorkflowEngine::new();
    let attempts = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&attempts);
    engine
        .register_workflow(
            WorkflowDefinition::new("doomed", "Doomed", "1.0", "broken").step(
                WorkflowStep::task(
                    "broken",
                    "Broken",
                    task_fn(move |_context, _metadata| {
                        let counter = counter.clone();
                        async move {
                            counter.fetch_add(1, Ordering::SeqCst);
                            anyhow::bail!("always fails")
                        }
                    }),
                )
                .retries(2),
            ),
        )
        .unwrap();

    let id = engine.create_instance("doomed", ContentMap::new()).unwrap();
    engine.start_instance(id).await.unwrap();

    // retry_count = 2 means exactly 3 invocations.
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    let instance = engine.get_instance(id).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Failed);
    assert_eq!(instance.error.as_deref(), Some("always fails"));

    let exec = instance.steps.get("broken").expect("execution record");
    assert_eq!(exec.retry_attempts, 2);
}

#[tokio::test]
async fn test_step_recovers_within_retry_budget() {
    let engine = WorkflowEngine::new();
    let attempts = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&attempts);
    engine
        .register_workflow(
            WorkflowDefinition::new("flaky", "Flaky", "1.0", "retry").step(
                WorkflowStep::task(
                    "retry",
                    "Retry",
                    task_fn(move |_context, _metadata| {
                        let counter = counter.clone();
                        async move {
                            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                                anyhow::bail!("transient failure")
                            }
                            Ok(None)
                        }
                    }),
                )
                .retries(2),
            ),
        )
        .unwrap();

    let id = engine.create_instance("flaky", ContentMap::new()).unwrap();
    engine.start_instance(id).await.unwrap();

    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(
        engine.instance_status(id).await,
        Some(InstanceStatus::Completed)
    );
}

#[tokio::test]
async fn test_parallel_step_joins_all_branches() {
    let engine = WorkflowEngine::new();

    let slow = task_fn(|_context, _metadata| async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(Some({
            let mut out = ContentMap::new();
            out.insert("slow".to_string(), json!(true));
            out
        }))
    });
    let fast = task_fn(|_context, _metadata| async {
        Ok(Some({
            let mut out = ContentMap::new();
            out.insert("fast".to_string(), json!(true));
            out
        }))
    });

    engine
        .register_workflow(
            WorkflowDefinition::new("fanout", "Fan out", "1.0", "split")
                .step(WorkflowStep::parallel("split", "Split").next("slow").next("fast"))
                .step(WorkflowStep::task("slow", "Slow branch", slow))
                .step(WorkflowStep::task("fast", "Fast branch", fast)),
        )
        .unwrap();

    let id = engine.create_instance("fanout", ContentMap::new()).unwrap();
    engine.start_instance(id).await.unwrap();

    let instance = engine.get_instance(id).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Completed);
    assert_eq!(instance.context.get("slow"), Some(&json!(true)));
    assert_eq!(instance.context.get("fast"), Some(&json!(true)));
}

#[tokio::test]
async fn test_decision_step_routes_on_context() {
    let engine = WorkflowEngine::new();

    let decide: DecisionFn = Arc::new(|context| {
        context
            .get("kind")
            .and_then(|value| value.as_str())
            .map(|kind| {
                if kind == "image" {
                    "tag_image".to_string()
                } else {
                    "tag_text".to_string()
                }
            })
    });

    let tag = |label: &'static str| {
        task_fn(move |_context, _metadata| async move {
            Ok(Some({
                let mut out = ContentMap::new();
                out.insert("tagged".to_string(), json!(label));
                out
            }))
        })
    };

    engine
        .register_workflow(
            WorkflowDefinition::new("router", "Router", "1.0", "route")
                .step(
                    WorkflowStep::decision("route", "Route", decide)
                        .next("tag_text")
                        .next("tag_image"),
                )
                .step(WorkflowStep::task("tag_text", "Tag text", tag("text")))
                .step(WorkflowStep::task("tag_image", "Tag image", tag("image"))),
        )
        .unwrap();

    let id = engine
        .create_instance("router", map(&[("kind", json!("image"))]))
        .unwrap();
    engine.start_instance(id).await.unwrap();

    let instance = engine.get_instance(id).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Completed);
    assert_eq!(instance.context.get("tagged"), Some(&json!("image")));
}

#[tokio::test]
async fn test_agent_call_resolves_registered_handler() {
    let engine = WorkflowEngine::new();
    engine.register_agent_handler(
        "archiver",
        task_fn(|_context, metadata| async move {
            assert_eq!(metadata.get("step_id"), Some(&json!("archive")));
            Ok(Some({
                let mut out = ContentMap::new();
                out.insert("archived".to_string(), json!(true));
                out
            }))
        }),
    );

    engine
        .register_workflow(
            WorkflowDefinition::new("archive", "Archive", "1.0", "archive")
                .step(WorkflowStep::agent_call("archive", "Archive", "archiver")),
        )
        .unwrap();

    let id = engine.create_instance("archive", ContentMap::new()).unwrap();
    engine.start_instance(id).await.unwrap();

    let instance = engine.get_instance(id).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Completed);
    assert_eq!(instance.context.get("archived"), Some(&json!(true)));
}

#[tokio::test]
async fn test_agent_call_without_registration_fails_instance() {
    let engine = WorkflowEngine::new();
    engine
        .register_workflow(
            WorkflowDefinition::new("orphan", "Orphan", "1.0", "call")
                .step(WorkflowStep::agent_call("call", "Call", "missing_type").retries(1)),
        )
        .unwrap();

    let id = engine.create_instance("orphan", ContentMap::new()).unwrap();
    engine.start_instance(id).await.unwrap();

    let instance = engine.get_instance(id).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Failed);
    assert!(instance
        .error
        .as_deref()
        .unwrap_or_default()
        .contains("missing_type"));
    assert_eq!(instance.steps.get("call").unwrap().retry_attempts, 1);
}

// --- agent lifecycle -------------------------------------------------------

#[tokio::test]
async fn test_initialize_twice_rejected_with_state_unchanged() {
    let bus = Arc::new(MessageBus::default());
    let agent = ManagedAgent::new("director", "director", Arc::clone(&bus), Arc::new(NoopHooks));

    assert!(agent.initialize().await);
    assert_eq!(agent.lifecycle_state(), AgentState::Ready);

    assert!(!agent.initialize().await);
    assert_eq!(agent.lifecycle_state(), AgentState::Ready);

    let log = agent.operation_log();
    let last = log.last().expect("rejection logged");
    assert!(!last.success);
}

#[tokio::test]
async fn test_started_agent_answers_ping_and_status() {
    let bus = Arc::new(MessageBus::default());
    let agent = ManagedAgent::new("tagger-1", "tagger", Arc::clone(&bus), Arc::new(NoopHooks));
    assert!(agent.initialize().await);
    assert!(agent.start().await);

    let caller = CommunicationProtocol::new("caller", Arc::clone(&bus));
    caller.start();

    let pong = caller.ping("tagger-1", Duration::from_secs(1)).await;
    assert!(pong.success);
    assert_eq!(pong.status, StatusCode::Success);

    let status = caller
        .request(
            "tagger-1",
            MessageType::AgentStatus,
            ContentMap::new(),
            Duration::from_secs(1),
        )
        .await;
    assert!(status.success);

    let reply = status.message.expect("status reply");
    assert_eq!(reply.payload.data.get("agent_id"), Some(&json!("tagger-1")));
    assert_eq!(
        reply.payload.data.get("lifecycle_state"),
        Some(&json!("running"))
    );

    assert!(agent.stop().await);
    assert_eq!(agent.lifecycle_state(), AgentState::Stopped);

    // After stop the agent is unreachable again.
    let gone = caller.ping("tagger-1", Duration::from_secs(1)).await;
    assert_eq!(gone.status, StatusCode::NotFound);
}

//! End-to-end coverage of wrap/expose over an in-process channel pair.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use tether::{
    CallError, Endpoint, Error, ExposeOptions, Function, MessageChannel, Object, Operation,
    OriginPattern, Packet, Target, Value, WrapOptions, expose, expose_with, wrap, wrap_with,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn as_i64(value: &Value) -> Option<i64> {
    value.as_json().and_then(|v| v.as_i64())
}

fn adder() -> Value {
    Value::exposed(Function::new(|args| async move {
        let a = args[0].as_json().and_then(|v| v.as_i64()).unwrap_or(0);
        let b = args[1].as_json().and_then(|v| v.as_i64()).unwrap_or(0);
        Ok(Value::json(a + b))
    }))
}

struct Counter {
    n: Arc<Mutex<i64>>,
}

#[async_trait]
impl Target for Counter {
    fn get(&self, property: &str) -> Result<Value, CallError> {
        match property {
            "inc" => {
                let n = self.n.clone();
                Ok(Value::exposed(Function::new(move |_args| {
                    let n = n.clone();
                    async move {
                        let mut guard = n.lock().unwrap();
                        *guard += 1;
                        Ok(Value::json(*guard))
                    }
                })))
            }
            "n" => Ok(Value::json(*self.n.lock().unwrap())),
            other => Err(CallError::type_error(format!("no such property: {other}"))),
        }
    }
}

fn counter_class() -> Value {
    Value::exposed(tether::Constructor::new(|args| {
        let start = args
            .first()
            .and_then(|v| v.as_json())
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        Ok(Arc::new(Counter {
            n: Arc::new(Mutex::new(start)),
        }) as Arc<dyn Target>)
    }))
}

#[tokio::test]
async fn apply_round_trips_through_the_channel() {
    init_tracing();
    let (served, held) = MessageChannel::new();
    expose(
        Arc::new(Object::new().with("add", adder())),
        Arc::new(served),
    );

    let remote = wrap(Arc::new(held));
    let sum = remote
        .invoke("add", vec![Value::json(2), Value::json(3)])
        .await
        .unwrap();
    assert_eq!(as_i64(&sum), Some(5));
}

#[tokio::test]
async fn get_walks_into_plain_data() {
    let (served, held) = MessageChannel::new();
    expose(
        Arc::new(Object::new().with("config", Value::json(json!({"retries": 3, "tags": ["a"]})))),
        Arc::new(served),
    );

    let remote = wrap(Arc::new(held));
    let retries = remote.get("config").get("retries").fetch().await.unwrap();
    assert_eq!(as_i64(&retries), Some(3));

    let tag = remote
        .get("config")
        .get("tags")
        .get("0")
        .fetch()
        .await
        .unwrap();
    assert_eq!(tag.as_json(), Some(&json!("a")));
}

#[tokio::test]
async fn set_is_visible_to_later_gets() {
    let (served, held) = MessageChannel::new();
    expose(Arc::new(Object::new()), Arc::new(served));

    let remote = wrap(Arc::new(held));
    remote.set("x", Value::json(42)).await.unwrap();
    let x = remote.get("x").fetch().await.unwrap();
    assert_eq!(as_i64(&x), Some(42));
}

#[tokio::test]
async fn construct_returns_a_live_remote_instance() {
    init_tracing();
    let (served, held) = MessageChannel::new();
    expose(
        Arc::new(Object::new().with("Counter", counter_class())),
        Arc::new(served),
    );

    let remote = wrap(Arc::new(held));
    let counter = remote
        .get("Counter")
        .construct(vec![Value::json(5)])
        .await
        .unwrap();

    assert_eq!(as_i64(&counter.invoke("inc", vec![]).await.unwrap()), Some(6));
    assert_eq!(as_i64(&counter.invoke("inc", vec![]).await.unwrap()), Some(7));
}

#[tokio::test]
async fn thrown_errors_reject_the_caller_with_the_original_message() {
    let (served, held) = MessageChannel::new();
    expose(
        Arc::new(Object::new().with(
            "explode",
            Value::exposed(Function::new(|_args| async move {
                Err::<Value, _>(CallError::new("Error", "boom"))
            })),
        )),
        Arc::new(served),
    );

    let remote = wrap(Arc::new(held));
    let err = remote.invoke("explode", vec![]).await.unwrap_err();
    match err {
        Error::Remote(CallError::Error { name, message, .. }) => {
            assert_eq!(name, "Error");
            assert_eq!(message, "boom");
        }
        other => panic!("expected the thrown error, got {other:?}"),
    }
}

#[tokio::test]
async fn concurrent_calls_resolve_by_id_not_arrival_order() {
    let (served, held) = MessageChannel::new();
    expose(
        Arc::new(Object::new().with(
            "slow",
            Value::exposed(Function::new(|args| async move {
                let delay = args[0].as_json().and_then(|v| v.as_u64()).unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok(args.into_iter().nth(1).unwrap_or(Value::null()))
            })),
        )),
        Arc::new(served),
    );

    let remote = wrap(Arc::new(held));
    let slowest = remote.invoke("slow", vec![Value::json(60), Value::json("first")]);
    let middle = remote.invoke("slow", vec![Value::json(30), Value::json("second")]);
    let fastest = remote.invoke("slow", vec![Value::json(10), Value::json("third")]);

    let (slowest, middle, fastest) = tokio::join!(slowest, middle, fastest);
    assert_eq!(slowest.unwrap().as_json(), Some(&json!("first")));
    assert_eq!(middle.unwrap().as_json(), Some(&json!("second")));
    assert_eq!(fastest.unwrap().as_json(), Some(&json!("third")));
}

#[tokio::test]
async fn callbacks_cross_the_channel_as_live_functions() {
    init_tracing();
    let (served, held) = MessageChannel::new();
    expose(
        Arc::new(Object::new().with(
            "apply_twice",
            Value::exposed(Function::new(|mut args| async move {
                let Value::Remote(callback) = args.remove(0) else {
                    return Err(CallError::type_error("expected a callback"));
                };
                let seed = args.remove(0);
                let once = callback
                    .call(vec![seed])
                    .await
                    .map_err(|e| CallError::new("Error", e.to_string()))?;
                callback
                    .call(vec![once])
                    .await
                    .map_err(|e| CallError::new("Error", e.to_string()))
            })),
        )),
        Arc::new(served),
    );

    let remote = wrap(Arc::new(held));
    let increment = Value::exposed(Function::new(|args| async move {
        let n = args[0].as_json().and_then(|v| v.as_i64()).unwrap_or(0);
        Ok(Value::json(n + 1))
    }));

    let result = remote
        .invoke("apply_twice", vec![increment, Value::json(5)])
        .await
        .unwrap();
    assert_eq!(as_i64(&result), Some(7));
}

#[tokio::test]
async fn release_sends_exactly_one_frame_and_then_fails_locally() {
    let (served, held) = MessageChannel::new();
    let served = Arc::new(served);

    let release_frames = Arc::new(AtomicUsize::new(0));
    let seen = release_frames.clone();
    served.add_listener(Arc::new(move |message| {
        if let Packet::Request(request) = &message.data {
            if matches!(request.op, Operation::Release { .. }) {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        }
    }));
    expose(
        Arc::new(Object::new().with("add", adder())),
        served.clone(),
    );

    let remote = wrap(Arc::new(held));
    remote
        .invoke("add", vec![Value::json(1), Value::json(1)])
        .await
        .unwrap();

    remote.release().await.unwrap();
    assert_eq!(release_frames.load(Ordering::SeqCst), 1);

    let err = remote.release().await.unwrap_err();
    assert!(matches!(err, Error::Released));
    assert_eq!(release_frames.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn released_handles_fail_fast_without_touching_the_wire() {
    let (served, held) = MessageChannel::new();
    expose(
        Arc::new(Object::new().with("add", adder())),
        Arc::new(served),
    );

    let root = wrap(Arc::new(held));
    let child = root.get("x");
    child.release().await.unwrap();

    assert!(matches!(child.fetch().await, Err(Error::Released)));
    assert!(matches!(child.call(vec![]).await, Err(Error::Released)));
    assert!(matches!(
        child.set("y", Value::json(1)).await,
        Err(Error::Released)
    ));

    // other handles on the endpoint stay usable
    let sum = root
        .invoke("add", vec![Value::json(2), Value::json(2)])
        .await
        .unwrap();
    assert_eq!(as_i64(&sum), Some(4));
}

#[tokio::test]
async fn bind_drops_the_segment_without_a_network_call() {
    let (served, held) = MessageChannel::new();
    expose(
        Arc::new(Object::new().with("add", adder())),
        Arc::new(served),
    );

    let remote = wrap(Arc::new(held));
    let bound = remote
        .get("add")
        .get("bind")
        .call(vec![])
        .await
        .unwrap()
        .into_remote()
        .unwrap();
    assert_eq!(bound.path(), ["add"]);

    let sum = bound
        .call(vec![Value::json(4), Value::json(5)])
        .await
        .unwrap();
    assert_eq!(as_i64(&sum), Some(9));
}

#[tokio::test]
async fn endpoint_request_yields_an_independent_channel() {
    let (served, held) = MessageChannel::new();
    expose(
        Arc::new(Object::new().with("add", adder())),
        Arc::new(served),
    );

    let first = wrap(Arc::new(held));
    let port = first.endpoint().await.unwrap();

    let second = wrap(Arc::new(port));
    let sum = second
        .invoke("add", vec![Value::json(10), Value::json(20)])
        .await
        .unwrap();
    assert_eq!(as_i64(&sum), Some(30));

    // the original handle is unaffected
    let sum = first
        .invoke("add", vec![Value::json(1), Value::json(2)])
        .await
        .unwrap();
    assert_eq!(as_i64(&sum), Some(3));
}

#[tokio::test]
async fn disallowed_origins_are_dropped_without_a_reply() {
    init_tracing();
    let (served, held) = MessageChannel::new();
    held.set_origin("https://intruder.example");
    expose_with(
        Arc::new(Object::new().with("add", adder())),
        Arc::new(served),
        ExposeOptions {
            allowed_origins: vec![OriginPattern::Exact("https://app.example".to_string())],
            ..ExposeOptions::default()
        },
    );

    let remote = wrap_with(
        Arc::new(held),
        WrapOptions {
            reply_timeout: Some(Duration::from_millis(100)),
            ..WrapOptions::default()
        },
    );
    let err = remote
        .invoke("add", vec![Value::json(1), Value::json(1)])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ReplyTimeout));
}

#[tokio::test]
async fn allowed_origins_may_be_patterns() {
    let (served, held) = MessageChannel::new();
    held.set_origin("https://staging.example");
    expose_with(
        Arc::new(Object::new().with("add", adder())),
        Arc::new(served),
        ExposeOptions {
            allowed_origins: vec![OriginPattern::Pattern(
                regex_lite::Regex::new(r"^https://[a-z]+\.example$").unwrap(),
            )],
            ..ExposeOptions::default()
        },
    );

    let remote = wrap(Arc::new(held));
    let sum = remote
        .invoke("add", vec![Value::json(6), Value::json(1)])
        .await
        .unwrap();
    assert_eq!(as_i64(&sum), Some(7));
}

#[tokio::test]
async fn unserializable_returns_become_a_type_error_reply() {
    let (_keep, orphan) = MessageChannel::new();
    let dangling = wrap(Arc::new(orphan));

    let (served, held) = MessageChannel::new();
    expose(
        Arc::new(Object::new().with(
            "leak",
            Value::exposed(Function::new(move |_args| {
                let dangling = dangling.clone();
                async move { Ok(Value::Remote(dangling)) }
            })),
        )),
        Arc::new(served),
    );

    let remote = wrap(Arc::new(held));
    let err = remote.invoke("leak", vec![]).await.unwrap_err();
    match err {
        Error::Remote(CallError::Error { name, message, .. }) => {
            assert_eq!(name, "TypeError");
            assert_eq!(message, "Unserializable return value");
        }
        other => panic!("expected the generic type error, got {other:?}"),
    }
}

#[tokio::test]
async fn finalize_runs_when_the_exposed_endpoint_is_released() {
    struct Tracked {
        finalized: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Target for Tracked {
        fn get(&self, property: &str) -> Result<Value, CallError> {
            Err(CallError::type_error(format!(
                "no such property: {property}"
            )))
        }
        fn finalize(&self) {
            self.finalized.fetch_add(1, Ordering::SeqCst);
        }
    }

    let finalized = Arc::new(AtomicUsize::new(0));
    let (served, held) = MessageChannel::new();
    expose(
        Arc::new(Tracked {
            finalized: finalized.clone(),
        }),
        Arc::new(served),
    );

    let remote = wrap(Arc::new(held));
    remote.release().await.unwrap();
    assert_eq!(finalized.load(Ordering::SeqCst), 1);
}

//! Client behaviour against a scripted in-memory server.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use horizon_lattice_graphql_ws::{
    Client, ClientConfig, ClientError, CloseCode, CloseEvent, GraphQLError, GraphQLRequest,
    Message, StatusEvent, StatusKind, SubscriptionMessage, TransportFrame,
};
use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use tokio::sync::mpsc;

use common::{InstantTransport, MockServer, SinkEvent, mock, recorder, settle};

fn query() -> GraphQLRequest {
    GraphQLRequest::subscription("subscription { ticks }")
}

/// A lazy client on the mock transport that retries without waiting.
fn client_with(configure: impl FnOnce(ClientConfig) -> ClientConfig) -> (Client, MockServer) {
    let (transport, server) = mock();
    let config = ClientConfig::new("ws://mock/graphql")
        .transport(transport)
        .retry_wait(|_| async {});
    let client = Client::new(configure(config)).expect("valid config");
    (client, server)
}

fn assert_closed_with(event: SinkEvent, code: CloseCode) {
    match event {
        SinkEvent::Error(ClientError::Closed(close)) => assert_eq!(close.code, code, "{close}"),
        other => panic!("expected close {code}, got {other:?}"),
    }
}

#[tokio::test]
async fn test_normal_close_completes_without_retry() {
    let (client, mut server) = client_with(|config| config.retry_attempts(2));
    let (sink, mut recording) = recorder();
    let _subscription = client.subscribe(query(), sink);

    let mut socket = server.accept().await;
    socket.expect_subscribe().await;
    socket.close(1000, "bye");

    assert!(matches!(recording.next_event().await, SinkEvent::Complete));
    settle().await;
    assert_eq!(server.connects(), 1);
    assert!(server.try_next_socket().is_none());
}

#[tokio::test]
async fn test_normal_close_during_handshake_completes() {
    let (client, mut server) = client_with(|config| config.retry_attempts(2));
    let (sink, mut recording) = recorder();
    let _subscription = client.subscribe(query(), sink);

    let mut socket = server.next_socket().await;
    socket.recv_message().await;
    socket.close(1000, "");

    assert!(matches!(recording.next_event().await, SinkEvent::Complete));
    assert_eq!(server.connects(), 1);
}

#[tokio::test]
async fn test_next_reaches_sink_once() {
    let (client, mut server) = client_with(|config| config);
    let (sink, mut recording) = recorder();
    let subscription = client.subscribe(query(), sink);

    let mut socket = server.accept().await;
    let id = socket.expect_subscribe().await;
    assert_eq!(id, subscription.id());

    socket.send_next("someone-else", json!({"x": 0}));
    socket.send_next(&id, json!({"x": 1}));
    socket.send_complete(&id);

    match recording.next_event().await {
        SinkEvent::Next(response) => assert_eq!(response.raw_data(), Some(&json!({"x": 1}))),
        other => panic!("expected next, got {other:?}"),
    }
    assert!(matches!(recording.next_event().await, SinkEvent::Complete));
    settle().await;
    assert!(recording.drain().is_empty());

    // The last lock is gone, so the socket is closed right away.
    assert_eq!(socket.expect_close().await, CloseEvent::normal());
}

#[tokio::test]
async fn test_concurrent_subscribes_share_one_handshake() {
    let (client, mut server) = client_with(|config| config);
    let (first, _first_events) = recorder();
    let (second, _second_events) = recorder();
    let a = client.subscribe(query(), first);
    let b = client.subscribe(query(), second);

    let mut socket = server.accept().await;
    let ids = [socket.expect_subscribe().await, socket.expect_subscribe().await];
    assert_ne!(ids[0], ids[1]);
    assert!(ids.contains(&a.id().to_string()));
    assert!(ids.contains(&b.id().to_string()));

    settle().await;
    assert_eq!(server.connects(), 1);
    assert!(server.try_next_socket().is_none());
}

#[tokio::test]
async fn test_unauthorized_close_is_not_retried() {
    let (client, mut server) = client_with(|config| config.retry_attempts(5));
    let (sink, mut recording) = recorder();
    let _subscription = client.subscribe(query(), sink);

    let mut socket = server.accept().await;
    socket.expect_subscribe().await;
    socket.close(4401, "Unauthorized");

    assert_closed_with(recording.next_event().await, CloseCode::Unauthorized);
    settle().await;
    assert_eq!(server.connects(), 1);
}

#[tokio::test]
async fn test_retries_are_bounded() {
    let waits = Arc::new(Mutex::new(Vec::new()));
    let recorded = waits.clone();
    let (transport, server) = mock();
    let client = Client::new(
        ClientConfig::new("ws://mock/graphql")
            .transport(transport)
            .retry_attempts(2)
            .retry_wait(move |retries| {
                recorded.lock().push(retries);
                async {}
            }),
    )
    .unwrap();

    let closed = Arc::new(AtomicUsize::new(0));
    let counter = closed.clone();
    client.on(StatusKind::Closed, move |event| {
        if let StatusEvent::Closed(close) = event {
            assert_eq!(close.code, CloseCode::Abnormal);
        }
        counter.fetch_add(1, Ordering::SeqCst);
    });

    for _ in 0..3 {
        server.fail_next_connect(ClientError::Transport("connection refused".into()));
    }
    let (sink, mut recording) = recorder();
    let _subscription = client.subscribe(query(), sink);

    assert_closed_with(recording.next_event().await, CloseCode::Abnormal);
    assert_eq!(server.connects(), 3);
    assert_eq!(*waits.lock(), vec![0, 1]);
    assert_eq!(closed.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_resubscribes_after_retryable_close() {
    let (client, mut server) = client_with(|config| config);
    let (sink, mut recording) = recorder();
    let _subscription = client.subscribe(query(), sink);

    let mut first = server.accept().await;
    let id = first.expect_subscribe().await;
    first.close(1001, "Going away");

    let mut second = server.accept().await;
    assert_eq!(second.expect_subscribe().await, id);
    second.send_next(&id, json!({"x": 2}));

    match recording.next_event().await {
        SinkEvent::Next(response) => assert_eq!(response.raw_data(), Some(&json!({"x": 2}))),
        other => panic!("expected next, got {other:?}"),
    }
    assert_eq!(server.connects(), 2);
}

#[tokio::test]
async fn test_socket_closes_with_the_last_lock() {
    let (client, mut server) = client_with(|config| config);
    let (first, mut first_events) = recorder();
    let (second, _second_events) = recorder();
    let a = client.subscribe(query(), first);
    let b = client.subscribe(query(), second);

    let mut socket = server.accept().await;
    socket.expect_subscribe().await;
    socket.expect_subscribe().await;

    a.cancel();
    assert_eq!(
        socket.recv_message().await,
        Message::Complete { id: a.id().into() }
    );
    socket.send_next(a.id(), json!({"late": true}));
    settle().await;
    assert!(first_events.drain().is_empty());
    assert!(a.is_terminated());

    b.cancel();
    assert_eq!(
        socket.recv_message().await,
        Message::Complete { id: b.id().into() }
    );
    assert_eq!(socket.expect_close().await, CloseEvent::normal());
}

#[tokio::test(start_paused = true)]
async fn test_keep_alive_delays_the_close() {
    let (client, mut server) = client_with(|config| config.keep_alive(Duration::from_secs(10)));

    let (sink, mut recording) = recorder();
    client.subscribe(query(), sink);
    let mut socket = server.accept().await;
    let id = socket.expect_subscribe().await;
    socket.send_complete(&id);
    assert!(matches!(recording.next_event().await, SinkEvent::Complete));

    // Reused within the keepalive window.
    tokio::time::sleep(Duration::from_secs(5)).await;
    let (sink, mut recording) = recorder();
    client.subscribe(query(), sink);
    let id = socket.expect_subscribe().await;
    assert_eq!(server.connects(), 1);

    // The first timer expires without closing, the lock is held again.
    tokio::time::sleep(Duration::from_secs(6)).await;
    socket.send_complete(&id);
    assert!(matches!(recording.next_event().await, SinkEvent::Complete));

    let released = tokio::time::Instant::now();
    assert_eq!(socket.expect_close().await, CloseEvent::normal());
    assert!(released.elapsed() >= Duration::from_secs(10));
    assert_eq!(server.connects(), 1);
}

#[tokio::test]
async fn test_server_error_is_terminal() {
    let (client, mut server) = client_with(|config| config);
    let (sink, mut recording) = recorder();
    let _subscription = client.subscribe(query(), sink);

    let mut socket = server.accept().await;
    let id = socket.expect_subscribe().await;
    socket.send(&Message::Error {
        id: id.clone(),
        payload: vec![GraphQLError::new("boom")],
    });
    socket.send_complete(&id);
    socket.send_next(&id, json!({"x": 3}));

    match recording.next_event().await {
        SinkEvent::Error(ClientError::GraphQL(errors)) => {
            assert_eq!(errors.len(), 1);
            assert_eq!(errors[0].message, "boom");
        }
        other => panic!("expected graphql error, got {other:?}"),
    }
    settle().await;
    assert!(recording.drain().is_empty());
    assert_eq!(socket.expect_close().await, CloseEvent::normal());
}

#[tokio::test]
async fn test_cancel_while_connecting() {
    let (client, mut server) = client_with(|config| config);
    let (sink, mut recording) = recorder();
    let subscription = client.subscribe(query(), sink);
    subscription.cancel();

    let mut socket = server.accept().await;
    // No subscribe is sent; the lock is dropped straight away.
    assert_eq!(
        socket.recv().await,
        Some(TransportFrame::Close(CloseEvent::normal()))
    );
    settle().await;
    assert!(recording.drain().is_empty());
}

#[tokio::test]
async fn test_non_lazy_client_connects_eagerly() {
    let (transport, mut server) = mock();
    let (connected_tx, mut connected) = mpsc::unbounded_channel();
    let failures = Arc::new(AtomicUsize::new(0));
    let counter = failures.clone();
    let client = Client::new(
        ClientConfig::new("ws://mock/graphql")
            .transport(transport)
            .lazy(false)
            .on_connected(move |event| {
                if let StatusEvent::Connected { socket, .. } = event {
                    let _ = connected_tx.send(socket.id());
                }
            })
            .on_non_lazy_error(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
    )
    .unwrap();

    let mut socket = server.accept().await;
    connected.recv().await.expect("connected event");

    // A subscription rides on the same socket, and finishing it keeps the
    // socket open.
    let (sink, mut recording) = recorder();
    client.subscribe(query(), sink);
    let id = socket.expect_subscribe().await;
    socket.send_complete(&id);
    assert!(matches!(recording.next_event().await, SinkEvent::Complete));
    settle().await;
    assert_eq!(server.connects(), 1);

    client.dispose().await;
    assert_eq!(socket.expect_close().await, CloseEvent::normal());
    settle().await;
    assert_eq!(failures.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_non_lazy_fatal_close_reaches_error_handler() {
    let (transport, mut server) = mock();
    let (errors_tx, mut errors) = mpsc::unbounded_channel();
    let _client = Client::new(
        ClientConfig::new("ws://mock/graphql")
            .transport(transport)
            .lazy(false)
            .on_non_lazy_error(move |err| {
                let _ = errors_tx.send(err.clone());
            }),
    )
    .unwrap();

    let socket = server.accept().await;
    socket.close(4401, "Unauthorized");

    match errors.recv().await {
        Some(ClientError::Closed(close)) => assert_eq!(close.code, CloseCode::Unauthorized),
        other => panic!("expected unauthorized close, got {other:?}"),
    }
    settle().await;
    assert_eq!(server.connects(), 1);
}

#[tokio::test]
async fn test_dispose_completes_subscriptions() {
    let (client, mut server) = client_with(|config| config);
    let (sink, mut recording) = recorder();
    let _subscription = client.subscribe(query(), sink);

    let mut socket = server.accept().await;
    socket.expect_subscribe().await;

    client.dispose().await;
    assert!(client.is_disposed());
    assert_eq!(socket.expect_close().await, CloseEvent::normal());
    assert!(matches!(recording.next_event().await, SinkEvent::Complete));

    let (sink, mut recording) = recorder();
    client.subscribe(query(), sink);
    assert!(matches!(recording.next_event().await, SinkEvent::Complete));
    assert_eq!(server.connects(), 1);
}

#[tokio::test]
async fn test_unexpected_first_message_is_rejected() {
    let (client, mut server) = client_with(|config| config.retry_attempts(3));
    let (sink, mut recording) = recorder();
    let _subscription = client.subscribe(query(), sink);

    let mut socket = server.next_socket().await;
    socket.recv_message().await;
    socket.send_next("1", json!({}));

    let close = socket.expect_close().await;
    assert_eq!(close.code, CloseCode::BadRequest);
    assert_eq!(close.reason, "First message cannot be of type next");
    assert_closed_with(recording.next_event().await, CloseCode::BadRequest);
    assert_eq!(server.connects(), 1);
}

#[tokio::test]
async fn test_invalid_frame_closes_socket() {
    let (client, mut server) = client_with(|config| config);
    let (sink, mut recording) = recorder();
    let _subscription = client.subscribe(query(), sink);

    let mut socket = server.accept().await;
    socket.expect_subscribe().await;
    socket.send_text(r#"{"type":"next","id":"1"}"#);

    assert_eq!(socket.expect_close().await.code, CloseCode::BadRequest);
    assert_closed_with(recording.next_event().await, CloseCode::BadRequest);
}

#[tokio::test]
async fn test_connection_params_are_sent() {
    let (client, mut server) = client_with(|config| {
        config.connection_params_with(|| async {
            let mut params = Map::new();
            params.insert("token".into(), Value::from("secret"));
            Ok::<_, String>(Some(params))
        })
    });
    let (sink, _recording) = recorder();
    let _subscription = client.subscribe(query(), sink);

    let mut socket = server.next_socket().await;
    match socket.ack().await {
        Message::ConnectionInit { payload } => {
            assert_eq!(payload.expect("payload")["token"], "secret");
        }
        other => panic!("expected connection_init, got {other:?}"),
    }
}

#[tokio::test]
async fn test_failing_connection_params_close_the_socket() {
    let (client, mut server) = client_with(|config| {
        config.connection_params_with(|| async {
            Err::<Option<Map<String, Value>>, _>("token expired".to_string())
        })
    });
    let (sink, mut recording) = recorder();
    let _subscription = client.subscribe(query(), sink);

    let mut socket = server.next_socket().await;
    let close = socket.expect_close().await;
    assert_eq!(close.code, CloseCode::BadRequest);
    assert!(close.reason.contains("token expired"), "{}", close.reason);
    assert_closed_with(recording.next_event().await, CloseCode::BadRequest);
}

#[tokio::test]
async fn test_status_events_in_order() {
    let (client, mut server) = client_with(|config| config);
    let events = Arc::new(Mutex::new(Vec::new()));
    for kind in [StatusKind::Connecting, StatusKind::Connected, StatusKind::Closed] {
        let events = events.clone();
        client.on(kind, move |event| events.lock().push(event.kind()));
    }

    let (sink, mut recording) = recorder();
    client.subscribe(query(), sink);
    let mut socket = server.accept().await;
    let id = socket.expect_subscribe().await;
    socket.send_complete(&id);
    assert!(matches!(recording.next_event().await, SinkEvent::Complete));
    socket.expect_close().await;
    settle().await;

    assert_eq!(
        *events.lock(),
        vec![StatusKind::Connecting, StatusKind::Connected, StatusKind::Closed]
    );
}

#[tokio::test]
async fn test_colliding_ids_are_skipped() {
    let counter = Arc::new(AtomicUsize::new(0));
    let ids = counter.clone();
    let (client, mut server) = client_with(move |config| {
        // "a", "a", "b", ...
        config.generate_id(move || match ids.fetch_add(1, Ordering::SeqCst) {
            0 | 1 => "a".to_string(),
            n => format!("id-{n}"),
        })
    });

    let (first, _first_events) = recorder();
    let (second, _second_events) = recorder();
    let a = client.subscribe(query(), first);
    let b = client.subscribe(query(), second);
    assert_eq!(a.id(), "a");
    assert_eq!(b.id(), "id-2");

    let mut socket = server.accept().await;
    let mut sent = vec![socket.expect_subscribe().await, socket.expect_subscribe().await];
    sent.sort();
    assert_eq!(sent, vec!["a".to_string(), "id-2".to_string()]);
}

#[tokio::test]
async fn test_exhausted_ids_fail_the_subscription() {
    let (client, mut server) = client_with(|config| config.generate_id(|| "same".into()));
    let (first, _first_events) = recorder();
    let _a = client.subscribe(query(), first);

    let (second, mut recording) = recorder();
    let b = client.subscribe(query(), second);
    assert!(b.is_terminated());
    match recording.next_event().await {
        SinkEvent::Error(ClientError::DuplicateId(id)) => assert_eq!(id, "same"),
        other => panic!("expected duplicate id, got {other:?}"),
    }

    let mut socket = server.accept().await;
    assert_eq!(socket.expect_subscribe().await, "same");
}

#[tokio::test]
async fn test_subscription_stream() {
    let (client, mut server) = client_with(|config| config);
    let mut stream = client.subscribe_stream(query());

    let mut socket = server.accept().await;
    let id = socket.expect_subscribe().await;
    assert_eq!(id, stream.id());
    socket.send_next(&id, json!({"n": 1}));
    socket.send_next(&id, json!({"n": 2}));
    socket.send_complete(&id);

    let mut seen = Vec::new();
    while let Some(message) = stream.next().await {
        match message {
            SubscriptionMessage::Data(response) => seen.push(response.field::<u64>("n").unwrap()),
            SubscriptionMessage::Complete => break,
            SubscriptionMessage::Error(err) => panic!("{err}"),
        }
    }
    assert_eq!(seen, vec![1, 2]);
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn test_dropping_stream_cancels() {
    let (client, mut server) = client_with(|config| config);
    let stream = client.subscribe_stream(query());

    let mut socket = server.accept().await;
    let id = socket.expect_subscribe().await;
    drop(stream);

    assert_eq!(socket.recv_message().await, Message::Complete { id });
    assert_eq!(socket.expect_close().await, CloseEvent::normal());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_immediate_replies_are_delivered() {
    for round in 0..500 {
        let client = Client::new(
            ClientConfig::new("ws://instant/graphql")
                .transport(InstantTransport)
                .retry_attempts(0),
        )
        .expect("valid config");
        let mut stream = client.subscribe_stream(query());

        let messages = tokio::time::timeout(Duration::from_secs(10), async {
            let mut messages = Vec::new();
            while let Some(message) = stream.next().await {
                messages.push(message);
            }
            messages
        })
        .await
        .unwrap_or_else(|_| panic!("round {round}: subscription never completed"));

        match messages.as_slice() {
            [SubscriptionMessage::Data(response), SubscriptionMessage::Complete] => {
                assert_eq!(response.field::<u64>("n").unwrap(), 1, "round {round}");
            }
            other => panic!("round {round}: expected next then complete, got {other:?}"),
        }
    }
}

mod support;

use std::sync::Arc;
use std::time::Duration;

use hdc_core::{
    BlobSource, InMemoryBlobUploader, InMemoryTransport, Message, SessionError, TransportError,
    TransportOptions,
};
use hdc_session::ActivationState;
use support::{Recorded, builder, record_errors, settle};

#[tokio::test(start_paused = true)]
async fn starts_c2d_once_for_two_listeners() {
    let transport = InMemoryTransport::new();
    let session = builder(&transport).build();

    session.on_message(|_msg: &Message| {}).unwrap();
    session.on_message(|_msg: &Message| {}).unwrap();
    settle().await;

    assert_eq!(transport.enable_calls(), 1);
    assert!(transport.is_c2d_enabled());
    assert_eq!(session.activation_state().await.unwrap(), ActivationState::Active);
}

#[tokio::test(start_paused = true)]
async fn stops_c2d_only_after_last_listener_is_removed() {
    let transport = InMemoryTransport::new();
    let session = builder(&transport).build();

    let first = session.on_message(|_msg: &Message| {}).unwrap();
    let second = session.on_message(|_msg: &Message| {}).unwrap();
    settle().await;
    assert_eq!(transport.enable_calls(), 1);

    session.remove_listener(first).unwrap();
    settle().await;
    assert_eq!(transport.disable_calls(), 0);

    session.remove_listener(second).unwrap();
    settle().await;
    assert_eq!(transport.disable_calls(), 1);
    assert!(!transport.is_c2d_enabled());
    assert_eq!(session.activation_state().await.unwrap(), ActivationState::Inactive);
}

#[tokio::test(start_paused = true)]
async fn remove_all_message_listeners_stops_c2d() {
    let transport = InMemoryTransport::new();
    let session = builder(&transport).build();
    session.on_message(|_msg: &Message| {}).unwrap();
    session.on_message(|_msg: &Message| {}).unwrap();
    settle().await;

    session.remove_all_message_listeners().unwrap();
    settle().await;
    assert_eq!(transport.disable_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn relisten_after_stop_starts_c2d_again() {
    let transport = InMemoryTransport::new();
    let session = builder(&transport).build();
    let id = session.on_message(|_msg: &Message| {}).unwrap();
    settle().await;
    session.remove_listener(id).unwrap();
    settle().await;
    session.on_message(|_msg: &Message| {}).unwrap();
    settle().await;

    assert_eq!(transport.enable_calls(), 2);
    assert_eq!(transport.disable_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn enable_failure_is_emitted_as_error() {
    let transport = InMemoryTransport::new();
    transport.fail_enable(Some(TransportError::other("fake error")));
    let session = builder(&transport).build();
    let errors = record_errors(&session);

    session.on_message(|_msg: &Message| {}).unwrap();
    settle().await;

    assert_eq!(transport.enable_calls(), 1);
    assert_eq!(errors.all(), vec!["other: fake error".to_string()]);
    assert_eq!(session.activation_state().await.unwrap(), ActivationState::Failed);
}

#[tokio::test(start_paused = true)]
async fn disable_failure_is_emitted_as_error() {
    let transport = InMemoryTransport::new();
    transport.fail_disable(Some(TransportError::other("fake error")));
    let session = builder(&transport).build();
    let errors = record_errors(&session);

    let id = session.on_message(|_msg: &Message| {}).unwrap();
    settle().await;
    session.remove_listener(id).unwrap();
    settle().await;

    assert_eq!(transport.disable_calls(), 1);
    assert_eq!(errors.all(), vec!["other: fake error".to_string()]);
}

#[tokio::test]
#[tracing_test::traced_test]
async fn unhandled_errors_are_logged() {
    tokio::time::pause();
    let transport = InMemoryTransport::new();
    transport.fail_enable(Some(TransportError::other("nobody listening")));
    let session = builder(&transport).build();

    session.on_message(|_msg: &Message| {}).unwrap();
    settle().await;

    assert!(logs_contain("session error with no error listener"));
    assert!(logs_contain("nobody listening"));
}

#[tokio::test(start_paused = true)]
async fn messages_reach_every_listener_in_order() {
    let transport = InMemoryTransport::new();
    let session = builder(&transport).build();
    let seen: Recorded<String> = Recorded::default();

    for name in ["first", "second"] {
        let sink = seen.clone();
        session
            .on_message(move |msg: &Message| {
                sink.push(format!("{name}:{}", msg.body_text().unwrap_or_default()));
            })
            .unwrap();
    }
    settle().await;

    transport.emit_message(Message::new("ping"));
    settle().await;

    assert_eq!(seen.all(), vec!["first:ping", "second:ping"]);
}

#[tokio::test(start_paused = true)]
async fn set_options_requires_options() {
    let transport = InMemoryTransport::new();
    let session = builder(&transport).build();

    let err = session.set_options(None).await.unwrap_err();
    assert!(err.is_contract_violation());
    assert_eq!(transport.options_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn set_options_relays_transport_outcome() {
    let transport = InMemoryTransport::new();
    let session = builder(&transport).build();

    let options = TransportOptions {
        model_id: Some("dtmi:com:example:Thermostat;1".into()),
        ..Default::default()
    };
    session.set_options(Some(options.clone())).await.unwrap();
    assert_eq!(transport.applied_options(), vec![options]);

    transport.fail_set_options(Some(TransportError::other("fake error")));
    let err = session
        .set_options(Some(TransportOptions::default()))
        .await
        .unwrap_err();
    assert_eq!(err.as_transport(), Some(&TransportError::other("fake error")));
    assert_eq!(transport.options_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn upload_rejects_falsy_arguments() {
    let transport = InMemoryTransport::new();
    let uploader = InMemoryBlobUploader::new();
    let session = builder(&transport)
        .blob_uploader(Arc::new(uploader.clone()))
        .build();

    let cases: Vec<(&str, Option<BlobSource>, u64)> = vec![
        ("", Some("data".into()), 42),
        ("blobName", None, 42),
        ("blobName", Some(bytes::Bytes::new().into()), 42),
        ("blobName", Some("data".into()), 0),
    ];
    for (name, source, length) in cases {
        let err = session.upload_to_blob(name, source, length).await.unwrap_err();
        assert!(err.is_contract_violation(), "{name:?}/{length}: {err}");
    }
    assert_eq!(uploader.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn upload_relays_uploader_error() {
    let transport = InMemoryTransport::new();
    let uploader = InMemoryBlobUploader::failing("fake error");
    let session = builder(&transport)
        .blob_uploader(Arc::new(uploader.clone()))
        .build();

    let err = session
        .upload_to_blob("blobName", Some("data".into()), 42)
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Upload(_)));
    assert_eq!(err.to_string(), "fake error");
    assert_eq!(uploader.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn upload_succeeds_through_uploader() {
    let transport = InMemoryTransport::new();
    let uploader = InMemoryBlobUploader::new();
    let session = builder(&transport)
        .blob_uploader(Arc::new(uploader.clone()))
        .build();

    let reader = std::io::Cursor::new(b"telemetry-dump".to_vec());
    session
        .upload_to_blob("logs/dump.bin", Some(BlobSource::reader(reader)), 14)
        .await
        .unwrap();

    let uploads = uploader.uploads();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].blob_name, "logs/dump.bin");
    assert_eq!(&uploads[0].data[..], b"telemetry-dump");
}

#[tokio::test(start_paused = true)]
async fn upload_without_uploader_is_invalid_operation() {
    let transport = InMemoryTransport::new();
    let session = builder(&transport).build();

    let err = session
        .upload_to_blob("blobName", Some("data".into()), 4)
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::InvalidOperation(_)));
}

#[tokio::test(start_paused = true)]
async fn close_turns_delivery_off_and_rejects_further_calls() {
    let transport = InMemoryTransport::new();
    let session = builder(&transport).build();
    session.on_message(|_msg: &Message| {}).unwrap();
    settle().await;

    session.close().await.unwrap();
    settle().await;

    assert_eq!(transport.disable_calls(), 1);
    assert!(matches!(session.snapshot().await, Err(SessionError::Closed)));
    assert!(matches!(
        session.on_message(|_msg: &Message| {}),
        Err(SessionError::Closed)
    ));
}

#[tokio::test(start_paused = true)]
async fn close_waits_for_in_flight_enable_then_disables() {
    let transport = InMemoryTransport::new();
    transport.set_latency(Duration::from_millis(50));
    let session = builder(&transport).build();
    session.on_message(|_msg: &Message| {}).unwrap();
    settle().await;
    assert_eq!(session.activation_state().await.unwrap(), ActivationState::Activating);

    session.close().await.unwrap();
    settle().await;

    assert_eq!(transport.enable_calls(), 1);
    assert_eq!(transport.disable_calls(), 1);
    assert!(!transport.is_c2d_enabled());
}

#[tokio::test(start_paused = true)]
async fn close_after_lost_delivery_still_disables() {
    let transport = InMemoryTransport::new();
    let session = builder(&transport).build();
    session.on_message(|_msg: &Message| {}).unwrap();
    settle().await;
    transport.emit_disconnect(TransportError::timeout("link lost"));
    settle().await;

    session.close().await.unwrap();

    assert_eq!(transport.enable_calls(), 1);
    assert_eq!(transport.disable_calls(), 1);
}

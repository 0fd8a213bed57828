//! Buffering behavior through the public sink API: count-, byte- and
//! time-triggered flushes.

mod common;

use std::sync::Arc;

use common::{assert_eventually, test_config, MockStream};
use relay_sink::EventSinkBuilder;

fn payloads(sizes: &[usize]) -> Vec<Vec<u8>> {
    sizes.iter().map(|size| vec![b'e'; *size]).collect()
}

#[tokio::test]
async fn size_triggered_flush_carries_first_three_events() {
    let stream = Arc::new(MockStream::default());
    let mut config = test_config();
    config.buffer.record_limit = 3;
    config.buffer.byte_limit = 1_000;
    config.buffer.time_limit_ms = 60_000;
    config.max_bytes = 1_000;

    let sink = EventSinkBuilder::new(config)
        .with_stream_client(stream.clone())
        .build()
        .await
        .unwrap();

    sink.store_raw_events(payloads(&[200, 200, 200, 200]), "device-1")
        .unwrap();

    // The fourth arrival pushed out the first three
    assert_eventually(|| stream.call_count() == 1, "threshold flush").await;
    assert_eq!(stream.calls.lock().unwrap()[0].len(), 3);

    // The fourth event surfaces with the shutdown flush
    sink.shutdown().await;
    assert_eq!(stream.call_count(), 2);
    assert_eq!(stream.calls.lock().unwrap()[1].len(), 1);
}

#[tokio::test]
async fn byte_triggered_flush_carries_only_the_first_event() {
    let stream = Arc::new(MockStream::default());
    let mut config = test_config();
    config.buffer.record_limit = 100;
    config.buffer.byte_limit = 500;
    config.buffer.time_limit_ms = 60_000;
    config.max_bytes = 500;

    let sink = EventSinkBuilder::new(config)
        .with_stream_client(stream.clone())
        .build()
        .await
        .unwrap();

    sink.store_raw_events(payloads(&[400, 200]), "device-2").unwrap();

    assert_eventually(|| stream.call_count() == 1, "byte threshold flush").await;
    {
        let calls = stream.calls.lock().unwrap();
        assert_eq!(calls[0].len(), 1);
        assert_eq!(calls[0][0].size(), 400);
    }

    sink.shutdown().await;
    let calls = stream.calls.lock().unwrap();
    assert_eq!(calls[1].len(), 1);
    assert_eq!(calls[1][0].size(), 200);
}

#[tokio::test]
async fn time_triggered_flush_fires_without_thresholds() {
    let stream = Arc::new(MockStream::default());
    let sink = EventSinkBuilder::new(test_config())
        .with_stream_client(stream.clone())
        .build()
        .await
        .unwrap();

    sink.store_raw_events(payloads(&[10, 20]), "device-3").unwrap();

    assert_eventually(|| stream.records_seen() == 2, "time-based flush").await;
    assert_eq!(stream.call_count(), 1);

    sink.shutdown().await;
}

#[tokio::test]
async fn partition_key_is_attached_to_every_event() {
    let stream = Arc::new(MockStream::default());
    let sink = EventSinkBuilder::new(test_config())
        .with_stream_client(stream.clone())
        .build()
        .await
        .unwrap();

    sink.store_raw_events(payloads(&[5, 5, 5]), "session-abc").unwrap();
    sink.shutdown().await;

    let calls = stream.calls.lock().unwrap();
    for event in &calls[0] {
        assert_eq!(event.key, "session-abc");
    }
}

#[tokio::test]
async fn stats_reflect_the_pipeline() {
    let stream = Arc::new(MockStream::default());
    let sink = EventSinkBuilder::new(test_config())
        .with_stream_client(stream.clone())
        .build()
        .await
        .unwrap();

    sink.store_raw_events(payloads(&[10, 10, 10, 10]), "device-4")
        .unwrap();
    sink.shutdown().await;

    let stats = sink.stats();
    assert_eq!(stats.events_stored, 4);
    assert_eq!(stats.records_sent_stream, 4);
    assert_eq!(stats.records_failed_stream, 0);
    assert!(stats.batches_flushed >= 1);
}

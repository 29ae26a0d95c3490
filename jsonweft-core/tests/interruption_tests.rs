// Behavior when a document is cut short, cancelled, or carries error tails.

use futures::stream::{self, StreamExt};
use jsonweft_core::{Codec, FixedNonceProvider, RemoteError, RemoteErrorKind, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn codec() -> Codec {
    Codec::with_builtins()
        .unwrap()
        .with_nonce_provider(FixedNonceProvider("w1re".into()))
}

/// Render a full document, then truncate it to the first `lines` lines.
async fn truncated(value: &Value, lines: usize) -> String {
    let text: String = codec()
        .serialize(value)
        .unwrap()
        .collect::<Vec<_>>()
        .await
        .concat();
    text.lines()
        .take(lines)
        .map(|l| format!("{}\n", l))
        .collect()
}

#[tokio::test]
async fn test_truncated_source_interrupts_pending_future() {
    let value = Value::object(vec![
        ("n", Value::from(1i64)),
        ("p", Value::future(async { Ok(Value::from("never")) })),
    ]);
    // keep the header, drop the promise settlement chunks
    let text = truncated(&value, 3).await;

    let codec = codec();
    let mut demux = codec.demultiplexer();
    demux.feed(&text).unwrap();
    demux.finish().unwrap();

    // the synchronous shape survives; only the deferred value errors
    let root = demux.take_root().unwrap().unwrap();
    assert_eq!(root.get("n").unwrap(), Value::from(1i64));
    let err = root.get("p").unwrap().as_future().unwrap().await.unwrap_err();
    assert_eq!(err.kind, RemoteErrorKind::Interrupted);
}

#[tokio::test]
async fn test_truncation_after_root_settles_interrupts_only_deferred_values() {
    let value = Value::future(async { Ok(Value::from("never")) });
    // header only: the root future is live from the placeholder
    let text = truncated(&value, 3).await;

    let root = codec().parse(stream::iter(vec![text])).await.unwrap();
    let err = root.as_future().unwrap().await.unwrap_err();
    assert_eq!(err.kind, RemoteErrorKind::Interrupted);
}

#[tokio::test]
async fn test_abort_distinguishes_itself_from_interruption() {
    let value = Value::stream(stream::iter(vec![Ok(Value::from(1i64))]));
    let text = truncated(&value, 3).await;

    let codec = codec();
    let mut demux = codec.demultiplexer();
    demux.feed(&text).unwrap();
    let root = demux.take_root().unwrap().unwrap();
    demux.abort();
    // abort is idempotent alongside finish
    demux.finish().unwrap();

    let mut items = root.take_stream().unwrap();
    let err = items.next().await.unwrap().unwrap_err();
    assert_eq!(err.kind, RemoteErrorKind::Aborted);
    assert!(err.is_abort());
}

#[tokio::test]
async fn test_rejected_future_round_trips_its_error() {
    let codec = codec();
    let value = Value::object(vec![(
        "p",
        Value::future(async { Err(RemoteError::new("QuotaError", "limit hit")) }),
    )]);

    let fragments = codec.serialize(&value).unwrap();
    let root = codec.parse(fragments).await.unwrap();

    let err = root.get("p").unwrap().as_future().unwrap().await.unwrap_err();
    assert_eq!(err.kind, RemoteErrorKind::Remote);
    assert_eq!(err.name, "QuotaError");
    assert_eq!(err.message, "limit hit");
}

#[tokio::test]
async fn test_consumed_stream_arrives_incomplete() {
    let codec = codec();
    let value = Value::stream(stream::iter(vec![Ok(Value::from(1i64))]));
    // drain the source before serializing, as a second walk of a shared
    // graph would
    let _ = value.take_stream().unwrap();

    let fragments = codec.serialize(&value).unwrap();
    let root = codec.parse(fragments).await.unwrap();

    let mut items = root.take_stream().unwrap();
    let err = items.next().await.unwrap().unwrap_err();
    assert_eq!(err.kind, RemoteErrorKind::Incomplete);
}

#[tokio::test]
async fn test_error_in_one_branch_leaves_siblings_intact() {
    let codec = codec();
    let value = Value::object(vec![
        ("good", Value::future(async { Ok(Value::from(1i64)) })),
        (
            "bad",
            Value::future(async { Err(RemoteError::new("Error", "nope")) }),
        ),
        ("plain", Value::from("still here")),
    ]);

    let fragments = codec.serialize(&value).unwrap();
    let root = codec.parse(fragments).await.unwrap();

    assert_eq!(root.get("plain").unwrap(), Value::from("still here"));
    assert_eq!(
        root.get("good").unwrap().as_future().unwrap().await.unwrap(),
        Value::from(1i64)
    );
    assert!(root.get("bad").unwrap().as_future().unwrap().await.is_err());
}

#[tokio::test]
async fn test_interrupt_hook_counts_unsettled_values() {
    // two promise placeholders in the header, cut before any settlement
    let text = "[\n{\"json\":[\"w1re\",\"obj\",1,{\"a\":[\"w1re\",\"head\",2,\"promise\"],\"b\":[\"w1re\",\"head\",3,\"promise\"]}],\"nonce\":\"w1re\"}\n,[\n";

    let codec = codec();
    let mut demux = codec.demultiplexer();
    let hits = Arc::new(AtomicUsize::new(0));
    let seen = hits.clone();
    demux.set_interrupt_hook(move |err| {
        assert!(err.is_interruption());
        seen.fetch_add(1, Ordering::SeqCst);
    });

    demux.feed(text).unwrap();
    demux.finish().unwrap();

    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_caller_abort_is_distinguishable_end_to_end() {
    let codec = codec();
    let value = Value::object(vec![(
        "p",
        Value::future(futures::future::pending::<Result<Value, RemoteError>>()),
    )]);

    let fragments = codec.serialize(&value).unwrap();
    let (root, handle) = codec.parse_abortable(fragments).await.unwrap();
    let fut = root.get("p").unwrap().as_future().unwrap();

    handle.abort();
    let err = fut.await.unwrap_err();
    assert_eq!(err.kind, RemoteErrorKind::Aborted);
    assert!(err.is_abort());
}

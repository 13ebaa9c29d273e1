//! Fan-in merge and push producers through the public API.

use futures_util::StreamExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use voxpipe::SpeechError;
use voxpipe::pipeline::merge::merge;
use voxpipe::pipeline::stream::push_source;
use voxpipe::{Result, TaskStream};

/// Producer that ticks forever, tracking whether it is still running.
fn ticker(running: &Arc<AtomicUsize>, label: &'static str, every: Duration) -> TaskStream<String> {
    let running = Arc::clone(running);
    TaskStream::spawn(4, move |sink, cancel| async move {
        running.fetch_add(1, Ordering::SeqCst);
        let mut n = 0u32;
        let outcome: Result<()> = loop {
            tokio::select! {
                () = cancel.cancelled() => break Ok(()),
                () = tokio::time::sleep(every) => {
                    n += 1;
                    if !sink.send(format!("{label}{n}")).await {
                        break Ok(());
                    }
                }
            }
        };
        running.fetch_sub(1, Ordering::SeqCst);
        outcome
    })
}

#[tokio::test]
async fn closing_a_nested_merge_stops_every_producer() {
    let running = Arc::new(AtomicUsize::new(0));
    let inner = merge(
        vec![
            ticker(&running, "a", Duration::from_millis(1)),
            ticker(&running, "b", Duration::from_millis(2)),
        ],
        8,
    );
    let mut outer = merge(
        vec![inner, ticker(&running, "c", Duration::from_millis(3))],
        8,
    );

    let mut seen = Vec::new();
    while seen.len() < 20 {
        let item = tokio::time::timeout(Duration::from_secs(5), outer.next())
            .await
            .expect("merge stalled")
            .unwrap()
            .unwrap();
        seen.push(item);
    }
    assert_eq!(running.load(Ordering::SeqCst), 3);

    tokio::time::timeout(Duration::from_secs(5), outer.close())
        .await
        .expect("close did not finish");
    assert_eq!(running.load(Ordering::SeqCst), 0);

    // Per-source order survives the fan-in.
    let from_a: Vec<u32> = seen
        .iter()
        .filter_map(|s| s.strip_prefix('a'))
        .map(|n| n.parse().unwrap())
        .collect();
    assert!(from_a.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test]
async fn overflowing_push_source_fails_loudly() {
    let (mut feed, stream) = push_source::<u32>(2);
    let merged = merge(vec![stream], 1);

    let mut overflow = None;
    for n in 0..64 {
        if let Err(e) = feed.push(n) {
            overflow = Some(e);
            break;
        }
    }
    assert!(matches!(overflow, Some(SpeechError::Overflow { capacity: 2 })));

    let items: Vec<Result<u32>> = tokio::time::timeout(Duration::from_secs(5), merged.collect())
        .await
        .expect("merged stream did not end");
    assert!(matches!(
        items.last(),
        Some(Err(SpeechError::Overflow { .. }))
    ));
    // Everything delivered before the error arrives in order.
    let delivered: Vec<u32> = items.iter().filter_map(|r| r.as_ref().ok().copied()).collect();
    assert!(delivered.windows(2).all(|w| w[1] == w[0] + 1));
}

#[tokio::test]
async fn finished_push_source_ends_the_merge() {
    let (mut feed, stream) = push_source::<&'static str>(4);
    feed.push("first").unwrap();
    feed.push("second").unwrap();
    feed.finish();

    let items: Vec<&str> = merge(vec![stream, TaskStream::from_items(vec!["third"])], 4)
        .map(|r| r.unwrap())
        .collect()
        .await;
    assert_eq!(items.len(), 3);
    let first = items.iter().position(|s| *s == "first").unwrap();
    let second = items.iter().position(|s| *s == "second").unwrap();
    assert!(first < second);
}

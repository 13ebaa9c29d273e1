//! Fan-in merge of concurrent producers.

use crate::error::Result;
use crate::pipeline::stream::{StreamBuilder, StreamSink, TaskStream};
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Run every source concurrently and yield items in arrival order.
///
/// Order within one source is preserved; interleaving between sources is
/// whatever order items arrive in. The merged stream ends once every source
/// has ended. At most `capacity` items are buffered inside the merge, so a
/// slow consumer pauses the sources.
///
/// The first source error is yielded to the consumer and cancels every
/// sibling. Closing the merged stream closes each source and waits for it.
pub fn merge<T: Send + 'static>(sources: Vec<TaskStream<T>>, capacity: usize) -> TaskStream<T> {
    let mut builder = StreamBuilder::new(capacity);
    for (index, source) in sources.into_iter().enumerate() {
        let sink = builder.sink();
        let cancel = builder.cancel_token();
        builder.spawn(forward(index, source, sink, cancel));
    }
    builder.finish()
}

async fn forward<T: Send + 'static>(
    index: usize,
    mut source: TaskStream<T>,
    sink: StreamSink<T>,
    cancel: CancellationToken,
) -> Result<()> {
    let outcome = loop {
        tokio::select! {
            () = cancel.cancelled() => break Ok(()),
            item = source.next() => match item {
                Some(Ok(item)) => {
                    if !sink.send(item).await {
                        break Ok(());
                    }
                }
                Some(Err(e)) => break Err(e),
                None => {
                    debug!(source = index, "merge source exhausted");
                    break Ok(());
                }
            },
        }
    };
    source.close().await;
    outcome
}

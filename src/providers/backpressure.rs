//! Streaming backpressure via bounded channels.
//!
//! A producer task forwards provider events into a bounded `mpsc` channel,
//! so a fast provider waits when the consumer falls behind. Dropping the
//! returned stream closes the channel; the producer then stops and drops
//! the provider stream, which releases the HTTP connection.

use futures_util::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use super::CompletionStream;

/// Default number of events buffered between producer and consumer.
pub const DEFAULT_STREAM_BUFFER: usize = 64;

/// Wrap `inner` in a bounded channel of `buffer_size` events.
///
/// Must be called within a tokio runtime.
pub fn bounded_stream(inner: CompletionStream, buffer_size: usize) -> CompletionStream {
    let (tx, rx) = tokio::sync::mpsc::channel(buffer_size.max(1));

    tokio::spawn(async move {
        let mut inner = inner;
        loop {
            tokio::select! {
                // Consumer gone: stop pulling from the provider.
                _ = tx.closed() => break,
                item = inner.next() => match item {
                    Some(item) => {
                        if tx.send(item).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
    });

    Box::pin(ReceiverStream::new(rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StreamEvent;
    use futures_util::stream;

    #[tokio::test]
    async fn forwards_all_events_in_order() {
        let inner: CompletionStream = Box::pin(stream::iter(vec![
            Ok(StreamEvent::Content("a".into())),
            Ok(StreamEvent::Content("b".into())),
            Ok(StreamEvent::Done),
        ]));
        let events: Vec<_> = bounded_stream(inner, 1).collect().await;
        assert_eq!(events.len(), 3);
        assert!(matches!(events[2], Ok(StreamEvent::Done)));
    }

    #[tokio::test]
    async fn producer_stops_when_consumer_drops() {
        let (tx, rx) = tokio::sync::mpsc::channel::<crate::Result<StreamEvent>>(1);
        let inner: CompletionStream = Box::pin(ReceiverStream::new(rx));
        let bounded = bounded_stream(inner, 1);
        drop(bounded);
        // The producer drops its end of `inner`, closing our sender.
        tokio::time::timeout(std::time::Duration::from_secs(1), tx.closed())
            .await
            .unwrap();
    }
}

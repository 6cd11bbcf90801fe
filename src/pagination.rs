//! Pagination Batcher (C5): turns an unbounded sequence of document ids into
//! bounded `_all_docs?include_docs=true&keys=[...]` requests, forwarding rows
//! as they arrive and rolling up the per-batch counters into one summary
//! emitted after the last row.
use futures_util::{Stream, StreamExt};

use crate::error::CouchError;
use crate::view::{DocSlot, ViewEvent, ViewRow};

pub const DEFAULT_BATCH_SIZE: usize = 100;

/// One batch's worth of already-decoded view events, as produced by a single
/// `_all_docs` round trip. The caller supplies this so `paginate` stays
/// transport-agnostic; it only knows how to batch ids and roll up summaries.
pub type BatchFetcher<'a, K, V, T> = Box<
    dyn FnMut(Vec<String>) -> std::pin::Pin<Box<dyn Stream<Item = Result<ViewEvent<K, V, T>, CouchError>> + Send + 'a>>
        + Send
        + 'a,
>;

struct Rollup {
    total: i64,
    offset: Option<i64>,
    update_seq: Option<i64>,
}

impl Rollup {
    fn new() -> Self {
        Self { total: 0, offset: None, update_seq: None }
    }

    fn observe(&mut self, event: &ViewEvent<impl Clone, impl Clone, impl Clone>) {
        match event {
            ViewEvent::TotalCount(n) => self.total += n,
            ViewEvent::Offset(n) => {
                // -1 is the synthetic "server never sent an offset" sentinel
                // (see `ViewEvent::Offset`), not a real candidate minimum —
                // a batch missing `offset` must not poison the rollup.
                if *n < 0 {
                    return;
                }
                self.offset = Some(match self.offset {
                    Some(current) => current.min(*n),
                    None => *n,
                });
            }
            ViewEvent::UpdateSequence(n) => {
                self.update_seq = Some(match self.update_seq {
                    Some(current) => current.max(*n),
                    None => *n,
                });
            }
            ViewEvent::Row(_) => {}
        }
    }
}

/// Batch `ids` into groups of `batch_size`, fetch each batch with
/// `fetch_batch`, forward every row immediately, and emit one rolled-up
/// `TotalCount`/`Offset`/`UpdateSequence` summary after the input and all
/// batches are exhausted.
pub fn paginate<'a, K, V, T>(
    ids: impl Stream<Item = String> + Send + 'a,
    batch_size: usize,
    mut fetch_batch: BatchFetcher<'a, K, V, T>,
) -> impl Stream<Item = Result<ViewEvent<K, V, T>, CouchError>> + 'a
where
    K: Send + Clone + 'a,
    V: Send + Clone + 'a,
    T: Send + Clone + 'a,
{
    async_stream::try_stream! {
        futures_util::pin_mut!(ids);
        let mut rollup = Rollup::new();
        let batch_size = batch_size.max(1);
        let mut current_batch = Vec::with_capacity(batch_size);

        loop {
            let next_id = ids.next().await;
            match next_id {
                Some(id) => {
                    current_batch.push(id);
                    if current_batch.len() < batch_size {
                        continue;
                    }
                }
                None => {
                    if current_batch.is_empty() {
                        break;
                    }
                }
            }

            let batch = std::mem::take(&mut current_batch);
            let mut batch_stream = fetch_batch(batch);
            futures_util::pin_mut!(batch_stream);
            while let Some(event) = batch_stream.next().await {
                let event = event?;
                rollup.observe(&event);
                if let ViewEvent::Row(_) = &event {
                    yield event;
                }
            }

            if next_id.is_none() {
                break;
            }
        }

        yield ViewEvent::TotalCount(rollup.total);
        if let Some(offset) = rollup.offset {
            yield ViewEvent::Offset(offset);
        }
        if let Some(update_seq) = rollup.update_seq {
            yield ViewEvent::UpdateSequence(update_seq);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn row(id: &str) -> ViewEvent<String, i64, String> {
        ViewEvent::Row(ViewRow {
            id: id.to_string(),
            key: Some(id.to_string()),
            value: Some(1),
            doc: DocSlot::NotRequested,
        })
    }

    #[tokio::test]
    async fn rolls_up_offset_min_and_update_seq_max_across_batches() {
        let ids = stream::iter(vec!["a".to_string(), "b".to_string(), "c".to_string()]);
        let mut call = 0;
        let fetch: BatchFetcher<String, i64, String> = Box::new(move |batch: Vec<String>| {
            call += 1;
            let events: Vec<Result<ViewEvent<String, i64, String>, CouchError>> = if call == 1 {
                vec![
                    Ok(ViewEvent::TotalCount(2)),
                    Ok(ViewEvent::Offset(5)),
                    Ok(ViewEvent::UpdateSequence(10)),
                    Ok(row(&batch[0])),
                ]
            } else {
                vec![
                    Ok(ViewEvent::TotalCount(1)),
                    Ok(ViewEvent::Offset(1)),
                    Ok(ViewEvent::UpdateSequence(20)),
                    Ok(row(&batch[0])),
                ]
            };
            Box::pin(stream::iter(events))
        });

        let paginated = paginate(ids, 2, fetch);
        futures_util::pin_mut!(paginated);
        let mut rows = vec![];
        let mut summary_total = None;
        let mut summary_offset = None;
        let mut summary_seq = None;
        while let Some(event) = paginated.next().await {
            match event.unwrap() {
                ViewEvent::Row(r) => rows.push(r.id),
                ViewEvent::TotalCount(n) => summary_total = Some(n),
                ViewEvent::Offset(n) => summary_offset = Some(n),
                ViewEvent::UpdateSequence(n) => summary_seq = Some(n),
            }
        }

        assert_eq!(rows.len(), 2);
        assert_eq!(summary_total, Some(3));
        assert_eq!(summary_offset, Some(1));
        assert_eq!(summary_seq, Some(20));
    }

    #[tokio::test]
    async fn synthetic_offset_sentinel_does_not_poison_a_real_offset() {
        let ids = stream::iter(vec!["a".to_string(), "b".to_string()]);
        let mut call = 0;
        let fetch: BatchFetcher<String, i64, String> = Box::new(move |batch: Vec<String>| {
            call += 1;
            let events: Vec<Result<ViewEvent<String, i64, String>, CouchError>> = if call == 1 {
                // this batch's response omitted `offset`, so `decode_view` synthesized -1.
                vec![Ok(ViewEvent::Offset(-1)), Ok(row(&batch[0]))]
            } else {
                vec![Ok(ViewEvent::Offset(7)), Ok(row(&batch[0]))]
            };
            Box::pin(stream::iter(events))
        });

        let paginated = paginate(ids, 1, fetch);
        futures_util::pin_mut!(paginated);
        let mut summary_offset = None;
        while let Some(event) = paginated.next().await {
            if let ViewEvent::Offset(n) = event.unwrap() {
                summary_offset = Some(n);
            }
        }
        assert_eq!(summary_offset, Some(7));
    }

    #[tokio::test]
    async fn flushes_partial_last_batch() {
        let ids = stream::iter(vec!["only".to_string()]);
        let fetch: BatchFetcher<String, i64, String> = Box::new(move |batch: Vec<String>| {
            assert_eq!(batch, vec!["only".to_string()]);
            Box::pin(stream::iter(vec![Ok(ViewEvent::TotalCount(1)), Ok(row("only"))]))
        });
        let paginated = paginate(ids, 100, fetch);
        futures_util::pin_mut!(paginated);
        let mut rows = 0;
        while let Some(event) = paginated.next().await {
            if matches!(event.unwrap(), ViewEvent::Row(_)) {
                rows += 1;
            }
        }
        assert_eq!(rows, 1);
    }
}

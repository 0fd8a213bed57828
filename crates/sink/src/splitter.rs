//! Batch Splitter
//!
//! Pure partitioning of an event list into sub-batches that each honor a
//! record-count cap and a byte cap. Used to turn one stream-sized batch
//! into queue-compatible sub-batches.

/// Partition `events` into consecutive sub-batches such that every
/// sub-batch holds at most `max_records` entries and at most `max_bytes`
/// total (as measured by `size_of`).
///
/// The sub-batches, concatenated in order, equal the input. An event
/// larger than `max_bytes` on its own is emitted as a singleton
/// sub-batch; callers that cannot transmit oversized events must filter
/// them out before splitting.
pub fn split_batch<T, F>(events: Vec<T>, size_of: F, max_records: usize, max_bytes: usize) -> Vec<Vec<T>>
where
    F: Fn(&T) -> usize,
{
    let mut batches = Vec::new();
    let mut current: Vec<T> = Vec::new();
    let mut current_bytes = 0usize;

    for event in events {
        let size = size_of(&event);
        let fits = current.len() + 1 <= max_records && current_bytes + size <= max_bytes;
        if !current.is_empty() && !fits {
            batches.push(std::mem::take(&mut current));
            current_bytes = 0;
        }
        current_bytes += size;
        current.push(event);
    }

    if !current.is_empty() {
        batches.push(current);
    }

    batches
}

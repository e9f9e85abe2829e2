use std::time::Instant;

use shrike_core::RgetItem;

/// The live counter for a single physical read.
///
/// Owned exclusively by the read that created it and dropped when that
/// read completes; cursor-level pacing state lives in the
/// [`BatchSpec`](crate::BatchSpec) instead.
#[derive(Debug)]
pub struct Batcher {
    els_left: i64,
    min_els_left: i64,
    size_left: i64,
    end_time: Option<Instant>,
    seen_one_el: bool,
}

impl Batcher {
    pub(crate) fn new(
        max_els: usize,
        min_els: usize,
        max_size: usize,
        end_time: Option<Instant>,
    ) -> Self {
        Self {
            els_left: saturate(max_els),
            min_els_left: saturate(min_els),
            size_left: saturate(max_size),
            end_time,
            seen_one_el: false,
        }
    }

    /// Record one produced row.
    pub fn note_el(&mut self, item: &RgetItem) {
        self.note_size(item.serialized_size());
    }

    /// Record one produced row of the given serialized size.
    pub fn note_size(&mut self, size: usize) {
        self.els_left -= 1;
        self.min_els_left -= 1;
        self.size_left -= saturate(size);
        self.seen_one_el = true;
    }

    /// Whether the batch under construction is full.
    ///
    /// The byte cap alone never cuts a batch before the minimum element
    /// count is met (a single large row would otherwise produce a stream
    /// of one-row batches), but a hard element cap or an elapsed deadline
    /// always ends the batch once at least one row exists.
    pub fn should_send_batch(&self) -> bool {
        self.els_left <= 0
            || (self.size_left <= 0 && self.min_els_left <= 0)
            || (self.past_deadline() && self.seen_one_el)
    }

    fn past_deadline(&self) -> bool {
        self.end_time.is_some_and(|end| Instant::now() >= end)
    }

    pub fn els_left(&self) -> usize {
        self.els_left.max(0) as usize
    }

    pub(crate) fn end_time(&self) -> Option<Instant> {
        self.end_time
    }
}

fn saturate(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

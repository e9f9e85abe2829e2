use std::time::{Duration, Instant};

use crate::{Batcher, Error};

/// How the batch a read produces will be consumed.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BatchType {
    /// An ordinary cursor batch.
    Normal,
    /// The first batch of a cursor; limits are derated to shrink
    /// first-byte latency.
    NormalFirst,
    /// Feeds a terminal accumulator; must eventually return all data, so
    /// the wall-clock deadline is ignored.
    Terminal,
    /// Groups rows sharing one secondary-index value; crosses physical
    /// batch boundaries until the value changes.
    SindexConstant,
}

const DEFAULT_MIN_ELS: usize = 8;
const DEFAULT_MAX_SIZE: usize = 1024 * 1024;
const DEFAULT_FIRST_SCALEDOWN: usize = 4;
const DEFAULT_MAX_DURATION: Duration = Duration::from_millis(500);

/// Caller-supplied batching options, all optional.
#[derive(Clone, Copy, Default, Debug)]
pub struct BatchOptions {
    pub max_els: Option<i64>,
    pub min_els: Option<i64>,
    pub max_size: Option<i64>,
    pub first_scaledown: Option<i64>,
    pub max_duration: Option<Duration>,
}

/// Immutable description of the desired batch shape for one logical read.
///
/// Derived copies are created through [`BatchSpec::with_new_batch_type`],
/// [`BatchSpec::with_at_most`] and [`BatchSpec::scale_down`]; a spec is
/// never mutated in place.
#[derive(Clone, Debug)]
pub struct BatchSpec {
    batch_type: BatchType,
    min_els: usize,
    max_els: usize,
    max_size: usize,
    /// The first batch is shrunk by this factor.
    first_scaledown_factor: usize,
    /// Absolute deadline; `None` means no deadline.
    end_time: Option<Instant>,
}

/// `scale_down` divides by slightly less than the requested divisor.
const DIVISOR_SCALING_FACTOR: usize = 8;
/// ... and adds this constant back.
const SCALE_CONSTANT: usize = 8;

impl BatchSpec {
    /// The spec for a user-facing cursor read, from caller options.
    pub fn user(options: BatchOptions) -> error_stack::Result<Self, Error> {
        let max_els = validate("max_batch_rows", options.max_els, 1)?
            .unwrap_or(usize::MAX);
        let min_els = validate("min_batch_rows", options.min_els, 0)?
            .unwrap_or(DEFAULT_MIN_ELS)
            .clamp(1, max_els);
        let max_size = validate("max_batch_bytes", options.max_size, 1)?
            .unwrap_or(DEFAULT_MAX_SIZE);
        let first_scaledown_factor =
            validate("first_batch_scaledown_factor", options.first_scaledown, 1)?
                .unwrap_or(DEFAULT_FIRST_SCALEDOWN);
        let max_duration = options.max_duration.unwrap_or(DEFAULT_MAX_DURATION);

        Ok(Self {
            batch_type: BatchType::NormalFirst,
            min_els,
            max_els,
            max_size,
            first_scaledown_factor,
            end_time: Instant::now().checked_add(max_duration),
        })
    }

    /// The spec for a read that must return everything, e.g. feeding a
    /// terminal accumulator. No limits, no deadline.
    pub fn all() -> Self {
        Self {
            batch_type: BatchType::Terminal,
            min_els: 1,
            max_els: usize::MAX,
            max_size: usize::MAX,
            first_scaledown_factor: 1,
            end_time: None,
        }
    }

    pub fn batch_type(&self) -> BatchType {
        self.batch_type
    }

    pub fn with_new_batch_type(&self, batch_type: BatchType) -> Self {
        Self {
            batch_type,
            ..self.clone()
        }
    }

    /// Cap the element count at `n`.
    pub fn with_at_most(&self, n: usize) -> Self {
        let max_els = self.max_els.min(n.max(1));
        Self {
            max_els,
            min_els: self.min_els.min(max_els),
            ..self.clone()
        }
    }

    /// Shrink the limits for splitting one batch across `divisor` groups.
    ///
    /// Divides by slightly less than `divisor` and adds a small constant,
    /// over-allocating a little so the split groups rarely need a second
    /// round-trip.
    pub fn scale_down(&self, divisor: usize) -> Self {
        let quot =
            (divisor * (DIVISOR_SCALING_FACTOR - 1) / DIVISOR_SCALING_FACTOR).max(1);
        let max_els = if self.max_els == usize::MAX {
            usize::MAX
        } else {
            self.max_els / quot + SCALE_CONSTANT
        };
        let max_size = if self.max_size == usize::MAX {
            usize::MAX
        } else {
            self.max_size / quot + SCALE_CONSTANT
        };
        Self {
            max_els,
            max_size,
            min_els: self.min_els.min(max_els),
            ..self.clone()
        }
    }

    /// Derive the live counter for one physical read.
    pub fn to_batcher(&self) -> Batcher {
        let scale = match self.batch_type {
            BatchType::NormalFirst => self.first_scaledown_factor,
            _ => 1,
        };
        let end_time = match self.batch_type {
            BatchType::Normal | BatchType::NormalFirst => self
                .end_time
                .filter(|end| *end > Instant::now()),
            // Terminal-style batches must eventually return all data.
            BatchType::Terminal | BatchType::SindexConstant => None,
        };
        Batcher::new(
            div_floor_1(self.max_els, scale),
            div_floor_1(self.min_els, scale),
            div_floor_1(self.max_size, scale),
            end_time,
        )
    }
}

fn div_floor_1(n: usize, divisor: usize) -> usize {
    if n == usize::MAX {
        n
    } else {
        (n / divisor).max(1)
    }
}

fn validate(
    name: &'static str,
    value: Option<i64>,
    min: i64,
) -> error_stack::Result<Option<usize>, Error> {
    match value {
        None => Ok(None),
        Some(value) => {
            error_stack::ensure!(value >= min, Error::InvalidOption { name, value });
            Ok(Some(value as usize))
        }
    }
}

use shrike_core::DatumRef;

/// How hard a write must sync before acknowledgement.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Durability {
    Hard,
    Soft,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WriteKind {
    /// Insert new rows; an existing key is a per-row error.
    Insert,
    /// Insert or overwrite.
    Replace,
}

/// A batched write.
#[derive(Debug)]
pub struct WriteRequest {
    pub kind: WriteKind,
    pub rows: Vec<DatumRef>,
    pub durability: Durability,
    pub return_changes: bool,
}

/// One row's before/after pair, when changes were requested.
#[derive(Clone, Debug)]
pub struct WriteChange {
    pub old: Option<DatumRef>,
    pub new: Option<DatumRef>,
}

#[derive(Debug, Default)]
pub struct WriteResponse {
    pub inserted: usize,
    pub replaced: usize,
    pub errors: usize,
    pub first_error: Option<String>,
    pub changes: Vec<WriteChange>,
}

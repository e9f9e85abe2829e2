use std::fmt;
use std::sync::Arc;

use shrike_core::{Datum, DatumRef, QueryError};

/// A compiled row-to-row function, supplied by the expression layer.
pub trait DatumFn: Send + Sync {
    fn call(&self, datum: &DatumRef) -> error_stack::Result<DatumRef, QueryError>;
}

/// A compiled row predicate, supplied by the expression layer.
pub trait DatumPredicate: Send + Sync {
    fn test(&self, datum: &DatumRef) -> error_stack::Result<bool, QueryError>;
}

/// The black-box geometry oracle for intersection reads.
///
/// Geospatial indexing internals live outside this pipeline; all it
/// needs is a yes/no answer per indexed value.
pub trait GeoPredicate: Send + Sync {
    fn intersects(&self, datum: &Datum) -> bool;
}

/// One stage of the transform pipeline pushed down into shard-local
/// reads. Stages apply in request order.
#[derive(Clone)]
pub enum Transform {
    Map(Arc<dyn DatumFn>),
    Filter(Arc<dyn DatumPredicate>),
}

impl Transform {
    /// Wrap an infallible mapping closure.
    pub fn map<F>(f: F) -> Self
    where
        F: Fn(&DatumRef) -> DatumRef + Send + Sync + 'static,
    {
        struct FnMap<F>(F);
        impl<F> DatumFn for FnMap<F>
        where
            F: Fn(&DatumRef) -> DatumRef + Send + Sync,
        {
            fn call(&self, datum: &DatumRef) -> error_stack::Result<DatumRef, QueryError> {
                Ok((self.0)(datum))
            }
        }
        Transform::Map(Arc::new(FnMap(f)))
    }

    /// Wrap an infallible predicate closure.
    pub fn filter<F>(f: F) -> Self
    where
        F: Fn(&DatumRef) -> bool + Send + Sync + 'static,
    {
        struct FnFilter<F>(F);
        impl<F> DatumPredicate for FnFilter<F>
        where
            F: Fn(&DatumRef) -> bool + Send + Sync,
        {
            fn test(&self, datum: &DatumRef) -> error_stack::Result<bool, QueryError> {
                Ok((self.0)(datum))
            }
        }
        Transform::Filter(Arc::new(FnFilter(f)))
    }

    /// Run the stage on one row. `None` means the row was filtered out.
    pub fn apply(
        &self,
        datum: &DatumRef,
    ) -> error_stack::Result<Option<DatumRef>, QueryError> {
        match self {
            Transform::Map(f) => f.call(datum).map(Some),
            Transform::Filter(p) => {
                Ok(if p.test(datum)? { Some(datum.clone()) } else { None })
            }
        }
    }
}

impl fmt::Debug for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transform::Map(_) => f.write_str("Map(..)"),
            Transform::Filter(_) => f.write_str("Filter(..)"),
        }
    }
}

/// Run a full transform pipeline on one row.
pub fn apply_transforms(
    transforms: &[Transform],
    datum: &DatumRef,
) -> error_stack::Result<Option<DatumRef>, QueryError> {
    let mut current = datum.clone();
    for transform in transforms {
        match transform.apply(&current)? {
            Some(next) => current = next,
            None => return Ok(None),
        }
    }
    Ok(Some(current))
}

/// A function deriving a secondary-index value from a row.
///
/// Returning `None` leaves the row out of the index.
pub trait SindexFn: Send + Sync {
    fn index(&self, datum: &DatumRef) -> Option<DatumRef>;
}

/// Index rows by one object field.
pub struct FieldIndex(pub String);

impl SindexFn for FieldIndex {
    fn index(&self, datum: &DatumRef) -> Option<DatumRef> {
        datum.get_field(&self.0).cloned()
    }
}

//! Type-erased value plumbing between the typed facade and the interpreter.

use std::any::{type_name, Any};
use std::sync::Arc;

/// Bound for anything that flows through an effect, a fiber ref or a
/// transactional cell.
///
/// Descriptors are reusable, so values are cloned when a descriptor is
/// interpreted more than once.
pub trait Value: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Value for T {}

/// A value whose type is known only to the typed facade.
pub(crate) type AnyValue = Arc<dyn Any + Send + Sync>;

pub(crate) fn erase<A: Value>(value: A) -> AnyValue {
    Arc::new(value)
}

/// Recovers a typed value, cloning only when the erased value is shared.
pub(crate) fn unerase<A: Value>(value: AnyValue) -> A {
    match value.downcast::<A>() {
        Ok(arc) => Arc::try_unwrap(arc).unwrap_or_else(|shared| (*shared).clone()),
        Err(_) => type_mismatch::<A>(),
    }
}

pub(crate) fn unerase_ref<A: 'static>(value: &AnyValue) -> &A {
    value
        .downcast_ref::<A>()
        .unwrap_or_else(|| type_mismatch::<A>())
}

#[cold]
fn type_mismatch<A>() -> ! {
    unreachable!("erased value is not a {}", type_name::<A>())
}

//! Core types shared across the runtime.

pub mod cause;
pub mod exit;
pub mod id;
pub mod status;
pub mod value;

pub use cause::{Cause, Defect};
pub use exit::Exit;
pub use id::{FiberId, FiberRefId, ScopeId, TRefId};
pub use status::{BlockingOn, FiberStatus};
pub use value::Value;
pub(crate) use value::{erase, unerase, unerase_ref, AnyValue};

pub mod call_error;

pub use call_error::{CallError, CallResult};

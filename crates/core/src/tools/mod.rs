pub mod builtin;
pub mod registry;
pub mod runtime;
pub mod schema;

pub use builtin::{Echo, TicketingListOpen};
pub use registry::{handler_fn, ToolHandler, ToolRegistry};
pub use runtime::ToolRuntime;

//! Leaf services. Each owns one narrow slice of state and holds a cache of
//! the coordinator's data; none of them writes canonical data directly.

pub mod bindings;
pub mod mode;
pub mod selection;

pub use bindings::BindingsService;
pub use mode::{ModeService, ModeState, ViewMode, ViewRequest};
pub use selection::{FlushReport, SelectRequest, Selection, SelectionQuery, SelectionService};

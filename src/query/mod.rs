pub mod error;
pub mod executor;
pub mod page;
pub mod plan;

pub use executor::{AccessorDebug, AccessorRequest, AccessorResponse, execute_accessor};
pub use page::{PaginationOptions, SortOrder};
pub use plan::{Operand, Selector};

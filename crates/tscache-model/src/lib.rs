mod error;
pub mod escape;
mod result;
mod table;
mod value;

pub use error::ModelError;
pub use result::QueryResult;
pub use table::{Table, TableKey};
pub use value::{ScalarType, Value};

/// Name of the conventional first column of every series.
pub const TIME_COLUMN: &str = "time";

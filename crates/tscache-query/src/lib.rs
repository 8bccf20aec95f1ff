mod aggregation;
mod clause;
mod error;
mod lexer;
mod operator;
mod parser;
mod time;

pub use aggregation::Aggregation;
pub use clause::Clause;
pub use error::ParseError;
pub use operator::Operator;
pub use parser::{ParsedQuery, parse_query, parse_query_at};
pub use time::{TimeWindow, parse_duration};

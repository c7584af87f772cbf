pub mod credentials;
pub mod metric_query;
pub mod query;

pub use credentials::*;
pub use metric_query::*;
pub use query::*;

pub mod credentials;
pub mod query;

pub use credentials::AppState;

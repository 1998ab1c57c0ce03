pub mod catalog;
pub mod config;
pub mod error;
pub mod ids;
pub mod ledger;
pub mod logging;
pub mod market;
pub mod model;
pub mod reliability;
pub mod upgrade;
pub mod valuation;
pub mod verify;

pub use catalog::tasks_required_for;
pub use error::EngineError;
pub use market::Marketplace;
pub use valuation::{compute_system_value, listing_cap};

pub mod aggregator;
pub mod export;
pub mod migrations;
pub mod reaction;
pub mod store;

pub use aggregator::*;
pub use export::*;
pub use reaction::*;
pub use store::*;

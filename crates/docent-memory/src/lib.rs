pub mod history;
pub mod migrations;
pub mod store;

pub use history::*;
pub use store::*;

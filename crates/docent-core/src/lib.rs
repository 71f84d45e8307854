pub mod chunker;
pub mod confidence;
pub mod config;
pub mod factory;
pub mod generator;
pub mod retriever;
pub mod templates;

pub use confidence::*;
pub use config::*;
pub use factory::*;
pub use generator::*;
pub use retriever::*;
pub use templates::*;

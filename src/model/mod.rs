pub mod change;
pub mod common;
pub mod entity;
pub mod field;
pub mod filter;
pub mod release;
pub mod snapshot;
pub mod syntax;
pub mod user_context;

pub use change::*;
pub use common::*;
pub use entity::*;
pub use field::*;
pub use filter::*;
pub use release::*;
pub use snapshot::*;
pub use syntax::*;
pub use user_context::*;

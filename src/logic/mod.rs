pub mod migration;
pub mod overlay;
pub mod publish;
pub mod staging;
pub mod templates;
pub mod validate;

pub use migration::*;
pub use overlay::*;
pub use publish::*;
pub use staging::*;
pub use templates::*;
pub use validate::*;

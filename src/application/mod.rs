pub mod artifacts;
pub mod entitlement;
pub mod identity;
pub mod reconciler;

pub use artifacts::*;
pub use entitlement::*;
pub use identity::*;
pub use reconciler::*;

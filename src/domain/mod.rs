pub mod account;
pub mod artifact;
pub mod payment;
pub mod principal;
pub mod usage;

pub use account::*;
pub use artifact::*;
pub use payment::*;
pub use principal::*;
pub use usage::*;

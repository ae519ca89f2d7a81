pub mod config;
pub mod postgres_artifact_repo;
pub mod postgres_payment_repo;
pub mod repository;
pub mod stripe;

pub use config::*;
pub use postgres_artifact_repo::*;
pub use postgres_payment_repo::*;
pub use repository::*;
pub use stripe::*;

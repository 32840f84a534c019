pub mod database;
pub mod manual_repository;

pub use database::Database;
pub use manual_repository::ManualRepository;

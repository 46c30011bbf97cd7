//! Account persistence

pub mod repository;

pub use repository::AccountsRepository;

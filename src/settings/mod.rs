//! Dashboard settings (single-row, process-wide routing knobs)

pub mod repository;

pub use repository::SettingsRepository;

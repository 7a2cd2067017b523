pub mod app;

pub mod events;

pub mod projection;

pub mod views;

pub type Result<T, E = anyhow::Error> = std::result::Result<T, E>;

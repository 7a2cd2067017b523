pub mod board;

pub mod board_reader;

pub mod cache;

pub mod watcher;

pub type Result<T, E = anyhow::Error> = std::result::Result<T, E>;

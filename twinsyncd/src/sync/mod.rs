pub mod baseline;
mod conflict;
pub mod engine;
pub mod job;
pub mod lifecycle;
pub mod queue;
pub mod retry;
pub mod scanner;
pub mod settings;
pub mod sides;
pub mod transfer;
pub mod worker;

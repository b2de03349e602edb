pub mod control;
pub mod daemon;
pub mod sync;

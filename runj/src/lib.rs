pub mod operations;

pub use operations::{KillTarget, ProcessIo, Runtime};

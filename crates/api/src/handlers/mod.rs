pub mod fireworks;
pub mod launches;
pub mod workflows;

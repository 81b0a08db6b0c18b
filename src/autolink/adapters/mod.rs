pub mod tcp;
pub mod wire;

mod abstractions;
mod real;

pub use abstractions::*;
pub use real::*;

pub mod constants;
pub mod types;

#[cfg(test)]
mod tests;

pub use constants::*;
pub use types::*;

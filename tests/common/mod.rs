#![allow(dead_code)]

pub mod builders;
pub mod mock_steps;
pub mod strategies;

pub use builders::*;
pub use mock_steps::*;
pub use strategies::*;

pub mod engine;

pub use engine::{PerpEngine, PositionView};

pub mod book;
pub mod conditional;
pub mod levels;

pub use book::OrderBook;
pub use conditional::{ConditionalSet, TriggerAction};
pub use levels::{BookSnapshot, LevelView};

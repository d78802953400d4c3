pub mod margin;
pub mod wei;

pub use wei::{from_wei, to_wei, Wei};

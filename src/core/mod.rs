pub mod error;
pub mod types;

pub use error::{Result, TaskError};
pub use types::{Identity, Node, NodeId};

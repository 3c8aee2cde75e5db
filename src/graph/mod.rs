pub mod manager;
pub mod model;
pub mod relations;
pub mod store;

pub use manager::{GraphManager, GraphSpec};
pub use model::{GraphChange, GraphDelta, GraphEdge, GraphNode, NodeAttributes, NodeKey};
pub use store::{GraphStore, LabelFilter};

/*!
bakesys builds container images from a templated build document. The
document expands per (profile, platform) into a graph of image-construction
steps; the graph is content-hashed, external images are pinned by digest,
consecutive steps are grouped into invocations of an external container
builder, and base images are cached in a shared registry keyed by the hash
of their inputs so unchanged subgraphs never rebuild.
*/

pub mod arch;
pub mod cmd;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod graph;
pub mod hashing;
pub mod images;
pub mod output;
pub mod pipe;
pub mod plan;
pub mod project;
pub mod registry;
pub mod render;
pub mod resolve;
pub mod scope;
pub mod store;
pub mod util;

pub use error::{Error, Result};

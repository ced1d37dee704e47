//! Output formats for recovered functions.
//!
//! - Text listings with labels and resolved call names
//! - DOT (Graphviz) call graphs and per-function flow graphs

pub mod dot;
pub mod listing;

pub use dot::{escape_dot_string, function_flow, CallGraphDot, DotConfig, EdgeStyle};
pub use listing::FunctionListing;

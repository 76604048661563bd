//! Blobs: byte streams of arbitrary length built from fixed-size blocks.

mod node;
mod tree;

pub use {
    node::{NODE_HEADER_LEN, Node, NodeData, NodeStore},
    tree::Blob,
};

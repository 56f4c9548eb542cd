//! Node alias dictionary
//!
//! Stored segments reference storage nodes through compact 32-bit aliases.
//! Backends load the full dictionary once per pass and resolve pieces before
//! handing segments to observers.

use std::collections::HashMap;

use crate::rangeloop::error::{LoopError, LoopResult};
use crate::rangeloop::segment::{AliasPiece, NodeId, Piece};

#[derive(Debug, Clone, Default)]
pub struct NodeAliasMap {
    nodes: HashMap<u32, NodeId>,
}

impl NodeAliasMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, alias: u32, node: NodeId) {
        self.nodes.insert(alias, node);
    }

    pub fn get(&self, alias: u32) -> Option<&NodeId> {
        self.nodes.get(&alias)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Resolve alias pieces into pieces. An alias missing from the dictionary
    /// makes the whole record malformed.
    pub fn resolve(&self, alias_pieces: &[AliasPiece]) -> LoopResult<Vec<Piece>> {
        alias_pieces
            .iter()
            .map(|piece| {
                self.get(piece.alias)
                    .map(|node| Piece {
                        number: piece.number,
                        node: *node,
                    })
                    .ok_or_else(|| {
                        LoopError::malformed(format!(
                            "piece {} references unknown node alias {}",
                            piece.number, piece.alias
                        ))
                    })
            })
            .collect()
    }
}

impl FromIterator<(u32, NodeId)> for NodeAliasMap {
    fn from_iter<I: IntoIterator<Item = (u32, NodeId)>>(iter: I) -> Self {
        Self {
            nodes: iter.into_iter().collect(),
        }
    }
}

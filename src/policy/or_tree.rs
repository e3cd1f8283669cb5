//! Trees of PolicyOR assertions.
//!
//! The TPM's PolicyOR takes at most eight digests, so a policy with more
//! branches is split into a tree: leaves hold up to eight branch digests,
//! and each parent holds the digests its children produce, up to eight per
//! node. Nodes live in an arena ordered leaves first and root last.

use super::trial::TrialAuthPolicy;
use crate::mu::{self, Marshal, Reader, Unmarshal, Writer};
use crate::tpm::types::{Digest, Handle, HashAlg};
use crate::tpm::{Tpm, TpmError};
use thiserror::Error;

/// Maximum number of digests accepted by one PolicyOR assertion.
pub const MAX_DIGESTS: usize = 8;

#[derive(Error, Debug)]
pub enum PolicyOrError {
    #[error("current session digest not found in policy data")]
    DigestNotFound,
    #[error("invalid policy data: {0}")]
    InvalidData(String),
    #[error(transparent)]
    Tpm(#[from] TpmError),
}

pub type Result<T, E = PolicyOrError> = core::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyOrNode {
    parent: Option<usize>,
    children: Vec<usize>,
    digests: Vec<Digest>,
}

impl PolicyOrNode {
    pub fn parent(&self) -> Option<usize> {
        self.parent
    }

    pub fn children(&self) -> &[usize] {
        &self.children
    }

    pub fn digests(&self) -> &[Digest] {
        &self.digests
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// The digests as passed to PolicyOR, which needs at least two.
    fn assertion_digests(&self) -> Vec<Digest> {
        match self.digests.as_slice() {
            [single] => vec![single.clone(), single.clone()],
            digests => digests.to_vec(),
        }
    }

    fn policy_digest(&self, alg: HashAlg) -> Digest {
        let mut trial = TrialAuthPolicy::new(alg);
        trial.policy_or(&self.assertion_digests());
        trial.into_digest()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyOrTree {
    alg: HashAlg,
    nodes: Vec<PolicyOrNode>,
}

impl PolicyOrTree {
    /// Builds a tree whose leaves hold `digests` in order. No digests gives
    /// a single empty node which no session can ever satisfy.
    pub fn new(alg: HashAlg, digests: &[Digest]) -> Self {
        let mut nodes = Vec::new();
        let mut level = digests
            .chunks(MAX_DIGESTS)
            .map(|chunk| {
                nodes.push(PolicyOrNode {
                    parent: None,
                    children: Vec::new(),
                    digests: chunk.to_vec(),
                });
                nodes.len() - 1
            })
            .collect::<Vec<_>>();
        if level.is_empty() {
            nodes.push(PolicyOrNode {
                parent: None,
                children: Vec::new(),
                digests: Vec::new(),
            });
            level.push(0);
        }

        while level.len() > 1 {
            let mut next = Vec::with_capacity(level.len() / MAX_DIGESTS + 1);
            for group in level.chunks(MAX_DIGESTS) {
                let digests = group.iter().map(|i| nodes[*i].policy_digest(alg)).collect();
                let parent = nodes.len();
                nodes.push(PolicyOrNode {
                    parent: None,
                    children: group.to_vec(),
                    digests,
                });
                for child in group {
                    nodes[*child].parent = Some(parent);
                }
                next.push(parent);
            }
            level = next;
        }

        Self { alg, nodes }
    }

    pub fn alg(&self) -> HashAlg {
        self.alg
    }

    pub fn nodes(&self) -> &[PolicyOrNode] {
        &self.nodes
    }

    pub fn root(&self) -> &PolicyOrNode {
        // never empty: both constructors guarantee a root
        &self.nodes[self.nodes.len() - 1]
    }

    pub fn leaves(&self) -> impl Iterator<Item = &PolicyOrNode> {
        self.nodes.iter().filter(|n| n.is_leaf())
    }

    /// The session digest after the whole tree has been asserted.
    pub fn root_digest(&self) -> Digest {
        self.root().policy_digest(self.alg)
    }

    pub fn flatten(&self) -> PolicyOrData {
        PolicyOrData(
            self.nodes
                .iter()
                .enumerate()
                .map(|(i, node)| PolicyOrDataNode {
                    next: node.parent.map(|p| (p - i) as u32).unwrap_or(0),
                    digests: node.digests.clone(),
                })
                .collect(),
        )
    }

    /// Walks from the first leaf containing the session's current digest up
    /// to the root, asserting PolicyOR at each level.
    pub fn execute_assertions(&self, tpm: &mut dyn Tpm, session: Handle) -> Result<()> {
        let current = tpm.policy_get_digest(session)?;
        let mut index = self
            .nodes
            .iter()
            .position(|n| n.is_leaf() && n.digests.contains(&current))
            .ok_or(PolicyOrError::DigestNotFound)?;
        loop {
            let node = &self.nodes[index];
            tpm.policy_or(session, &node.assertion_digests())?;
            match node.parent {
                Some(parent) => index = parent,
                None => return Ok(()),
            }
        }
    }
}

/// One node of a flattened tree. `next` is the distance to the parent node,
/// or zero for the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyOrDataNode {
    pub next: u32,
    pub digests: Vec<Digest>,
}

impl Marshal for PolicyOrDataNode {
    fn marshal(&self, w: &mut Writer) {
        w.write_u32(self.next);
        self.digests.marshal(w);
    }
}

impl Unmarshal for PolicyOrDataNode {
    fn unmarshal(r: &mut Reader<'_>) -> mu::Result<Self> {
        const T: &str = "PolicyOrDataNode";
        Ok(Self {
            next: r.read_field(T, "next")?,
            digests: r.read_field(T, "digests")?,
        })
    }
}

/// The serialized form of a [`PolicyOrTree`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyOrData(pub Vec<PolicyOrDataNode>);

impl PolicyOrData {
    /// Rebuilds the tree, checking the structure is one the TPM can assert.
    pub fn resolve(&self, alg: HashAlg) -> Result<PolicyOrTree> {
        let invalid = |why: String| Err(PolicyOrError::InvalidData(why));
        let len = self.0.len();
        if len == 0 {
            return invalid("no nodes".to_string());
        }

        let mut nodes = self
            .0
            .iter()
            .map(|n| PolicyOrNode {
                parent: None,
                children: Vec::new(),
                digests: n.digests.clone(),
            })
            .collect::<Vec<_>>();

        for (i, n) in self.0.iter().enumerate() {
            if n.digests.len() > MAX_DIGESTS {
                return invalid(format!("too many digests in node {}", i));
            }
            if n.digests.iter().any(|d| d.len() != alg.size()) {
                return invalid(format!("digest with the wrong size in node {}", i));
            }
            if n.next == 0 {
                if i != len - 1 {
                    return invalid(format!("node {} is a root but isn't last", i));
                }
                continue;
            }
            let parent = match i.checked_add(n.next as usize) {
                Some(p) if p < len => p,
                _ => return invalid(format!("parent of node {} is out of range", i)),
            };
            nodes[i].parent = Some(parent);
            nodes[parent].children.push(i);
        }

        if self.0[len - 1].next != 0 {
            return invalid("no root node".to_string());
        }
        for (i, node) in nodes.iter().enumerate() {
            if node.children.len() > MAX_DIGESTS {
                return invalid(format!("too many children for node {}", i));
            }
            if node.is_leaf() && node.digests.is_empty() && len > 1 {
                return invalid(format!("empty leaf node {}", i));
            }
        }

        Ok(PolicyOrTree { alg, nodes })
    }
}

impl Marshal for PolicyOrData {
    fn marshal(&self, w: &mut Writer) {
        self.0.marshal(w)
    }
}

impl Unmarshal for PolicyOrData {
    fn unmarshal(r: &mut Reader<'_>) -> mu::Result<Self> {
        Ok(Self(Vec::unmarshal(r)?))
    }
}

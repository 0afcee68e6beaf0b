//! Merkle Engine: builds a directory-shaped hash tree over a
//! snapshot's file list and diffs two such trees in time proportional
//! to the size of the difference, not the size of the tree.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::catalog::Catalog;
use crate::error::BackupError;
use crate::hash::{ChunkHash, Hasher};
use crate::model::{FileRecord, FileType, MerkleChild, MerkleNode, MerkleNodeKind};

/// In-memory tree node used while building, before it is flattened to
/// `MerkleNode` rows for catalog persistence.
#[derive(Debug, Clone)]
enum BuildNode {
    File {
        hash: ChunkHash,
        size: u64,
    },
    Dir {
        children: BTreeMap<String, BuildNode>,
    },
}

/// Builds the intermediate directory tree by splitting every
/// `relative_path` on `/` and inserting the file's precomputed hash at
/// the leaf.
fn insert(root: &mut BTreeMap<String, BuildNode>, path: &str, hash: ChunkHash, size: u64) {
    let mut parts = path.split('/').filter(|p| !p.is_empty()).peekable();
    let mut current = root;
    while let Some(part) = parts.next() {
        if parts.peek().is_none() {
            current.insert(part.to_string(), BuildNode::File { hash, size });
            return;
        }
        let entry = current.entry(part.to_string()).or_insert_with(|| BuildNode::Dir {
            children: BTreeMap::new(),
        });
        match entry {
            BuildNode::Dir { children } => current = children,
            BuildNode::File { .. } => {
                // A path component collided with a previously-inserted
                // file leaf; replace it with a directory so the walk
                // can continue. Only reachable with an inconsistent
                // FileRecord set.
                *entry = BuildNode::Dir {
                    children: BTreeMap::new(),
                };
                if let BuildNode::Dir { children } = entry {
                    current = children;
                }
            }
        }
    }
}

/// Ensures every path component down to `path` exists as a `Dir` node,
/// creating empty ones along the way. Used for directory FileRecords,
/// which carry no content of their own but must still produce a tree
/// node (so an empty directory isn't indistinguishable from one that
/// was never backed up at all).
fn ensure_dir(root: &mut BTreeMap<String, BuildNode>, path: &str) {
    let mut current = root;
    for part in path.split('/').filter(|p| !p.is_empty()) {
        let entry = current.entry(part.to_string()).or_insert_with(|| BuildNode::Dir {
            children: BTreeMap::new(),
        });
        match entry {
            BuildNode::Dir { children } => current = children,
            BuildNode::File { .. } => {
                *entry = BuildNode::Dir {
                    children: BTreeMap::new(),
                };
                if let BuildNode::Dir { children } = entry {
                    current = children;
                }
            }
        }
    }
}

fn dir_hash(hasher: &dyn Hasher, name: &str, children: &[MerkleChild]) -> ChunkHash {
    let mut state = hasher.start();
    hasher.update(&mut state, b"DIR:");
    hasher.update(&mut state, name.as_bytes());
    for child in children {
        hasher.update(&mut state, child.name.as_bytes());
        hasher.update(&mut state, b":");
        hasher.update(
            &mut state,
            match child.kind {
                MerkleNodeKind::File => b"file" as &[u8],
                MerkleNodeKind::Dir => b"dir" as &[u8],
            },
        );
        hasher.update(&mut state, b":");
        hasher.update(&mut state, child.hash.to_hex().as_bytes());
        hasher.update(&mut state, b"|");
    }
    hasher.finish(state)
}

/// Fixed hash of an empty directory's node, independent of `name`
/// (the formula's fixed point with zero children).
pub fn empty_dir_hash(hasher: &dyn Hasher) -> ChunkHash {
    dir_hash(hasher, "", &[])
}

/// `FileRecord::file_hash`: a hash over the file's size and its
/// ordered chunk references, so two files with identical bytes but
/// chunked differently still compare equal, and any change to a
/// chunk's identity, offset or length changes the file's hash.
pub fn file_hash(hasher: &dyn Hasher, size: u64, chunks: &[crate::model::ChunkRef]) -> ChunkHash {
    let mut state = hasher.start();
    hasher.update(&mut state, b"FILE:");
    hasher.update(&mut state, &size.to_le_bytes());
    for chunk in chunks {
        hasher.update(&mut state, &chunk.offset.to_le_bytes());
        hasher.update(&mut state, &chunk.length.to_le_bytes());
        hasher.update(&mut state, chunk.chunk_hash.as_bytes());
    }
    hasher.finish(state)
}

/// Flattens a built subtree into post-order `MerkleNode` rows,
/// returning the child reference an enclosing directory uses plus the
/// subtree's total byte size.
fn flatten(
    name: &str,
    node: &BuildNode,
    hasher: &dyn Hasher,
    out: &mut Vec<MerkleNode>,
) -> (MerkleChild, u64) {
    match node {
        BuildNode::File { hash, size } => {
            out.push(MerkleNode {
                hash: *hash,
                kind: MerkleNodeKind::File,
                name: name.to_string(),
                size: *size,
                children: Vec::new(),
            });
            (
                MerkleChild {
                    name: name.to_string(),
                    kind: MerkleNodeKind::File,
                    hash: *hash,
                },
                *size,
            )
        }
        BuildNode::Dir { children } => {
            let mut child_refs = Vec::with_capacity(children.len());
            let mut total_size = 0u64;
            for (child_name, child_node) in children {
                let (child_ref, child_size) = flatten(child_name, child_node, hasher, out);
                total_size += child_size;
                child_refs.push(child_ref);
            }
            let hash = dir_hash(hasher, name, &child_refs);
            out.push(MerkleNode {
                hash,
                kind: MerkleNodeKind::Dir,
                name: name.to_string(),
                size: total_size,
                children: child_refs.clone(),
            });
            (
                MerkleChild {
                    name: name.to_string(),
                    kind: MerkleNodeKind::Dir,
                    hash,
                },
                total_size,
            )
        }
    }
}

/// Builds the full tree for a snapshot's file list and returns every
/// node in post-order (children before parents) along with the root
/// hash. Callers persist the nodes via `Catalog::upsert_merkle_node`
/// in the order returned.
pub fn build(records: &[FileRecord], hasher: &dyn Hasher) -> (Vec<MerkleNode>, ChunkHash) {
    let mut root_children = BTreeMap::new();
    for record in records {
        match record.file_type {
            FileType::Directory => ensure_dir(&mut root_children, &record.relative_path),
            FileType::Regular | FileType::Symlink => {
                insert(&mut root_children, &record.relative_path, record.file_hash, record.size)
            }
        }
    }

    let mut nodes = Vec::new();
    let root = BuildNode::Dir {
        children: root_children,
    };
    let (root_ref, _) = flatten("", &root, hasher, &mut nodes);
    (nodes, root_ref.hash)
}

/// Persists every node from `build` via the catalog. Idempotent: a
/// node already present under the same hash is left untouched.
pub fn persist(catalog: &dyn Catalog, nodes: &[MerkleNode]) -> Result<(), BackupError> {
    for node in nodes {
        catalog.upsert_merkle_node(node)?;
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Deleted,
    Modified,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffEntry {
    pub path: String,
    pub kind: ChangeKind,
}

/// Two-tree diff, driven entirely by hash comparisons so identical
/// subtrees are pruned without ever being read back from the catalog.
pub struct MerkleDiffer<'a> {
    catalog: &'a dyn Catalog,
}

impl<'a> MerkleDiffer<'a> {
    pub fn new(catalog: &'a dyn Catalog) -> Self {
        Self { catalog }
    }

    pub fn diff(
        &self,
        old_root: Option<ChunkHash>,
        new_root: Option<ChunkHash>,
    ) -> Result<Vec<DiffEntry>, BackupError> {
        let mut out = Vec::new();
        self.diff_into("", old_root, new_root, &mut out)?;
        Ok(out)
    }

    fn diff_into(
        &self,
        path_prefix: &str,
        old_hash: Option<ChunkHash>,
        new_hash: Option<ChunkHash>,
        out: &mut Vec<DiffEntry>,
    ) -> Result<(), BackupError> {
        match (old_hash, new_hash) {
            (None, None) => Ok(()),
            (None, Some(new)) => self.emit_subtree(path_prefix, new, ChangeKind::Added, out),
            (Some(old), None) => self.emit_subtree(path_prefix, old, ChangeKind::Deleted, out),
            (Some(old), Some(new)) if old == new => Ok(()),
            (Some(old), Some(new)) => {
                let old_node = self.require_node(old)?;
                let new_node = self.require_node(new)?;
                match (old_node.kind, new_node.kind) {
                    (MerkleNodeKind::File, MerkleNodeKind::File) => {
                        out.push(DiffEntry {
                            path: path_prefix.to_string(),
                            kind: ChangeKind::Modified,
                        });
                        Ok(())
                    }
                    (MerkleNodeKind::Dir, MerkleNodeKind::Dir) => {
                        self.diff_dirs(path_prefix, &old_node, &new_node, out)
                    }
                    _ => {
                        self.emit_subtree(path_prefix, old, ChangeKind::Deleted, out)?;
                        self.emit_subtree(path_prefix, new, ChangeKind::Added, out)
                    }
                }
            }
        }
    }

    fn diff_dirs(
        &self,
        path_prefix: &str,
        old_node: &MerkleNode,
        new_node: &MerkleNode,
        out: &mut Vec<DiffEntry>,
    ) -> Result<(), BackupError> {
        let old_children: BTreeMap<&str, &MerkleChild> =
            old_node.children.iter().map(|c| (c.name.as_str(), c)).collect();
        let new_children: BTreeMap<&str, &MerkleChild> =
            new_node.children.iter().map(|c| (c.name.as_str(), c)).collect();

        let mut names: Vec<&str> = old_children.keys().chain(new_children.keys()).copied().collect();
        names.sort_unstable();
        names.dedup();

        for name in names {
            let child_path = join_path(path_prefix, name);
            let old_hash = old_children.get(name).map(|c| c.hash);
            let new_hash = new_children.get(name).map(|c| c.hash);
            self.diff_into(&child_path, old_hash, new_hash, out)?;
        }
        Ok(())
    }

    fn emit_subtree(
        &self,
        path_prefix: &str,
        hash: ChunkHash,
        kind: ChangeKind,
        out: &mut Vec<DiffEntry>,
    ) -> Result<(), BackupError> {
        let node = self.require_node(hash)?;
        match node.kind {
            MerkleNodeKind::File => {
                out.push(DiffEntry {
                    path: path_prefix.to_string(),
                    kind,
                });
            }
            MerkleNodeKind::Dir => {
                for child in &node.children {
                    let child_path = join_path(path_prefix, &child.name);
                    self.emit_subtree(&child_path, child.hash, kind, out)?;
                }
            }
        }
        Ok(())
    }

    fn require_node(&self, hash: ChunkHash) -> Result<MerkleNode, BackupError> {
        self.catalog
            .get_merkle_node(hash)?
            .ok_or_else(|| BackupError::catalog_invariant(format!("merkle node {hash} missing")))
    }
}

fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

/// Convenience used by the Backup Coordinator: build, persist, and
/// return just the root hash.
pub fn build_and_persist(
    catalog: &dyn Catalog,
    hasher: Arc<dyn Hasher>,
    records: &[FileRecord],
) -> Result<ChunkHash, BackupError> {
    let (nodes, root) = build(records, hasher.as_ref());
    persist(catalog, &nodes)?;
    Ok(root)
}

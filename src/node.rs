//! The package/file ownership tree and its visibility calculus.
//!
//! Every package and file is a Node, identified by its slash-joined `trail`
//! from just below the root.  Privacy narrows who may depend on a node:
//! a public node is visible globally, a protected node only to siblings and
//! their descendants, a private node only to its parent's interior.

use crate::densemap::{declare_id, DenseMap};
use anyhow::bail;
use std::collections::HashMap;

declare_id!(NodeId);

/// Upward walks never legitimately exceed this depth; going past it means a
/// reference cycle and is reported rather than looped on.
const MAX_WALK: usize = 100;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Privacy {
    Public,
    Protected,
    Private,
}

impl Privacy {
    pub fn parse(word: &str) -> Option<Privacy> {
        match word {
            "public" => Some(Privacy::Public),
            "protected" => Some(Privacy::Protected),
            "private" => Some(Privacy::Private),
            _ => None,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum NodeKind {
    Package,
    File,
}

pub struct Node {
    pub name: String,
    pub trail: String,
    pub parent: Option<NodeId>,
    pub privacy: Privacy,
    pub kind: NodeKind,
    /// Insertion-ordered; determines declaration order of the interior.
    pub children: Vec<NodeId>,
    /// Outbound non-ownership references, validated against the visibility
    /// calculus when inserted.
    pub refers: Vec<NodeId>,
}

pub struct Tree {
    nodes: DenseMap<NodeId, Node>,
    by_trail: HashMap<String, NodeId>,
    pub root: NodeId,
}

impl Tree {
    pub fn new() -> Tree {
        let mut nodes = DenseMap::new();
        let root = nodes.push(Node {
            name: String::new(),
            trail: String::new(),
            parent: None,
            privacy: Privacy::Public,
            kind: NodeKind::Package,
            children: Vec::new(),
            refers: Vec::new(),
        });
        Tree {
            nodes,
            by_trail: HashMap::new(),
            root,
        }
    }

    pub fn node(&self, id: NodeId) -> &Node {
        self.nodes.get(id)
    }

    pub fn by_trail(&self, trail: &str) -> Option<NodeId> {
        self.by_trail.get(trail).copied()
    }

    pub fn add(
        &mut self,
        parent: NodeId,
        name: &str,
        privacy: Privacy,
        kind: NodeKind,
    ) -> anyhow::Result<NodeId> {
        if name.is_empty() || name.contains('/') {
            bail!("node name {:?} must be a single path component", name);
        }
        let parent_trail = &self.nodes.get(parent).trail;
        let trail = if parent_trail.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", parent_trail, name)
        };
        if self.by_trail.contains_key(&trail) {
            bail!("duplicate node {:?}", trail);
        }
        let id = self.nodes.push(Node {
            name: name.to_string(),
            trail: trail.clone(),
            parent: Some(parent),
            privacy,
            kind,
            children: Vec::new(),
            refers: Vec::new(),
        });
        self.nodes.get_mut(parent).children.push(id);
        self.by_trail.insert(trail, id);
        Ok(id)
    }

    /// Record that `from` explicitly refers to `to`; the reference must be
    /// legal under the visibility calculus.
    pub fn add_refer(&mut self, from: NodeId, to: NodeId) -> anyhow::Result<()> {
        let viewpoint = self.common_ancestor(from, to)?;
        if !self.visible(to, viewpoint)? {
            bail!(
                "{} may not refer to {}: not visible from {}",
                self.describe(from),
                self.describe(to),
                self.describe(viewpoint),
            );
        }
        let refers = &mut self.nodes.get_mut(from).refers;
        if !refers.contains(&to) {
            refers.push(to);
        }
        Ok(())
    }

    fn describe(&self, id: NodeId) -> String {
        let trail = &self.nodes.get(id).trail;
        if trail.is_empty() {
            "<root>".to_string()
        } else {
            trail.clone()
        }
    }

    /// Is x a descendant of y (or y itself)?
    pub fn is_descendant(&self, x: NodeId, y: NodeId) -> anyhow::Result<bool> {
        let mut cur = Some(x);
        for _ in 0..MAX_WALK {
            match cur {
                None => return Ok(false),
                Some(n) if n == y => return Ok(true),
                Some(n) => cur = self.nodes.get(n).parent,
            }
        }
        bail!(
            "circular reference walking up from {}",
            self.describe(x)
        );
    }

    /// The package owning a node: its nearest package ancestor (itself when
    /// it is a package).
    pub fn package_of(&self, id: NodeId) -> NodeId {
        let mut cur = id;
        loop {
            let node = self.nodes.get(cur);
            if node.kind == NodeKind::Package {
                return cur;
            }
            cur = node.parent.expect("file node without package ancestor");
        }
    }

    pub fn common_ancestor(&self, a: NodeId, b: NodeId) -> anyhow::Result<NodeId> {
        let mut cur = a;
        for _ in 0..MAX_WALK {
            if self.is_descendant(b, cur)? {
                return Ok(cur);
            }
            cur = match self.nodes.get(cur).parent {
                Some(p) => p,
                None => return Ok(self.root),
            };
        }
        bail!(
            "circular reference between {} and {}",
            self.describe(a),
            self.describe(b)
        );
    }

    /// Is x visible from the given viewpoint node?  Walk x upward toward the
    /// root, accumulating an effective privacy that starts at x's own.  The
    /// walk may always rise one level (a protected or private node escapes
    /// exactly to its parent's viewpoint); past that, crossing any node once
    /// the accumulated privacy is protected raises it a notch to private,
    /// which excludes x.  Reaching the viewpoint first means visible.
    pub fn visible(&self, x: NodeId, viewpoint: NodeId) -> anyhow::Result<bool> {
        if x == viewpoint {
            return Ok(true);
        }
        let mut effective = self.nodes.get(x).privacy;
        let mut cur = self.nodes.get(x).parent;
        for _ in 0..MAX_WALK {
            let n = match cur {
                None => return Ok(false),
                Some(n) => n,
            };
            if n == viewpoint {
                return Ok(true);
            }
            effective = effective.max(self.nodes.get(n).privacy);
            if effective >= Privacy::Protected {
                // The next crossing would notch it to private.
                return Ok(false);
            }
            cur = self.nodes.get(n).parent;
        }
        bail!("circular reference walking up from {}", self.describe(x));
    }

    /// May file node `a` depend on file node `b`?  Requires declaration
    /// order (a after b, unless b is inside a), package direction (a's
    /// package must not live inside b's package), and visibility of b from
    /// the two nodes' common ancestor.  NodeIds are assigned in declaration
    /// order, so id comparison is the number comparison.
    pub fn can_depend(&self, a: NodeId, b: NodeId) -> anyhow::Result<()> {
        if a == b {
            bail!("{} may not depend on itself", self.describe(a));
        }
        if a < b && !self.is_descendant(b, a)? {
            bail!(
                "{} may not depend on {}: forward reference (declaration order)",
                self.describe(a),
                self.describe(b)
            );
        }
        let pkg_a = self.package_of(a);
        let pkg_b = self.package_of(b);
        if pkg_a != pkg_b && self.is_descendant(pkg_a, pkg_b)? {
            bail!(
                "{} may not depend on {}: package {} is a descendant of package {}",
                self.describe(a),
                self.describe(b),
                self.describe(pkg_a),
                self.describe(pkg_b)
            );
        }
        let viewpoint = self.common_ancestor(a, b)?;
        if !self.visible(b, viewpoint)? {
            bail!(
                "{} may not depend on {}: {} is not visible from {}",
                self.describe(a),
                self.describe(b),
                self.describe(b),
                self.describe(viewpoint)
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct T {
        tree: Tree,
    }

    impl T {
        fn new() -> T {
            T { tree: Tree::new() }
        }

        fn pkg(&mut self, trail: &str, privacy: Privacy) -> NodeId {
            let (parent, name) = match trail.rsplit_once('/') {
                Some((p, n)) => (self.tree.by_trail(p).unwrap(), n),
                None => (self.tree.root, trail),
            };
            self.tree.add(parent, name, privacy, NodeKind::Package).unwrap()
        }

        fn file(&mut self, trail: &str, privacy: Privacy) -> NodeId {
            let (parent, name) = trail.rsplit_once('/').unwrap();
            let parent = self.tree.by_trail(parent).unwrap();
            self.tree.add(parent, name, privacy, NodeKind::File).unwrap()
        }
    }

    #[test]
    fn trails_and_duplicates() {
        let mut t = T::new();
        let p = t.pkg("p", Privacy::Public);
        assert_eq!(t.tree.node(p).trail, "p");
        let q = t.pkg("p/q", Privacy::Public);
        assert_eq!(t.tree.node(q).trail, "p/q");
        assert!(t
            .tree
            .add(t.tree.root, "p", Privacy::Public, NodeKind::Package)
            .is_err());
        assert!(t
            .tree
            .add(t.tree.root, "a/b", Privacy::Public, NodeKind::Package)
            .is_err());
    }

    #[test]
    fn public_visible_globally() {
        let mut t = T::new();
        t.pkg("p", Privacy::Public);
        t.pkg("p/lo", Privacy::Public);
        t.pkg("q", Privacy::Public);
        let b = t.file("p/lo/lo.h", Privacy::Public);
        t.pkg("q/deep", Privacy::Public);
        let a = t.file("q/deep/a.cpp", Privacy::Public);
        assert!(t.tree.can_depend(a, b).is_ok());
    }

    #[test]
    fn protected_package_interior_is_sealed() {
        let mut t = T::new();
        t.pkg("p", Privacy::Public);
        t.pkg("p/a", Privacy::Protected);
        let b = t.file("p/a/foo.h", Privacy::Public);
        t.pkg("p/b", Privacy::Public);
        let sib = t.file("p/b/bar.cpp", Privacy::Public);
        // Contents of a protected package are not visible to siblings...
        let err = t.tree.can_depend(sib, b).unwrap_err().to_string();
        assert!(err.contains("not visible"), "{}", err);
        // ...but files in the same protected package may use each other.
        let peer = t.file("p/a/bar.cpp", Privacy::Public);
        assert!(t.tree.can_depend(peer, b).is_ok());
    }

    #[test]
    fn protected_node_visible_to_siblings() {
        let mut t = T::new();
        t.pkg("p", Privacy::Public);
        let b = t.file("p/guts.h", Privacy::Protected);
        let a = t.file("p/use.cpp", Privacy::Public);
        // Visible at the parent's viewpoint.
        assert!(t.tree.can_depend(a, b).is_ok());

        t.pkg("q", Privacy::Public);
        let outsider = t.file("q/out.cpp", Privacy::Public);
        assert!(t.tree.can_depend(outsider, b).is_err());

        // A protected package may itself be referred to by its siblings.
        t.pkg("p2", Privacy::Public);
        let shielded = t.pkg("p2/impl", Privacy::Protected);
        let peer = t.pkg("p2/app", Privacy::Public);
        assert!(t.tree.add_refer(peer, shielded).is_ok());
    }

    #[test]
    fn private_file_limited_to_package_interior() {
        let mut t = T::new();
        t.pkg("p", Privacy::Public);
        let b = t.file("p/inner.h", Privacy::Private);
        let a = t.file("p/user.cpp", Privacy::Public);
        assert!(t.tree.can_depend(a, b).is_ok());

        t.pkg("q", Privacy::Public);
        let outsider = t.file("q/out.cpp", Privacy::Public);
        assert!(t.tree.can_depend(outsider, b).is_err());
    }

    #[test]
    fn forward_reference_rejected() {
        let mut t = T::new();
        t.pkg("p", Privacy::Public);
        let a = t.file("p/early.cpp", Privacy::Public);
        let b = t.file("p/late.h", Privacy::Public);
        let err = t.tree.can_depend(a, b).unwrap_err().to_string();
        assert!(err.contains("forward reference"), "{}", err);
        assert!(t.tree.can_depend(b, a).is_ok());
    }

    #[test]
    fn package_may_not_depend_upward() {
        let mut t = T::new();
        t.pkg("p", Privacy::Public);
        let b = t.file("p/base.h", Privacy::Public);
        t.pkg("p/sub", Privacy::Public);
        let a = t.file("p/sub/impl.cpp", Privacy::Public);
        let err = t.tree.can_depend(a, b).unwrap_err().to_string();
        assert!(err.contains("descendant of package"), "{}", err);
    }

    #[test]
    fn refer_requires_visibility() {
        let mut t = T::new();
        t.pkg("p", Privacy::Public);
        let hidden = t.pkg("p/hidden", Privacy::Private);
        let q = t.pkg("q", Privacy::Public);
        assert!(t.tree.add_refer(q, hidden).is_err());
        let open = t.pkg("p/open", Privacy::Public);
        assert!(t.tree.add_refer(q, open).is_ok());
    }
}

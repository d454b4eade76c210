//! The action graph: Files (on-disk artifacts, source or built), Actions
//! (build steps over them), reverse dependency edges, the issue queue and
//! the generator fence.

use crate::densemap::{declare_id, DenseMap};
use crate::node::NodeId;
use anyhow::bail;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

declare_id!(FileId);
declare_id!(ActionId);

/// `newest` value marking an action maximally dirty: a cached dep referred
/// to a path we no longer know, so the only safe assumption is "newer than
/// everything".
pub const NEWEST_UNKNOWN: u64 = u64::MAX;

pub struct File {
    pub node: NodeId,
    /// Build-dir-relative path.
    pub path: String,
    /// True if produced by an action.
    pub built: bool,
    /// The step that produces this file; cleared once it completes.
    pub action: Option<ActionId>,
    /// Reverse edges: files whose action or includes depend on this file.
    pub depended_by: Vec<FileId>,
    /// Include/import dependencies discovered by scanning, lazily.
    pub includes: Vec<FileId>,
    pub scanned: bool,
    pub augmented: bool,
    /// Last known modification time (seconds); None while absent.
    pub mtime: Option<u64>,
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum ActionKind {
    Compile,
    /// Produces source-kind files; ordered by the generator fence.
    Generate,
    StaticLib,
    DynamicLib,
    Exe,
    Copy,
    Test,
}

pub struct Action {
    pub name: String,
    /// Bubfile path and line of the declaring statement.
    pub origin: (String, usize),
    pub kind: ActionKind,
    /// Unresolved command template; resolved just before dispatch.
    pub command: String,
    pub inputs: Vec<FileId>,
    pub builds: Vec<FileId>,
    /// Superset of inputs; also the owning package's Bubfile, in-project
    /// tools named in the command, cached deps and augmentation results.
    pub depends: Vec<FileId>,
    /// Max modTime of cached system (absolute-path) deps, or NEWEST_UNKNOWN.
    pub newest: u64,
    /// Link tokens resolved at augmentation time, for `${LIBS}`.
    pub libs: Vec<String>,
    pub issued: bool,
    pub done: bool,
}

impl Action {
    pub fn number(id: ActionId) -> u32 {
        use crate::densemap::Index;
        id.index() as u32
    }

    /// Where the command should write its discovered dependencies.
    pub fn deps_path(id: ActionId) -> String {
        use crate::densemap::Index;
        format!("tmp/DEPENDENCIES-{}", id.index())
    }
}

#[derive(Default)]
pub struct Graph {
    pub files: DenseMap<FileId, File>,
    pub by_path: HashMap<String, FileId>,
    pub actions: DenseMap<ActionId, Action>,
    queue: BinaryHeap<Reverse<ActionId>>,
    /// Generator actions in declaration (= number) order.
    generators: Vec<ActionId>,
    next_generator: usize,
}

impl Graph {
    pub fn new() -> Graph {
        Graph::default()
    }

    pub fn file(&self, id: FileId) -> &File {
        self.files.get(id)
    }

    pub fn file_mut(&mut self, id: FileId) -> &mut File {
        self.files.get_mut(id)
    }

    pub fn action(&self, id: ActionId) -> &Action {
        self.actions.get(id)
    }

    pub fn action_mut(&mut self, id: ActionId) -> &mut Action {
        self.actions.get_mut(id)
    }

    pub fn lookup_path(&self, path: &str) -> Option<FileId> {
        self.by_path.get(path).copied()
    }

    pub fn add_file(&mut self, node: NodeId, path: String, built: bool) -> anyhow::Result<FileId> {
        if self.by_path.contains_key(&path) {
            bail!("duplicate file path {:?}", path);
        }
        let id = self.files.push(File {
            node,
            path: path.clone(),
            built,
            action: None,
            depended_by: Vec::new(),
            includes: Vec::new(),
            scanned: false,
            augmented: false,
            mtime: None,
        });
        self.by_path.insert(path, id);
        Ok(id)
    }

    /// Create an action building `builds` from `inputs`.  `depends` starts
    /// as the inputs; callers extend it with the owning Bubfile, referenced
    /// tools and cached deps.
    pub fn add_action(
        &mut self,
        name: String,
        origin: (String, usize),
        kind: ActionKind,
        command: String,
        inputs: Vec<FileId>,
        builds: Vec<FileId>,
    ) -> anyhow::Result<ActionId> {
        if builds.is_empty() {
            bail!("action {:?} builds nothing", name);
        }
        let id = self.actions.next_id();
        for &out in &builds {
            let file = self.files.get_mut(out);
            if file.action.is_some() {
                bail!("two actions build {:?}", file.path);
            }
            file.action = Some(id);
        }
        let depends = inputs.clone();
        for &input in &inputs {
            self.add_reverse_edges(input, &builds);
        }
        let id2 = self.actions.push(Action {
            name,
            origin,
            kind,
            command,
            inputs,
            builds,
            depends,
            newest: 0,
            libs: Vec::new(),
            issued: false,
            done: false,
        });
        debug_assert_eq!(id, id2);
        if kind == ActionKind::Generate {
            self.generators.push(id);
        }
        Ok(id)
    }

    fn add_reverse_edges(&mut self, depend: FileId, builds: &[FileId]) {
        for &out in builds {
            let edges = &mut self.files.get_mut(depend).depended_by;
            if !edges.contains(&out) {
                edges.push(out);
            }
        }
    }

    /// Add a dependency to an action after construction.  Only single-output
    /// actions accept late dependencies; multi-output actions are frozen.
    pub fn add_dependency(&mut self, id: ActionId, depend: FileId) -> anyhow::Result<()> {
        let action = self.actions.get(id);
        if action.builds.len() > 1 {
            bail!(
                "{}|{}| ERROR: action {:?} builds multiple files and cannot take new dependencies",
                action.origin.0,
                action.origin.1,
                action.name
            );
        }
        if action.issued {
            bail!(
                "{}|{}| ERROR: action {:?} already issued",
                action.origin.0,
                action.origin.1,
                action.name
            );
        }
        if action.depends.contains(&depend) {
            return Ok(());
        }
        let builds = action.builds.clone();
        self.actions.get_mut(id).depends.push(depend);
        self.add_reverse_edges(depend, &builds);
        Ok(())
    }

    /// Queue an action for dispatch; the queue yields lowest number first.
    pub fn enqueue(&mut self, id: ActionId) {
        self.actions.get_mut(id).issued = true;
        self.queue.push(Reverse(id));
    }

    pub fn dequeue(&mut self) -> Option<ActionId> {
        self.queue.pop().map(|Reverse(id)| id)
    }

    /// The generator fence: no action numbered above it may be issued until
    /// the fence generator completes.
    pub fn fence(&self) -> u32 {
        match self.generators.get(self.next_generator) {
            Some(&id) => Action::number(id),
            None => u32::MAX,
        }
    }

    /// Mark an action complete.  Returns true if the generator fence moved,
    /// in which case every outstanding file deserves re-evaluation.
    pub fn action_done(&mut self, id: ActionId) -> bool {
        self.actions.get_mut(id).done = true;
        let before = self.next_generator;
        while let Some(&gen) = self.generators.get(self.next_generator) {
            if !self.actions.get(gen).done {
                break;
            }
            self.next_generator += 1;
        }
        self.next_generator != before
    }
}

/// stat() a path for its mtime in whole seconds; None when absent.
pub fn stat_mtime(path: &std::path::Path) -> std::io::Result<Option<u64>> {
    use std::os::unix::fs::MetadataExt;
    match std::fs::metadata(path) {
        Ok(meta) => Ok(Some(meta.mtime() as u64)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{NodeKind, Privacy, Tree};

    struct G {
        graph: Graph,
        tree: Tree,
    }

    impl G {
        fn new() -> G {
            G {
                graph: Graph::new(),
                tree: Tree::new(),
            }
        }

        fn file(&mut self, path: &str, built: bool) -> FileId {
            let name = path.rsplit('/').next().unwrap();
            let node = self
                .tree
                .add(self.tree.root, name, Privacy::Public, NodeKind::File)
                .unwrap();
            self.graph.add_file(node, path.to_string(), built).unwrap()
        }

        fn action(&mut self, kind: ActionKind, ins: Vec<FileId>, outs: Vec<FileId>) -> ActionId {
            let name = self.graph.file(outs[0]).path.clone();
            self.graph
                .add_action(
                    name,
                    ("Bubfile".to_string(), 1),
                    kind,
                    String::new(),
                    ins,
                    outs,
                )
                .unwrap()
        }
    }

    #[test]
    fn queue_yields_declaration_order() {
        let mut g = G::new();
        let a = g.file("obj/a.o", true);
        let b = g.file("obj/b.o", true);
        let c = g.file("obj/c.o", true);
        let aa = g.action(ActionKind::Compile, vec![], vec![a]);
        let ab = g.action(ActionKind::Compile, vec![], vec![b]);
        let ac = g.action(ActionKind::Compile, vec![], vec![c]);
        g.graph.enqueue(ac);
        g.graph.enqueue(aa);
        g.graph.enqueue(ab);
        assert_eq!(g.graph.dequeue(), Some(aa));
        assert_eq!(g.graph.dequeue(), Some(ab));
        assert_eq!(g.graph.dequeue(), Some(ac));
        assert_eq!(g.graph.dequeue(), None);
    }

    #[test]
    fn fence_tracks_next_incomplete_generator() {
        let mut g = G::new();
        let idl = g.file("src/m.idl", false);
        let gen_h = g.file("obj/m.h", true);
        let obj = g.file("obj/m.o", true);
        let ag = g.action(ActionKind::Generate, vec![idl], vec![gen_h]);
        let ao = g.action(ActionKind::Compile, vec![], vec![obj]);
        assert_eq!(g.graph.fence(), Action::number(ag));
        assert!(Action::number(ao) > g.graph.fence());

        let moved = g.graph.action_done(ag);
        assert!(moved);
        assert_eq!(g.graph.fence(), u32::MAX);
        assert!(!g.graph.action_done(ao));
    }

    #[test]
    fn multi_output_actions_are_frozen() {
        let mut g = G::new();
        let idl = g.file("src/m.idl", false);
        let h = g.file("obj/m.h", true);
        let cpp = g.file("obj/m.cpp", true);
        let extra = g.file("src/extra.h", false);
        let a = g.action(ActionKind::Generate, vec![idl], vec![h, cpp]);
        assert!(g.graph.add_dependency(a, extra).is_err());

        let single = g.file("obj/s.o", true);
        let b = g.action(ActionKind::Compile, vec![], vec![single]);
        assert!(g.graph.add_dependency(b, extra).is_ok());
        // Adding the same dependency again is a no-op.
        assert!(g.graph.add_dependency(b, extra).is_ok());
        assert_eq!(g.graph.action(b).depends.len(), 1);

        g.graph.enqueue(b);
        assert!(g.graph.add_dependency(b, idl).is_err());
    }

    #[test]
    fn double_build_rejected() {
        let mut g = G::new();
        let out = g.file("obj/a.o", true);
        g.action(ActionKind::Compile, vec![], vec![out]);
        let err = g
            .graph
            .add_action(
                "again".to_string(),
                ("Bubfile".to_string(), 2),
                ActionKind::Compile,
                String::new(),
                vec![],
                vec![out],
            )
            .unwrap_err()
            .to_string();
        assert!(err.contains("two actions build"), "{}", err);
    }
}

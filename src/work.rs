//! Build runner: drives the per-file state machine, infers library link
//! sets from the dependency cache, and schedules ready actions over the
//! worker pool in declaration order.
//!
//! A built file is `outstanding` until its action completes this run.  Its
//! action may issue once the generator fence permits it and every depend is
//! clean: up to date and, for source-kind files, include-scanned with every
//! scanned include clean in turn.  Include scanning happens lazily, after a
//! file becomes up to date, so generated headers are scanned with their
//! final contents.

use crate::binary::{BinaryId, BinaryKind, SysLibId};
use crate::depsfile;
use crate::graph::{stat_mtime, Action, ActionId, ActionKind, FileId, NEWEST_UNKNOWN};
use crate::includes;
use crate::load::Project;
use crate::options::Builtins;
use crate::progress::ConsoleProgress;
use crate::signal;
use crate::task::{Pool, Termination, WorkItem};
use anyhow::{anyhow, bail};
use std::cmp::Reverse;
use std::collections::HashSet;
use std::path::Path;

/// Include chains deeper than this only happen when headers form a cycle.
const MAX_INCLUDE_DEPTH: usize = 100;

pub struct Work<'a> {
    pub project: Project,
    progress: &'a ConsoleProgress,
    /// Built files whose action has not completed successfully this run.
    outstanding: HashSet<FileId>,
    /// Files actually rebuilt this run.
    updated: usize,
}

impl<'a> Work<'a> {
    pub fn new(mut project: Project, progress: &'a ConsoleProgress) -> anyhow::Result<Work<'a>> {
        let mut outstanding = HashSet::new();
        for fid in project.graph.files.ids().collect::<Vec<_>>() {
            let path = project.graph.file(fid).path.clone();
            project.graph.file_mut(fid).mtime = stat_mtime(Path::new(&path))?;
            if project.graph.file(fid).built {
                outstanding.insert(fid);
            }
        }
        Ok(Work {
            project,
            progress,
            outstanding,
            updated: 0,
        })
    }

    pub fn counts(&self) -> (usize, usize, usize) {
        let seen = self.project.graph.files.len();
        let built = self
            .project
            .graph
            .files
            .iter()
            .filter(|(_, f)| f.built)
            .count();
        (seen, built, self.updated)
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }

    /// Delete anything under obj/, priv/ and dist/ that this build does not
    /// produce, so stale outputs from prior runs can never masquerade as
    /// fresh.  Also materialises tmp/ for deps files and worker scratch.
    pub fn cleanup_stale(&self) -> anyhow::Result<()> {
        let keep: HashSet<&str> = self
            .project
            .graph
            .files
            .iter()
            .filter(|(_, f)| f.built)
            .map(|(_, f)| f.path.as_str())
            .collect();
        for top in ["obj", "priv", "dist"] {
            if Path::new(top).is_dir() {
                remove_stale(Path::new(top), &keep)?;
            }
        }
        std::fs::create_dir_all("tmp")?;
        Ok(())
    }

    /// The scheduling loop.  Returns true when every outstanding file became
    /// up to date, false when the build was cancelled by a failure or a
    /// signal.
    pub fn run(&mut self, pool: &mut Pool) -> anyhow::Result<bool> {
        for fid in self.sorted_outstanding() {
            self.issue_if_ready(fid)?;
        }

        loop {
            if signal::interrupted() {
                self.progress.log("bub: interrupted");
                pool.shutdown();
                return Ok(false);
            }

            let mut dispatched = false;
            while pool.can_start_more() {
                let aid = match self.project.graph.dequeue() {
                    Some(aid) => aid,
                    None => break,
                };
                self.dispatch(pool, aid)?;
                dispatched = true;
            }

            if self.outstanding.is_empty() && pool.running() == 0 {
                pool.shutdown();
                return Ok(true);
            }
            if pool.running() == 0 && !dispatched {
                pool.shutdown();
                bail!(
                    "scheduler stalled: all workers idle with {} files outstanding",
                    self.outstanding.len()
                );
            }

            let fin = pool.wait()?;
            match fin.termination {
                Termination::Success => self.action_succeeded(fin.id)?,
                Termination::Interrupted => {
                    self.progress.interrupted(&fin.name);
                    pool.shutdown();
                    return Ok(false);
                }
                Termination::Failure => {
                    let command = self.resolve_command(fin.id);
                    self.progress.task_failed(&fin.name, &command, &fin.output);
                    pool.shutdown();
                    return Ok(false);
                }
            }
        }
    }

    fn sorted_outstanding(&self) -> Vec<FileId> {
        let mut files: Vec<FileId> = self.outstanding.iter().copied().collect();
        files.sort();
        files
    }

    fn resolve_command(&self, aid: ActionId) -> String {
        let action = self.project.graph.action(aid);
        let input: Vec<String> = action
            .inputs
            .iter()
            .map(|&f| self.project.graph.file(f).path.clone())
            .collect();
        let output: Vec<String> = action
            .builds
            .iter()
            .map(|&f| self.project.graph.file(f).path.clone())
            .collect();
        let deps = Action::deps_path(aid);
        self.project.options.resolve_command(
            &action.command,
            &Builtins {
                input: &input,
                output: &output,
                deps: Some(&deps),
                libs: &action.libs,
            },
        )
    }

    fn dispatch(&mut self, pool: &mut Pool, aid: ActionId) -> anyhow::Result<()> {
        let command = self.resolve_command(aid);
        let action = self.project.graph.action(aid);
        let mut targets = Vec::new();
        for &out in &action.builds {
            let path = &self.project.graph.file(out).path;
            ensure_parent(Path::new(path))?;
            targets.push(path.clone());
        }
        let item = WorkItem {
            id: aid,
            name: action.name.clone(),
            command: command.clone(),
            targets: targets.join("|"),
            is_test: action.kind == ActionKind::Test,
        };
        self.progress.task_started(&action.name, &command);
        pool.dispatch(item)
    }

    /// A worker reported success: absorb the deps file, refresh the cache
    /// entry and output mtimes, and trigger whatever became ready.
    fn action_succeeded(&mut self, aid: ActionId) -> anyhow::Result<()> {
        let action = self.project.graph.action(aid);
        let origin = action.origin.clone();
        let builds = action.builds.clone();
        let input_paths: HashSet<String> = action
            .inputs
            .iter()
            .map(|&f| self.project.graph.file(f).path.clone())
            .collect();

        let deps_path = Action::deps_path(aid);
        let text = std::fs::read_to_string(&deps_path).unwrap_or_default();
        let mut deps = depsfile::parse(&text);
        deps.retain(|d| !input_paths.contains(d));

        let build0 = builds[0];
        let build0_node = self.project.graph.file(build0).node;
        for dep in &deps {
            if dep.starts_with('/') {
                continue;
            }
            let did = self.project.graph.lookup_path(dep).ok_or_else(|| {
                anyhow!(
                    "{}|{}| ERROR: discovered dependency on unknown file {:?}",
                    origin.0,
                    origin.1,
                    dep
                )
            })?;
            let dep_node = self.project.graph.file(did).node;
            self.project
                .tree
                .can_depend(build0_node, dep_node)
                .map_err(|e| anyhow!("{}|{}| ERROR: {}", origin.0, origin.1, e))?;
        }
        let build0_path = self.project.graph.file(build0).path.clone();
        self.project.cache.set(&build0_path, deps);

        for &out in &builds {
            let path = self.project.graph.file(out).path.clone();
            let mtime = stat_mtime(Path::new(&path))?;
            if mtime.is_none() {
                bail!(
                    "{}|{}| ERROR: action succeeded but {:?} was not produced",
                    origin.0,
                    origin.1,
                    path
                );
            }
            self.project.graph.file_mut(out).mtime = mtime;
        }
        self.updated += builds.len();
        self.complete_action(aid)
    }

    /// Common tail for actions that ran and actions that were already up to
    /// date: the files leave `outstanding`, get their includes scanned, and
    /// their reverse edges are woken.
    fn complete_action(&mut self, aid: ActionId) -> anyhow::Result<()> {
        let builds = self.project.graph.action(aid).builds.clone();
        let fence_moved = self.project.graph.action_done(aid);
        for &out in &builds {
            self.outstanding.remove(&out);
            self.ensure_scanned(out)?;
        }
        for &out in &builds {
            self.wake(out)?;
        }
        if fence_moved {
            for fid in self.sorted_outstanding() {
                self.issue_if_ready(fid)?;
            }
        }
        Ok(())
    }

    /// A file became clean: re-examine everything that depends on it,
    /// transitively through source files that include it.
    fn wake(&mut self, start: FileId) -> anyhow::Result<()> {
        let mut stack = vec![start];
        let mut visited = HashSet::new();
        while let Some(fid) = stack.pop() {
            for dep in self.project.graph.file(fid).depended_by.clone() {
                if !visited.insert(dep) {
                    continue;
                }
                if self.outstanding.contains(&dep) {
                    self.issue_if_ready(dep)?;
                } else if !self.project.graph.file(dep).built {
                    stack.push(dep);
                }
            }
        }
        Ok(())
    }

    /// Check whether a file's action can issue, and issue it.  An action
    /// issues once the generator fence allows its number and all its depends
    /// are clean; if its output is already newer than every depend it
    /// completes on the spot instead of running.
    fn issue_if_ready(&mut self, fid: FileId) -> anyhow::Result<()> {
        if !self.outstanding.contains(&fid) {
            return Ok(());
        }
        let aid = match self.project.graph.file(fid).action {
            Some(aid) => aid,
            None => return Ok(()),
        };
        if self.project.graph.action(aid).issued {
            return Ok(());
        }
        if Action::number(aid) > self.project.graph.fence() {
            return Ok(());
        }
        for dep in self.project.graph.action(aid).depends.clone() {
            if !self.is_clean(dep, 0)? {
                return Ok(());
            }
        }

        if !self.project.graph.file(fid).augmented {
            self.project.graph.file_mut(fid).augmented = true;
            if self.augment(fid)? {
                for dep in self.project.graph.action(aid).depends.clone() {
                    if !self.is_clean(dep, 0)? {
                        // The inference added a depend that is still being
                        // built; its completion wakes us again.
                        return Ok(());
                    }
                }
            }
        }

        let action = self.project.graph.action(aid);
        let mut out_mtime = u64::MAX;
        let mut missing = false;
        for &out in &action.builds {
            match self.project.graph.file(out).mtime {
                Some(t) => out_mtime = out_mtime.min(t),
                None => missing = true,
            }
        }
        let mut dirty = missing || action.newest == NEWEST_UNKNOWN || action.newest > out_mtime;
        if !dirty {
            for &dep in &action.depends {
                if self
                    .project
                    .graph
                    .file(dep)
                    .mtime
                    .map_or(true, |t| t > out_mtime)
                {
                    dirty = true;
                    break;
                }
            }
        }

        if dirty {
            self.project.graph.enqueue(aid);
        } else {
            self.project.graph.action_mut(aid).issued = true;
            self.complete_action(aid)?;
        }
        Ok(())
    }

    /// A file is clean when it is up to date, include-scanned, and every
    /// include is clean in turn.
    fn is_clean(&mut self, fid: FileId, depth: usize) -> anyhow::Result<bool> {
        if depth > MAX_INCLUDE_DEPTH {
            bail!(
                "include depth limit exceeded at {:?}: circular includes?",
                self.project.graph.file(fid).path
            );
        }
        if self.outstanding.contains(&fid) {
            return Ok(false);
        }
        self.ensure_scanned(fid)?;
        for inc in self.project.graph.file(fid).includes.clone() {
            if !self.is_clean(inc, depth + 1)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Scan a source-kind file for includes/imports, once, resolving each to
    /// a known file and validating it against the visibility calculus.
    fn ensure_scanned(&mut self, fid: FileId) -> anyhow::Result<()> {
        if self.project.graph.file(fid).scanned {
            return Ok(());
        }
        self.project.graph.file_mut(fid).scanned = true;
        let path = self.project.graph.file(fid).path.clone();
        let kind = match includes::source_kind(&path) {
            Some(kind) => kind,
            None => return Ok(()),
        };
        let text = std::fs::read_to_string(&path)
            .map_err(|e| anyhow!("{}| ERROR: cannot scan includes: {}", path, e))?;
        let externals = self.project.options.values("EXTERNALS").to_vec();
        for dep in includes::scan(&text, kind, &externals) {
            let did = self
                .resolve_include(&dep)
                .ok_or_else(|| anyhow!("{}| ERROR: includes unknown file {:?}", path, dep))?;
            if did == fid {
                continue;
            }
            let a = self.project.graph.file(fid).node;
            let b = self.project.graph.file(did).node;
            self.project
                .tree
                .can_depend(a, b)
                .map_err(|e| anyhow!("{}| ERROR: {}", path, e))?;
            if !self.project.graph.file(fid).includes.contains(&did) {
                self.project.graph.file_mut(fid).includes.push(did);
                let edges = &mut self.project.graph.file_mut(did).depended_by;
                if !edges.contains(&fid) {
                    edges.push(fid);
                }
            }
        }
        Ok(())
    }

    /// Includes are written relative to the src root; generated sources live
    /// under obj/ with the same package-trail layout.
    fn resolve_include(&self, dep: &str) -> Option<FileId> {
        for prefix in ["src/", "obj/"] {
            if let Some(fid) = self.project.graph.lookup_path(&format!("{}{}", prefix, dep)) {
                return Some(fid);
            }
        }
        None
    }

    /// The library-inference pass, run once per DynamicLib/Exe the first
    /// time all its explicit depends are clean: walk the dependency-cache
    /// closure of its objects to find which static libs, dynamic libs and
    /// system libs to link.  Returns true if new dependencies were added.
    fn augment(&mut self, fid: FileId) -> anyhow::Result<bool> {
        let bid = match self.project.binaries.container(fid) {
            Some(bid) => bid,
            None => return Ok(false),
        };
        {
            let binary = self.project.binaries.get(bid);
            if binary.file != fid {
                return Ok(false);
            }
            match binary.kind {
                BinaryKind::DynamicLib | BinaryKind::Exe(_) => {}
                BinaryKind::StaticLib { .. } => return Ok(false),
            }
        }
        let dynamic_target = matches!(self.project.binaries.get(bid).kind, BinaryKind::DynamicLib);
        let target_node = self.project.binaries.get(bid).node;
        let target_name = self.project.graph.file(fid).path.clone();
        let target_action = self
            .project
            .graph
            .file(fid)
            .action
            .expect("augmenting a file without an action");

        let mut syslibs: Vec<SysLibId> = Vec::new();
        for &sl in &self.project.binaries.get(bid).syslibs {
            if !syslibs.contains(&sl) {
                syslibs.push(sl);
            }
        }
        let mut static_group: Vec<BinaryId> = Vec::new();
        let mut dynamic_group: Vec<BinaryId> = Vec::new();
        let mut worklist: Vec<FileId> = self.project.binaries.get(bid).objs.clone();
        let mut seen: HashSet<FileId> = worklist.iter().copied().collect();
        let mut added = false;

        while let Some(obj) = worklist.pop() {
            let obj_path = self.project.graph.file(obj).path.clone();
            let cached = match self.project.cache.get(&obj_path) {
                Some(deps) => deps.to_vec(),
                None => continue,
            };
            for dep in cached {
                if dep.starts_with('/') {
                    continue;
                }
                let did = self.project.graph.lookup_path(&dep).ok_or_else(|| {
                    anyhow!(
                        "{}| ERROR: dependency cache names unknown file {:?}",
                        obj_path,
                        dep
                    )
                })?;
                let container = self.project.binaries.container(did).ok_or_else(|| {
                    anyhow!(
                        "{}| ERROR: no binary owns {:?}, needed to infer libraries for {:?}",
                        obj_path,
                        dep,
                        target_name
                    )
                })?;
                for &sl in &self.project.binaries.get(container).syslibs.clone() {
                    if !syslibs.contains(&sl) {
                        syslibs.push(sl);
                    }
                }
                if container == bid {
                    continue;
                }
                if !matches!(
                    self.project.binaries.get(container).kind,
                    BinaryKind::StaticLib { .. }
                ) {
                    bail!(
                        "{}| ERROR: {:?} belongs to {:?}, which is not a static lib",
                        obj_path,
                        dep,
                        self.project.graph.file(self.project.binaries.get(container).file).path
                    );
                }

                if let Some(dlib) = self.project.binaries.dynamic_for(container) {
                    if dlib == bid {
                        continue;
                    }
                    if self.project.binaries.get(dlib).node < target_node {
                        if !dynamic_group.contains(&dlib) {
                            dynamic_group.push(dlib);
                            let lib_file = self.project.binaries.get(dlib).file;
                            added |= self.add_link_depend(target_action, lib_file)?;
                            for slib in self.project.binaries.get(dlib).static_libs.clone() {
                                for o in self.project.binaries.get(slib).objs.clone() {
                                    if seen.insert(o) {
                                        worklist.push(o);
                                    }
                                }
                            }
                        }
                        continue;
                    }
                }

                if dynamic_target {
                    let needed = self
                        .project
                        .graph
                        .file(self.project.binaries.get(container).file)
                        .path
                        .clone();
                    bail!(
                        "{}| ERROR: dynamic lib {:?} requires static lib {:?}, \
                         which no earlier dynamic lib packages",
                        obj_path,
                        target_name,
                        needed
                    );
                }
                if !static_group.contains(&container) {
                    static_group.push(container);
                    let lib_file = self.project.binaries.get(container).file;
                    added |= self.add_link_depend(target_action, lib_file)?;
                    for o in self.project.binaries.get(container).objs.clone() {
                        if seen.insert(o) {
                            worklist.push(o);
                        }
                    }
                }
            }
        }

        // Link order: static libs, then dynamic libs, then system libs;
        // each group by declaration number descending, leaves last.
        static_group.sort_by_key(|&b| Reverse(self.project.binaries.get(b).node));
        dynamic_group.sort_by_key(|&b| Reverse(self.project.binaries.get(b).node));
        syslibs.sort_by_key(|&s| Reverse(s));
        let mut libs = Vec::new();
        for &lib in &static_group {
            let file = self.project.binaries.get(lib).file;
            libs.push(self.project.graph.file(file).path.clone());
        }
        for &lib in &dynamic_group {
            let file = self.project.binaries.get(lib).file;
            libs.push(self.project.graph.file(file).path.clone());
        }
        for &sl in &syslibs {
            libs.push(format!("-l{}", self.project.binaries.syslibs.get(sl).name));
        }
        self.project.graph.action_mut(target_action).libs = libs;
        Ok(added)
    }

    fn add_link_depend(&mut self, action: ActionId, lib_file: FileId) -> anyhow::Result<bool> {
        if self.project.graph.action(action).depends.contains(&lib_file) {
            return Ok(false);
        }
        self.project.graph.add_dependency(action, lib_file)?;
        Ok(true)
    }
}

fn ensure_parent(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Recursively delete files not in `keep` and directories left empty.
/// Returns true when `dir` itself ends up empty.
fn remove_stale(dir: &Path, keep: &HashSet<&str>) -> anyhow::Result<bool> {
    let mut empty = true;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            if remove_stale(&path, keep)? {
                std::fs::remove_dir(&path)?;
            } else {
                empty = false;
            }
        } else {
            let rel = path.to_string_lossy();
            if keep.contains(rel.as_ref()) {
                empty = false;
            } else {
                std::fs::remove_file(&path)?;
            }
        }
    }
    Ok(empty)
}

//! Reads the project: walks Bubfiles from the root package through `contain`
//! statements, materialising nodes, files, binaries and actions, and binding
//! every logical entity to its on-disk path.
//!
//! The planner runs with the build directory as its working directory, so
//! every path here is build-dir-relative: sources under `src/`, intermediates
//! under `obj/`, private outputs under `priv/`, distributables under `dist/`.

use crate::binary::{self, Binaries, Binary, BinaryId, BinaryKind, ExeKind};
use crate::bubfile::{Parser, Statement};
use crate::depcache::DependencyCache;
use crate::graph::{ActionId, ActionKind, FileId, Graph, NEWEST_UNKNOWN};
use crate::node::{NodeId, NodeKind, Privacy, Tree};
use crate::options::Options;
use anyhow::{anyhow, bail};
use std::collections::HashMap;

/// Everything the planner knows, built once at startup and then owned by the
/// scheduling loop.
pub struct Project {
    pub options: Options,
    pub tree: Tree,
    pub graph: Graph,
    pub binaries: Binaries,
    pub cache: DependencyCache,
    pub file_by_node: HashMap<NodeId, FileId>,
    pub binary_by_node: HashMap<NodeId, BinaryId>,
}

/// Read the whole project starting from the root Bubfile at `src/Bubfile`.
pub fn read(options: Options, cache: DependencyCache) -> anyhow::Result<Project> {
    let mut project = Project {
        options,
        tree: Tree::new(),
        graph: Graph::new(),
        binaries: Binaries::new(),
        cache,
        file_by_node: HashMap::new(),
        binary_by_node: HashMap::new(),
    };
    let root = project.tree.root;
    let bubfile = add_bubfile(&mut project, root)?;
    process_package(&mut project, root, bubfile)?;
    Ok(project)
}

fn add_bubfile(p: &mut Project, pkg: NodeId) -> anyhow::Result<FileId> {
    let node = p.tree.add(pkg, "Bubfile", Privacy::Public, NodeKind::File)?;
    let path = src_path(&p.tree.node(pkg).trail.clone(), "Bubfile");
    let id = p.graph.add_file(node, path, false)?;
    p.file_by_node.insert(node, id);
    Ok(id)
}

fn process_package(p: &mut Project, pkg: NodeId, bubfile: FileId) -> anyhow::Result<()> {
    let bubpath = p.graph.file(bubfile).path.clone();
    let mut buf = std::fs::read(&bubpath).map_err(|e| anyhow!("read {}: {}", bubpath, e))?;
    buf.push(0);
    let statements = {
        let mut parser = Parser::new(&buf, &p.options);
        let mut statements = Vec::new();
        loop {
            match parser.read() {
                Ok(None) => break,
                Ok(Some(stmt)) => statements.push(stmt),
                Err(err) => bail!("{}", err.in_file(std::path::Path::new(&bubpath))),
            }
        }
        statements
    };

    for stmt in statements {
        let origin = (bubpath.clone(), stmt.line);
        match stmt.rule.as_str() {
            "contain" => contain(p, pkg, &stmt, &origin)?,
            "static-lib" => static_lib(p, pkg, bubfile, &stmt, &origin, false)?,
            "public-lib" => static_lib(p, pkg, bubfile, &stmt, &origin, true)?,
            "dynamic-lib" => dynamic_lib(p, pkg, bubfile, &stmt, &origin)?,
            "dist-exe" => exe(p, pkg, bubfile, &stmt, &origin, ExeKind::Dist)?,
            "priv-exe" => exe(p, pkg, bubfile, &stmt, &origin, ExeKind::Priv)?,
            "test-exe" => exe(p, pkg, bubfile, &stmt, &origin, ExeKind::Test)?,
            "misc" => misc(p, pkg, bubfile, &stmt, &origin)?,
            "generate" => generate(p, pkg, bubfile, &stmt, &origin)?,
            rule => return Err(err_at(&origin, format!("unknown rule {:?}", rule))),
        }
    }
    Ok(())
}

fn err_at(origin: &(String, usize), msg: String) -> anyhow::Error {
    anyhow!("{}|{}| ERROR: {}", origin.0, origin.1, msg)
}

fn src_path(pkg_trail: &str, name: &str) -> String {
    if pkg_trail.is_empty() {
        format!("src/{}", name)
    } else {
        format!("src/{}/{}", pkg_trail, name)
    }
}

fn built_path(dir: &str, pkg_trail: &str, name: &str) -> String {
    if pkg_trail.is_empty() {
        format!("{}/{}", dir, name)
    } else {
        format!("{}/{}/{}", dir, pkg_trail, name)
    }
}

fn ext_of(name: &str) -> Option<&str> {
    name.rfind('.').map(|i| &name[i..])
}

fn stem_of(name: &str) -> &str {
    match name.rfind('.') {
        Some(i) => &name[..i],
        None => name,
    }
}

/// The file name of a static library for a node with the given package
/// trail and name: trail joined with dashes, collapsing a final component
/// repeated after its package (`p/lo` + `lo` stays `p-lo`).
fn lib_uniq_name(pkg_trail: &str, name: &str) -> String {
    if pkg_trail.is_empty() {
        name.to_string()
    } else if pkg_trail.rsplit('/').next() == Some(name) {
        pkg_trail.replace('/', "-")
    } else {
        format!("{}-{}", pkg_trail.replace('/', "-"), name)
    }
}

/// `contain targets [: privacy];`
fn contain(
    p: &mut Project,
    pkg: NodeId,
    stmt: &Statement,
    origin: &(String, usize),
) -> anyhow::Result<()> {
    let privacy = match stmt.arg(0) {
        [] => Privacy::Public,
        [word] => Privacy::parse(word)
            .ok_or_else(|| err_at(origin, format!("unknown privacy {:?}", word)))?,
        words => return Err(err_at(origin, format!("expected one privacy, got {:?}", words))),
    };
    if stmt.targets.is_empty() {
        return Err(err_at(origin, "contain needs at least one package".to_string()));
    }
    for name in &stmt.targets {
        let child = p
            .tree
            .add(pkg, name, privacy, NodeKind::Package)
            .map_err(|e| err_at(origin, e.to_string()))?;
        let bubfile = add_bubfile(p, child)?;
        process_package(p, child, bubfile)?;
    }
    Ok(())
}

/// Add a source file node to the package, or resolve a file an earlier
/// statement in this package already declared (e.g. a generated source).
fn source_file(
    p: &mut Project,
    pkg: NodeId,
    name: &str,
    privacy: Privacy,
    origin: &(String, usize),
) -> anyhow::Result<FileId> {
    let pkg_trail = p.tree.node(pkg).trail.clone();
    let trail = if pkg_trail.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", pkg_trail, name)
    };
    if let Some(node) = p.tree.by_trail(&trail) {
        return p
            .file_by_node
            .get(&node)
            .copied()
            .ok_or_else(|| err_at(origin, format!("{:?} is not a file", trail)));
    }
    let node = p
        .tree
        .add(pkg, name, privacy, NodeKind::File)
        .map_err(|e| err_at(origin, e.to_string()))?;
    let id = p
        .graph
        .add_file(node, src_path(&pkg_trail, name), false)
        .map_err(|e| err_at(origin, e.to_string()))?;
    p.file_by_node.insert(node, id);
    Ok(id)
}

/// Complete a freshly constructed action: it depends on its owning package's
/// Bubfile and on any in-project built file named textually in its command,
/// and its `newest` absorbs what the dependency cache remembers about it.
fn finish_action(
    p: &mut Project,
    action: ActionId,
    bubfile: FileId,
) -> anyhow::Result<()> {
    let mut extra = vec![bubfile];
    let command = p.graph.action(action).command.clone();
    for token in command.split_whitespace() {
        if token.contains("${") {
            continue;
        }
        if let Some(tool) = p.graph.lookup_path(token) {
            if p.graph.file(tool).built {
                extra.push(tool);
            }
        }
    }

    let output = p.graph.file(p.graph.action(action).builds[0]).path.clone();
    let mut newest = 0u64;
    match p.cache.get(&output) {
        // The cache is correct or absent: no entry means we know nothing
        // about what this action read last time, so it is maximally dirty.
        None => newest = NEWEST_UNKNOWN,
        Some(cached) => {
            for dep in cached.to_vec() {
                if dep.starts_with('/') {
                    // System file: fold its mtime into the dirtiness bound.
                    match crate::graph::stat_mtime(std::path::Path::new(&dep))? {
                        Some(mtime) => newest = newest.max(mtime),
                        None => newest = NEWEST_UNKNOWN,
                    }
                } else {
                    match p.graph.lookup_path(&dep) {
                        Some(fid) => extra.push(fid),
                        // The cache names a file we no longer know: the
                        // entry is stale, so assume maximally dirty.
                        None => newest = NEWEST_UNKNOWN,
                    }
                }
            }
        }
    }

    // Construction-time: extend depends directly, even on frozen
    // multi-output actions.
    let builds = p.graph.action(action).builds.clone();
    for dep in extra {
        if !p.graph.action(action).depends.contains(&dep) {
            p.graph.action_mut(action).depends.push(dep);
            for &out in &builds {
                let edges = &mut p.graph.file_mut(dep).depended_by;
                if !edges.contains(&out) {
                    edges.push(out);
                }
            }
        }
    }
    p.graph.action_mut(action).newest = p.graph.action(action).newest.max(newest);
    Ok(())
}

/// Compile one source if its extension owns a compile command; headers and
/// the like return None.  A source whose extension owns a *generate* command
/// is expanded first and its compilable outputs are compiled instead.
struct CompiledSource {
    objs: Vec<FileId>,
    extra_sources: Vec<FileId>,
}

fn compile_source(
    p: &mut Project,
    pkg: NodeId,
    src: FileId,
    bubfile: FileId,
    origin: &(String, usize),
    signature: &mut Option<String>,
    binary_name: &str,
) -> anyhow::Result<CompiledSource> {
    let src_path = p.graph.file(src).path.clone();
    let name = src_path.rsplit('/').next().unwrap().to_string();
    let ext = match ext_of(&name) {
        Some(e) => e.to_string(),
        None => {
            return Ok(CompiledSource {
                objs: Vec::new(),
                extra_sources: Vec::new(),
            })
        }
    };

    if let Some(gen) = p.options.generate.get(&ext).cloned() {
        // Extension-triggered generation: produce the side-suffix outputs,
        // then fold them back in as sources of this binary.
        let pkg_trail = p.tree.node(pkg).trail.clone();
        let mut outputs = Vec::new();
        for suffix in &gen.suffixes {
            let out_name = format!("{}{}", stem_of(&name), suffix);
            let node = p
                .tree
                .add(pkg, &out_name, Privacy::Public, NodeKind::File)
                .map_err(|e| err_at(origin, e.to_string()))?;
            let fid = p
                .graph
                .add_file(node, built_path("obj", &pkg_trail, &out_name), true)
                .map_err(|e| err_at(origin, e.to_string()))?;
            p.file_by_node.insert(node, fid);
            outputs.push(fid);
        }
        let action = p
            .graph
            .add_action(
                p.graph.file(outputs[0]).path.clone(),
                origin.clone(),
                ActionKind::Generate,
                gen.command.clone(),
                vec![src],
                outputs.clone(),
            )
            .map_err(|e| err_at(origin, e.to_string()))?;
        finish_action(p, action, bubfile)?;

        let mut result = CompiledSource {
            objs: Vec::new(),
            extra_sources: Vec::new(),
        };
        for out in outputs {
            let compiled = compile_source(p, pkg, out, bubfile, origin, signature, binary_name)?;
            result.objs.extend(compiled.objs);
            result.extra_sources.push(out);
            result.extra_sources.extend(compiled.extra_sources);
        }
        return Ok(result);
    }

    let command = match p.options.compile.get(&ext) {
        Some(cmd) => cmd.clone(),
        None => {
            return Ok(CompiledSource {
                objs: Vec::new(),
                extra_sources: Vec::new(),
            })
        }
    };
    binary::merge_source_ext(signature, &ext, binary_name).map_err(|e| err_at(origin, e.to_string()))?;

    let pkg_trail = p.tree.node(pkg).trail.clone();
    let obj_name = format!("{}.o", stem_of(&name));
    let node = p
        .tree
        .add(pkg, &obj_name, Privacy::Public, NodeKind::File)
        .map_err(|e| err_at(origin, e.to_string()))?;
    let obj = p
        .graph
        .add_file(node, built_path("obj", &pkg_trail, &obj_name), true)
        .map_err(|e| err_at(origin, e.to_string()))?;
    p.file_by_node.insert(node, obj);
    let action = p
        .graph
        .add_action(
            p.graph.file(obj).path.clone(),
            origin.clone(),
            ActionKind::Compile,
            command,
            vec![src],
            vec![obj],
        )
        .map_err(|e| err_at(origin, e.to_string()))?;
    finish_action(p, action, bubfile)?;
    Ok(CompiledSource {
        objs: vec![obj],
        extra_sources: Vec::new(),
    })
}

fn link_command<'a>(
    table: &'a HashMap<String, String>,
    signature: &Option<String>,
    what: &str,
    origin: &(String, usize),
) -> anyhow::Result<&'a String> {
    let ext = signature.as_deref().unwrap_or(".c");
    table
        .get(ext)
        .ok_or_else(|| err_at(origin, format!("no {} command for {:?} sources", what, ext)))
}

/// `static-lib name : public-src : protected-src [: sys-libs];`
/// `public-lib` is identical but distributable.
fn static_lib(
    p: &mut Project,
    pkg: NodeId,
    bubfile: FileId,
    stmt: &Statement,
    origin: &(String, usize),
    public: bool,
) -> anyhow::Result<()> {
    let name = single_target(stmt, origin)?;
    let mut sources = Vec::new();
    let mut public_sources = Vec::new();
    let mut objs = Vec::new();
    let mut signature = None;

    for (words, privacy) in [
        (stmt.arg(0), Privacy::Public),
        (stmt.arg(1), Privacy::Protected),
    ] {
        for src_name in words {
            let src = source_file(p, pkg, src_name, privacy, origin)?;
            sources.push(src);
            if privacy == Privacy::Public {
                public_sources.push(src);
            }
            let compiled = compile_source(p, pkg, src, bubfile, origin, &mut signature, &name)?;
            objs.extend(compiled.objs);
            if privacy == Privacy::Public {
                public_sources.extend(compiled.extra_sources.iter().copied());
            }
            sources.extend(compiled.extra_sources);
        }
    }
    if objs.is_empty() {
        return Err(err_at(origin, format!("static lib {:?} has no objects", name)));
    }

    let pkg_trail = p.tree.node(pkg).trail.clone();
    let lib_node = p
        .tree
        .add(pkg, &name, Privacy::Public, NodeKind::File)
        .map_err(|e| err_at(origin, e.to_string()))?;
    let file_name = format!("lib{}-s.a", lib_uniq_name(&pkg_trail, &name));
    let path = if public {
        format!("dist/lib/{}", file_name)
    } else {
        format!("obj/{}", file_name)
    };
    let lib_file = p
        .graph
        .add_file(lib_node, path, true)
        .map_err(|e| err_at(origin, e.to_string()))?;
    p.file_by_node.insert(lib_node, lib_file);

    let command = link_command(&p.options.slib, &signature, ".slib", origin)?.clone();
    let action = p
        .graph
        .add_action(
            p.graph.file(lib_file).path.clone(),
            origin.clone(),
            ActionKind::StaticLib,
            command,
            objs.clone(),
            vec![lib_file],
        )
        .map_err(|e| err_at(origin, e.to_string()))?;
    finish_action(p, action, bubfile)?;

    let syslibs = stmt.arg(2).iter().map(|n| p.binaries.syslib(n)).collect();
    let bid = p.binaries.add(Binary {
        node: lib_node,
        file: lib_file,
        kind: BinaryKind::StaticLib { public },
        sources: sources.clone(),
        objs: objs.clone(),
        syslibs,
        source_ext: signature,
        public_sources: public_sources.clone(),
        static_libs: Vec::new(),
    });
    for &fid in sources.iter().chain(objs.iter()).chain([lib_file].iter()) {
        let path = p.graph.file(fid).path.clone();
        p.binaries
            .claim(fid, &path, bid)
            .map_err(|e| err_at(origin, e.to_string()))?;
    }
    p.binary_by_node.insert(lib_node, bid);

    // A distributable lib exports its public sources under dist/include/.
    if public {
        for src in public_sources {
            export_copy(p, pkg, src, bubfile, origin)?;
        }
    }
    Ok(())
}

/// Copy a public source into dist/include/<pkg-trail>/.
fn export_copy(
    p: &mut Project,
    pkg: NodeId,
    src: FileId,
    bubfile: FileId,
    origin: &(String, usize),
) -> anyhow::Result<()> {
    let pkg_trail = p.tree.node(pkg).trail.clone();
    let src_node = p.graph.file(src).node;
    let name = p.tree.node(src_node).name.clone();
    let node = p
        .tree
        .add(src_node, &name, Privacy::Public, NodeKind::File)
        .map_err(|e| err_at(origin, e.to_string()))?;
    let out = p
        .graph
        .add_file(node, built_path("dist/include", &pkg_trail, &name), true)
        .map_err(|e| err_at(origin, e.to_string()))?;
    p.file_by_node.insert(node, out);
    let action = p
        .graph
        .add_action(
            p.graph.file(out).path.clone(),
            origin.clone(),
            ActionKind::Copy,
            "cp ${INPUT} ${OUTPUT}".to_string(),
            vec![src],
            vec![out],
        )
        .map_err(|e| err_at(origin, e.to_string()))?;
    finish_action(p, action, bubfile)
}

fn single_target(stmt: &Statement, origin: &(String, usize)) -> anyhow::Result<String> {
    match stmt.targets.as_slice() {
        [name] => Ok(name.clone()),
        other => Err(err_at(
            origin,
            format!("expected one target name, got {:?}", other),
        )),
    }
}

/// `dynamic-lib name : static-lib-trails [: dest-dir];`
fn dynamic_lib(
    p: &mut Project,
    pkg: NodeId,
    bubfile: FileId,
    stmt: &Statement,
    origin: &(String, usize),
) -> anyhow::Result<()> {
    let name = single_target(stmt, origin)?;
    if stmt.arg(0).is_empty() {
        return Err(err_at(origin, format!("dynamic lib {:?} contains no static libs", name)));
    }

    let pkg_trail = p.tree.node(pkg).trail.clone();
    let mut contents = Vec::new();
    for trail in stmt.arg(0) {
        let node = resolve_trail(p, &pkg_trail, trail)
            .ok_or_else(|| err_at(origin, format!("unknown static-lib trail {:?}", trail)))?;
        let bid = p
            .binary_by_node
            .get(&node)
            .copied()
            .filter(|&b| matches!(p.binaries.get(b).kind, BinaryKind::StaticLib { .. }))
            .ok_or_else(|| err_at(origin, format!("{:?} is not a static lib", trail)))?;
        contents.push((node, bid));
    }

    let lib_node = p
        .tree
        .add(pkg, &name, Privacy::Public, NodeKind::File)
        .map_err(|e| err_at(origin, e.to_string()))?;
    let dest = match stmt.arg(1) {
        [] => "dist/lib".to_string(),
        [dir] => format!("dist/{}", dir),
        other => return Err(err_at(origin, format!("expected one dest-dir, got {:?}", other))),
    };
    let path = format!("{}/lib{}.so", dest, name);
    let lib_file = p
        .graph
        .add_file(lib_node, path, true)
        .map_err(|e| err_at(origin, e.to_string()))?;
    p.file_by_node.insert(lib_node, lib_file);

    let mut objs = Vec::new();
    let mut signature = None;
    let mut static_libs = Vec::new();
    for (node, bid) in contents {
        p.tree
            .add_refer(lib_node, node)
            .map_err(|e| err_at(origin, e.to_string()))?;
        let contained = p.binaries.get(bid);
        let contained_ext = contained.source_ext.clone();
        objs.extend(contained.objs.iter().copied());
        static_libs.push(bid);
        if let Some(ext) = contained_ext {
            binary::merge_source_ext(&mut signature, &ext, &name)
                .map_err(|e| err_at(origin, e.to_string()))?;
        }
        let lib_name = p.tree.node(node).trail.clone();
        p.binaries
            .package_static(bid, p.binaries.map.next_id(), &lib_name)
            .map_err(|e| err_at(origin, e.to_string()))?;
    }

    let command = link_command(&p.options.dlib, &signature, ".dlib", origin)?.clone();
    let action = p
        .graph
        .add_action(
            p.graph.file(lib_file).path.clone(),
            origin.clone(),
            ActionKind::DynamicLib,
            command,
            objs.clone(),
            vec![lib_file],
        )
        .map_err(|e| err_at(origin, e.to_string()))?;
    finish_action(p, action, bubfile)?;

    let bid = p.binaries.add(Binary {
        node: lib_node,
        file: lib_file,
        kind: BinaryKind::DynamicLib,
        sources: Vec::new(),
        objs,
        syslibs: Vec::new(),
        source_ext: signature,
        public_sources: Vec::new(),
        static_libs,
    });
    let path = p.graph.file(lib_file).path.clone();
    p.binaries
        .claim(lib_file, &path, bid)
        .map_err(|e| err_at(origin, e.to_string()))?;
    p.binary_by_node.insert(lib_node, bid);
    Ok(())
}

/// Resolve a trail mentioned in a statement: relative to the declaring
/// package first, then from the root.
fn resolve_trail(p: &Project, pkg_trail: &str, trail: &str) -> Option<NodeId> {
    if !pkg_trail.is_empty() {
        if let Some(node) = p.tree.by_trail(&format!("{}/{}", pkg_trail, trail)) {
            return Some(node);
        }
    }
    p.tree.by_trail(trail)
}

/// `dist-exe|priv-exe|test-exe name : sources [: sys-libs] [: timeout and
/// runtime-deps];`
fn exe(
    p: &mut Project,
    pkg: NodeId,
    bubfile: FileId,
    stmt: &Statement,
    origin: &(String, usize),
    kind: ExeKind,
) -> anyhow::Result<()> {
    let name = single_target(stmt, origin)?;
    if kind != ExeKind::Test && !stmt.arg(2).is_empty() {
        return Err(err_at(origin, "timeout/runtime-deps apply only to test-exe".to_string()));
    }

    let mut sources = Vec::new();
    let mut objs = Vec::new();
    let mut signature = None;
    for src_name in stmt.arg(0) {
        let src = source_file(p, pkg, src_name, Privacy::Protected, origin)?;
        sources.push(src);
        let compiled = compile_source(p, pkg, src, bubfile, origin, &mut signature, &name)?;
        objs.extend(compiled.objs);
        sources.extend(compiled.extra_sources);
    }
    if objs.is_empty() {
        return Err(err_at(origin, format!("exe {:?} has no objects", name)));
    }

    let pkg_trail = p.tree.node(pkg).trail.clone();
    let exe_node = p
        .tree
        .add(pkg, &name, Privacy::Public, NodeKind::File)
        .map_err(|e| err_at(origin, e.to_string()))?;
    let path = match kind {
        ExeKind::Dist => format!("dist/bin/{}", name),
        ExeKind::Priv | ExeKind::Test => built_path("priv", &pkg_trail, &name),
    };
    let exe_file = p
        .graph
        .add_file(exe_node, path, true)
        .map_err(|e| err_at(origin, e.to_string()))?;
    p.file_by_node.insert(exe_node, exe_file);

    let command = link_command(&p.options.exe, &signature, ".exe", origin)?.clone();
    let action = p
        .graph
        .add_action(
            p.graph.file(exe_file).path.clone(),
            origin.clone(),
            ActionKind::Exe,
            command,
            objs.clone(),
            vec![exe_file],
        )
        .map_err(|e| err_at(origin, e.to_string()))?;
    finish_action(p, action, bubfile)?;

    let syslibs = stmt.arg(1).iter().map(|n| p.binaries.syslib(n)).collect();
    let bid = p.binaries.add(Binary {
        node: exe_node,
        file: exe_file,
        kind: BinaryKind::Exe(kind),
        sources: sources.clone(),
        objs: objs.clone(),
        syslibs,
        source_ext: signature,
        public_sources: Vec::new(),
        static_libs: Vec::new(),
    });
    for &fid in sources.iter().chain(objs.iter()).chain([exe_file].iter()) {
        let path = p.graph.file(fid).path.clone();
        p.binaries
            .claim(fid, &path, bid)
            .map_err(|e| err_at(origin, e.to_string()))?;
    }
    p.binary_by_node.insert(exe_node, bid);

    if kind == ExeKind::Test {
        test_result(p, pkg, bubfile, stmt, origin, exe_node, exe_file)?;
    }
    Ok(())
}

/// The test-result file produced by running a test-exe.  The third arg's
/// leading integer, if any, is a timeout in seconds; the remaining tokens
/// are runtime-dep trails.
fn test_result(
    p: &mut Project,
    pkg: NodeId,
    bubfile: FileId,
    stmt: &Statement,
    origin: &(String, usize),
    exe_node: NodeId,
    exe_file: FileId,
) -> anyhow::Result<()> {
    let mut extras = stmt.arg(2).iter();
    let mut timeout = None;
    let mut runtime_deps = Vec::new();
    for word in extras.by_ref() {
        if timeout.is_none() && runtime_deps.is_empty() {
            if let Ok(secs) = word.parse::<u64>() {
                timeout = Some(secs);
                continue;
            }
        }
        runtime_deps.push(word.clone());
    }

    let pkg_trail = p.tree.node(pkg).trail.clone();
    let name = format!("{}-passed", p.tree.node(exe_node).name);
    let node = p
        .tree
        .add(exe_node, &name, Privacy::Public, NodeKind::File)
        .map_err(|e| err_at(origin, e.to_string()))?;
    let result = p
        .graph
        .add_file(node, built_path("priv", &pkg_trail, &name), true)
        .map_err(|e| err_at(origin, e.to_string()))?;
    p.file_by_node.insert(node, result);

    let exe_path = p.graph.file(exe_file).path.clone();
    let result_path = p.graph.file(result).path.clone();
    let command = match timeout {
        Some(secs) => format!("timeout {} ./{} > {} 2>&1", secs, exe_path, result_path),
        None => format!("./{} > {} 2>&1", exe_path, result_path),
    };
    let action = p
        .graph
        .add_action(
            result_path,
            origin.clone(),
            ActionKind::Test,
            command,
            vec![exe_file],
            vec![result],
        )
        .map_err(|e| err_at(origin, e.to_string()))?;
    finish_action(p, action, bubfile)?;

    for trail in runtime_deps {
        let node = resolve_trail(p, &pkg_trail, &trail)
            .ok_or_else(|| err_at(origin, format!("unknown runtime-dep {:?}", trail)))?;
        let fid = p
            .file_by_node
            .get(&node)
            .copied()
            .ok_or_else(|| err_at(origin, format!("runtime-dep {:?} is not a file", trail)))?;
        p.graph
            .add_dependency(action, fid)
            .map_err(|e| err_at(origin, e.to_string()))?;
    }
    Ok(())
}

/// `misc targets [: dest-dir];` -- copy files into the built tree.
fn misc(
    p: &mut Project,
    pkg: NodeId,
    bubfile: FileId,
    stmt: &Statement,
    origin: &(String, usize),
) -> anyhow::Result<()> {
    let pkg_trail = p.tree.node(pkg).trail.clone();
    let dest = match stmt.arg(0) {
        [] => None,
        [dir] => Some(format!("dist/{}", dir)),
        other => return Err(err_at(origin, format!("expected one dest-dir, got {:?}", other))),
    };
    for name in &stmt.targets {
        let src = source_file(p, pkg, name, Privacy::Public, origin)?;
        let src_node = p.graph.file(src).node;
        let node = p
            .tree
            .add(src_node, name, Privacy::Public, NodeKind::File)
            .map_err(|e| err_at(origin, e.to_string()))?;
        let out_path = match &dest {
            Some(dir) => format!("{}/{}", dir, name),
            None => built_path("priv", &pkg_trail, name),
        };
        let out = p
            .graph
            .add_file(node, out_path, true)
            .map_err(|e| err_at(origin, e.to_string()))?;
        p.file_by_node.insert(node, out);
        let action = p
            .graph
            .add_action(
                p.graph.file(out).path.clone(),
                origin.clone(),
                ActionKind::Copy,
                "cp ${INPUT} ${OUTPUT}".to_string(),
                vec![src],
                vec![out],
            )
            .map_err(|e| err_at(origin, e.to_string()))?;
        finish_action(p, action, bubfile)?;
    }
    Ok(())
}

/// `generate targets : command : inputs [: dest-dir];` -- run an explicit
/// command (often a previously declared in-project tool) over inputs to
/// produce the targets.
fn generate(
    p: &mut Project,
    pkg: NodeId,
    bubfile: FileId,
    stmt: &Statement,
    origin: &(String, usize),
) -> anyhow::Result<()> {
    if stmt.targets.is_empty() {
        return Err(err_at(origin, "generate needs at least one target".to_string()));
    }
    if stmt.arg(0).is_empty() {
        return Err(err_at(origin, "generate needs a command".to_string()));
    }
    let pkg_trail = p.tree.node(pkg).trail.clone();

    let mut inputs = Vec::new();
    for name in stmt.arg(1) {
        inputs.push(source_file(p, pkg, name, Privacy::Public, origin)?);
    }

    let dest = match stmt.arg(2) {
        [] => None,
        [dir] => Some(format!("dist/{}", dir)),
        other => return Err(err_at(origin, format!("expected one dest-dir, got {:?}", other))),
    };
    let mut outputs = Vec::new();
    for name in &stmt.targets {
        let node = p
            .tree
            .add(pkg, name, Privacy::Public, NodeKind::File)
            .map_err(|e| err_at(origin, e.to_string()))?;
        let path = match &dest {
            Some(dir) => format!("{}/{}", dir, name),
            None => built_path("obj", &pkg_trail, name),
        };
        let out = p
            .graph
            .add_file(node, path, true)
            .map_err(|e| err_at(origin, e.to_string()))?;
        p.file_by_node.insert(node, out);
        outputs.push(out);
    }

    // Command tokens naming an in-project file resolve to its path.
    let mut command_words = Vec::new();
    for word in stmt.arg(0) {
        match resolve_trail(p, &pkg_trail, word).and_then(|n| p.file_by_node.get(&n)) {
            Some(&fid) => command_words.push(p.graph.file(fid).path.clone()),
            None => command_words.push(word.clone()),
        }
    }

    let action = p
        .graph
        .add_action(
            p.graph.file(outputs[0]).path.clone(),
            origin.clone(),
            ActionKind::Generate,
            command_words.join(" "),
            inputs,
            outputs,
        )
        .map_err(|e| err_at(origin, e.to_string()))?;
    finish_action(p, action, bubfile)
}

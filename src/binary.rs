//! Binaries: built files that aggregate source files and their compiled
//! objects.  Static libraries, dynamic libraries (which package a declared
//! set of static libraries) and executables in three flavours.

use crate::densemap::{declare_id, DenseMap};
use crate::graph::FileId;
use crate::node::NodeId;
use anyhow::bail;
use std::collections::HashMap;

declare_id!(BinaryId);
declare_id!(SysLibId);

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum ExeKind {
    Dist,
    Priv,
    Test,
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum BinaryKind {
    /// `public` static libs are distributable: the archive and its public
    /// sources are exported under dist/.
    StaticLib { public: bool },
    DynamicLib,
    Exe(ExeKind),
}

/// An external system library, named on link lines as `-l<name>`.
pub struct SysLib {
    pub name: String,
}

pub struct Binary {
    /// Node of the built file; its id is the declaration number used for
    /// link-line ordering.
    pub node: NodeId,
    pub file: FileId,
    pub kind: BinaryKind,
    pub sources: Vec<FileId>,
    pub objs: Vec<FileId>,
    pub syslibs: Vec<SysLibId>,
    /// Language-family signature: the one non-`.c` source extension.
    pub source_ext: Option<String>,
    pub public_sources: Vec<FileId>,
    /// For a DynamicLib, the static libs it packages.
    pub static_libs: Vec<BinaryId>,
}

#[derive(Default)]
pub struct Binaries {
    pub map: DenseMap<BinaryId, Binary>,
    /// Which Binary each file (source, object or the built file itself)
    /// belongs to; a file is consumed by at most one Binary.
    pub by_content: HashMap<FileId, BinaryId>,
    /// Which DynamicLib packages each StaticLib; at most one.
    pub dynamic_by_content: HashMap<BinaryId, BinaryId>,
    pub syslibs: DenseMap<SysLibId, SysLib>,
    syslib_by_name: HashMap<String, SysLibId>,
}

impl Binaries {
    pub fn new() -> Binaries {
        Binaries::default()
    }

    pub fn get(&self, id: BinaryId) -> &Binary {
        self.map.get(id)
    }

    pub fn get_mut(&mut self, id: BinaryId) -> &mut Binary {
        self.map.get_mut(id)
    }

    pub fn add(&mut self, binary: Binary) -> BinaryId {
        self.map.push(binary)
    }

    /// Record that a file's contents belong to a Binary; each file may be
    /// consumed once.
    pub fn claim(&mut self, file: FileId, path: &str, binary: BinaryId) -> anyhow::Result<()> {
        if let Some(&owner) = self.by_content.get(&file) {
            if owner != binary {
                bail!("file {:?} already used by another binary", path);
            }
            return Ok(());
        }
        self.by_content.insert(file, binary);
        Ok(())
    }

    pub fn container(&self, file: FileId) -> Option<BinaryId> {
        self.by_content.get(&file).copied()
    }

    /// Record that a DynamicLib packages a StaticLib; two DynamicLibs may
    /// not share one.
    pub fn package_static(
        &mut self,
        static_lib: BinaryId,
        dynamic_lib: BinaryId,
        name: &str,
    ) -> anyhow::Result<()> {
        if self.dynamic_by_content.insert(static_lib, dynamic_lib).is_some() {
            bail!("static lib {:?} is packaged by two dynamic libs", name);
        }
        Ok(())
    }

    pub fn dynamic_for(&self, static_lib: BinaryId) -> Option<BinaryId> {
        self.dynamic_by_content.get(&static_lib).copied()
    }

    pub fn syslib(&mut self, name: &str) -> SysLibId {
        match self.syslib_by_name.get(name) {
            Some(&id) => id,
            None => {
                let id = self.syslibs.push(SysLib {
                    name: name.to_string(),
                });
                self.syslib_by_name.insert(name.to_string(), id);
                id
            }
        }
    }
}

/// Fold a source extension into a Binary's family signature.  Pure C mixes
/// with any family; anything else must agree with what the Binary already
/// compiles.
pub fn merge_source_ext(
    signature: &mut Option<String>,
    ext: &str,
    name: &str,
) -> anyhow::Result<()> {
    if ext == ".c" {
        return Ok(());
    }
    match signature {
        None => {
            *signature = Some(ext.to_string());
            Ok(())
        }
        Some(have) if have == ext => Ok(()),
        Some(have) => bail!(
            "binary {:?} mixes source extensions {:?} and {:?}",
            name,
            have,
            ext
        ),
    }
}

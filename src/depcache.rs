//! The dependency cache persists, across runs, the list of files each built
//! output actually depended on.  It is read (and unlinked) once at startup
//! and rewritten atomically on successful exit, so it is always either
//! correct or absent -- a crashed run can never leave a lying cache behind.
//!
//! On-disk format: one line per entry; the first whitespace-delimited token
//! is the output path, the rest are dependency paths (absolute system paths
//! or build-dir-relative project paths).

use anyhow::anyhow;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

pub struct DependencyCache {
    path: PathBuf,
    entries: HashMap<String, Vec<String>>,
}

impl DependencyCache {
    /// Read the cache file and remove it.  A missing file is an empty cache.
    pub fn open(path: &Path) -> anyhow::Result<DependencyCache> {
        let mut entries = HashMap::new();
        match std::fs::read_to_string(path) {
            Ok(text) => {
                for line in text.lines() {
                    let mut tokens = line.split_whitespace();
                    let output = match tokens.next() {
                        Some(o) => o.to_string(),
                        None => continue,
                    };
                    entries.insert(output, tokens.map(str::to_string).collect());
                }
                std::fs::remove_file(path)
                    .map_err(|e| anyhow!("unlink {}: {}", path.display(), e))?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(anyhow!("read {}: {}", path.display(), e)),
        }
        Ok(DependencyCache {
            path: path.to_path_buf(),
            entries,
        })
    }

    pub fn get(&self, output: &str) -> Option<&[String]> {
        self.entries.get(output).map(|deps| deps.as_slice())
    }

    /// Replace the entry for an output with freshly discovered deps.
    pub fn set(&mut self, output: &str, deps: Vec<String>) {
        self.entries.insert(output.to_string(), deps);
    }

    /// Write the cache back via a temporary file and rename, so readers only
    /// ever observe a complete file.
    pub fn flush(&self) -> anyhow::Result<()> {
        let tmp = self.path.with_extension("tmp");
        {
            let mut w = std::io::BufWriter::new(
                std::fs::File::create(&tmp)
                    .map_err(|e| anyhow!("create {}: {}", tmp.display(), e))?,
            );
            let mut outputs: Vec<&String> = self.entries.keys().collect();
            outputs.sort();
            for output in outputs {
                write!(w, "{}", output)?;
                for dep in &self.entries[output] {
                    write!(w, " {}", dep)?;
                }
                writeln!(w)?;
            }
            w.flush()?;
        }
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| anyhow!("rename {}: {}", self.path.display(), e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DependencyCache::open(&dir.path().join("dependency-cache")).unwrap();
        assert!(cache.get("obj/a.o").is_none());
    }

    #[test]
    fn read_unlinks_and_flush_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dependency-cache");
        std::fs::write(&path, "obj/a.o src/a.c src/a.h\nobj/b.o src/b.c\n").unwrap();

        let cache = DependencyCache::open(&path).unwrap();
        // The file is gone until a successful flush rewrites it.
        assert!(!path.exists());
        assert_eq!(cache.get("obj/a.o").unwrap(), ["src/a.c", "src/a.h"]);
        assert_eq!(cache.get("obj/b.o").unwrap(), ["src/b.c"]);

        cache.flush().unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let mut lines: Vec<&str> = text.lines().collect();
        lines.sort();
        assert_eq!(lines, ["obj/a.o src/a.c src/a.h", "obj/b.o src/b.c"]);
    }

    #[test]
    fn set_replaces_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dependency-cache");
        std::fs::write(&path, "obj/a.o src/old.h\n").unwrap();
        let mut cache = DependencyCache::open(&path).unwrap();
        cache.set("obj/a.o", vec!["src/new.h".to_string()]);
        assert_eq!(cache.get("obj/a.o").unwrap(), ["src/new.h"]);
    }
}

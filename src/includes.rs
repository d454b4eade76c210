//! Extraction of in-project dependencies from source text: `#include "..."`
//! for the C family, `import a.b;` for the D family.  Angle-bracket includes
//! and imports rooted at a configured-external package are not in-project
//! and are skipped.

/// The scanning treatment a file's extension calls for.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum SourceKind {
    CFamily,
    DFamily,
}

pub fn source_kind(path: &str) -> Option<SourceKind> {
    let ext = path.rsplit_once('.').map(|(_, e)| e)?;
    match ext {
        "c" | "h" | "cc" | "hh" | "cpp" | "hpp" | "cxx" | "hxx" | "ipp" => {
            Some(SourceKind::CFamily)
        }
        "d" | "di" => Some(SourceKind::DFamily),
        _ => None,
    }
}

/// Scan source text for in-project dependency paths, relative to the src
/// root.  `externals` names import roots (e.g. `std`, `core`) to skip.
pub fn scan(text: &str, kind: SourceKind, externals: &[String]) -> Vec<String> {
    let mut deps = Vec::new();
    for line in text.lines() {
        match kind {
            SourceKind::CFamily => scan_c_line(line, &mut deps),
            SourceKind::DFamily => scan_d_line(line, &mut deps),
        }
    }
    deps.retain(|dep| {
        let root = dep.split('/').next().unwrap_or("");
        !externals.iter().any(|e| e == root)
    });
    deps
}

fn scan_c_line(line: &str, deps: &mut Vec<String>) {
    let line = line.trim_start();
    let rest = match line.strip_prefix('#') {
        Some(rest) => rest.trim_start(),
        None => return,
    };
    let rest = match rest.strip_prefix("include") {
        Some(rest) => rest.trim_start(),
        None => return,
    };
    // Only quoted includes are in-project; <...> is a system include.
    if let Some(rest) = rest.strip_prefix('"') {
        if let Some(end) = rest.find('"') {
            deps.push(rest[..end].to_string());
        }
    }
}

fn scan_d_line(line: &str, deps: &mut Vec<String>) {
    let mut rest = line.trim_start();
    for qualifier in ["public", "static", "private"] {
        if let Some(r) = rest.strip_prefix(qualifier) {
            rest = r.trim_start();
        }
    }
    let rest = match rest.strip_prefix("import") {
        Some(r) if r.starts_with(|c: char| c.is_whitespace()) => r,
        _ => return,
    };
    let stmt = match rest.find(';') {
        Some(end) => &rest[..end],
        None => rest,
    };
    // A selective import (`import a.b : x, y`) names one module; cut the
    // selector list before splitting on commas.
    let stmt = match stmt.split_once(':') {
        Some((m, _)) => m,
        None => stmt,
    };
    for module in stmt.split(',') {
        let module = module.trim();
        if module.is_empty() {
            continue;
        }
        deps.push(format!("{}.d", module.replace('.', "/")));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds() {
        assert_eq!(source_kind("a/b.cpp"), Some(SourceKind::CFamily));
        assert_eq!(source_kind("a/b.h"), Some(SourceKind::CFamily));
        assert_eq!(source_kind("a/b.d"), Some(SourceKind::DFamily));
        assert_eq!(source_kind("a/b.o"), None);
        assert_eq!(source_kind("Bubfile"), None);
    }

    #[test]
    fn c_includes() {
        let text = "\
#include \"p/lo/lo.h\"
  #  include \"p/hi/hi.h\"
#include <vector>
// #include \"commented/out.h\"
int x;
";
        let deps = scan(text, SourceKind::CFamily, &[]);
        assert_eq!(deps[0], "p/lo/lo.h");
        assert_eq!(deps[1], "p/hi/hi.h");
        assert_eq!(deps.len(), 2);
    }

    #[test]
    fn d_imports() {
        let text = "\
module p.hi.main;
import p.lo.util;
public import p.lo.base, p.lo.extra;
import std.stdio;
";
        let deps = scan(text, SourceKind::DFamily, &["std".to_string()]);
        assert_eq!(deps, ["p/lo/util.d", "p/lo/base.d", "p/lo/extra.d"]);
    }

    #[test]
    fn d_selective_import() {
        let deps = scan("import p.lo.util : clamp, wrap;\n", SourceKind::DFamily, &[]);
        assert_eq!(deps, ["p/lo/util.d"]);
    }
}

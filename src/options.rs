//! Loader for the `Buboptions` file that the build-directory bootstrap tool
//! writes: a line-oriented `key = value` store.  Keys beginning with `.` are
//! build commands, classified by their extension signature into compile,
//! generate and link tables; all other keys are variables available to
//! `${NAME}` expansion in commands and Bubfiles.

use anyhow::bail;
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// Output extensions with fixed meaning in a build-command key.
const RESERVED_EXTS: [&str; 4] = [".obj", ".slib", ".dlib", ".exe"];

/// A generate command: transforms one input file into one output file per
/// suffix, e.g. `.idl .h .cpp = ...` produces `x.h` and `x.cpp` from `x.idl`.
#[derive(Debug, Clone)]
pub struct Generate {
    pub suffixes: Vec<String>,
    pub command: String,
}

#[derive(Default, Debug)]
pub struct Options {
    /// Variable name => whitespace-split values.
    vars: HashMap<String, Vec<String>>,
    /// Input extension => compile command producing an object file.
    pub compile: HashMap<String, String>,
    /// Input extension => generate command.
    pub generate: HashMap<String, Generate>,
    /// Input (object) extension => static-lib link command.
    pub slib: HashMap<String, String>,
    /// Input (object) extension => dynamic-lib link command.
    pub dlib: HashMap<String, String>,
    /// Input (object) extension => executable link command.
    pub exe: HashMap<String, String>,
}

impl Options {
    pub fn values(&self, name: &str) -> &[String] {
        match self.vars.get(name) {
            Some(vals) => vals,
            None => &[],
        }
    }

    /// The `[tag]` gates enabled for Bubfile conditional regions.
    pub fn conditionals(&self) -> HashSet<&str> {
        self.values("CONDITIONALS")
            .iter()
            .map(|s| s.as_str())
            .collect()
    }
}

pub fn parse(path: &Path, text: &str) -> anyhow::Result<Options> {
    let mut options = Options::default();
    for (lineno, line) in text.lines().enumerate() {
        let lineno = lineno + 1;
        let err = |msg: String| -> anyhow::Error {
            anyhow::anyhow!("{}|{}| ERROR: {}", path.display(), lineno, msg)
        };
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let (key, value) = match line.split_once(" = ") {
            Some((k, v)) => (k.trim(), v),
            None => return Err(err(format!("expected 'key = value', got {:?}", trimmed))),
        };
        if key.starts_with('.') {
            add_build_command(&mut options, key, value).map_err(|e| err(e.to_string()))?;
        } else {
            if options.vars.contains_key(key) {
                return Err(err(format!("duplicate variable {:?}", key)));
            }
            let values = value.split_whitespace().map(str::to_string).collect();
            options.vars.insert(key.to_string(), values);
        }
    }
    Ok(options)
}

pub fn load(path: &Path) -> anyhow::Result<Options> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("read {}: {}", path.display(), e))?;
    parse(path, &text)
}

/// Classify a `.in .out...` key per its output-extension shape.
fn add_build_command(options: &mut Options, key: &str, command: &str) -> anyhow::Result<()> {
    let exts: Vec<&str> = key.split_whitespace().collect();
    if exts.len() < 2 || exts.iter().any(|e| !e.starts_with('.') || e.len() < 2) {
        bail!("build-command key {:?} must list an input and output extension", key);
    }
    let input = exts[0].to_string();
    let outputs = &exts[1..];

    fn link_table<'a>(options: &'a mut Options, kind: &str) -> Option<&'a mut HashMap<String, String>> {
        match kind {
            ".slib" => Some(&mut options.slib),
            ".dlib" => Some(&mut options.dlib),
            ".exe" => Some(&mut options.exe),
            _ => None,
        }
    }

    if outputs.len() == 1 {
        if let Some(table) = link_table(options, outputs[0]) {
            if table.insert(input.clone(), command.to_string()).is_some() {
                bail!("duplicate {} command for input {:?}", outputs[0], input);
            }
            return Ok(());
        }
        if outputs[0] == ".obj" {
            if options.generate.contains_key(&input)
                || options
                    .compile
                    .insert(input.clone(), command.to_string())
                    .is_some()
            {
                bail!("input extension {:?} already owns a command", input);
            }
            return Ok(());
        }
    }

    // Anything else is a generate command; reserved extensions may not
    // appear among its outputs.
    for out in outputs {
        if RESERVED_EXTS.contains(out) {
            bail!("reserved extension {:?} misused in key {:?}", out, key);
        }
    }
    if options.compile.contains_key(&input)
        || options
            .generate
            .insert(
                input.clone(),
                Generate {
                    suffixes: outputs.iter().map(|s| s.to_string()).collect(),
                    command: command.to_string(),
                },
            )
            .is_some()
    {
        bail!("input extension {:?} already owns a command", input);
    }
    Ok(())
}

/// The per-invocation values for the built-in command variables.
#[derive(Default)]
pub struct Builtins<'a> {
    pub input: &'a [String],
    pub output: &'a [String],
    pub deps: Option<&'a str>,
    pub libs: &'a [String],
}

impl<'a> Builtins<'a> {
    fn lookup(&self, name: &str) -> Option<Vec<&str>> {
        match name {
            "INPUT" => Some(self.input.iter().map(|s| s.as_str()).collect()),
            "OUTPUT" => Some(self.output.iter().map(|s| s.as_str()).collect()),
            "DEPS" => Some(self.deps.iter().copied().collect()),
            "LIBS" => Some(self.libs.iter().map(|s| s.as_str()).collect()),
            _ => None,
        }
    }
}

impl Options {
    /// Expand a command template into the string handed to a worker.
    /// Each whitespace token is split at `${NAME}` fences; the fence expands
    /// to one `prefix value suffix` word per value, and a name with no
    /// values erases the whole token.
    pub fn resolve_command(&self, template: &str, builtins: &Builtins) -> String {
        let mut words = Vec::new();
        for token in template.split_whitespace() {
            expand_token(self, builtins, token, &mut words);
        }
        words.join(" ")
    }
}

fn expand_token(options: &Options, builtins: &Builtins, token: &str, out: &mut Vec<String>) {
    let (start, end) = match token.find("${").and_then(|s| {
        token[s..].find('}').map(|e| (s, s + e))
    }) {
        Some(fence) => fence,
        None => {
            out.push(token.to_string());
            return;
        }
    };
    let prefix = &token[..start];
    let name = &token[start + 2..end];
    let suffix = &token[end + 1..];

    let values: Vec<&str> = match builtins.lookup(name) {
        Some(vals) => vals,
        None => options.values(name).iter().map(|s| s.as_str()).collect(),
    };
    for value in values {
        // The suffix may carry further fences; expand recursively.
        expand_token(options, builtins, &format!("{}{}{}", prefix, value, suffix), out);
    }
}

//! Parsing of the per-action deps file (`DEPENDENCIES-<n>`) that a command
//! writes to report the files it actually read: whitespace-separated paths
//! with optional backslash-newline continuations.  Some toolchains emit
//! Makefile-like or rule-syntax variants; when parentheses appear anywhere,
//! only the text inside parentheses is the payload.

/// Parse deps-file content into a list of dependency paths.
pub fn parse(text: &str) -> Vec<String> {
    let payload: String = if text.contains('(') {
        let mut inner = String::new();
        let mut in_parens = false;
        for c in text.chars() {
            match c {
                '(' => {
                    in_parens = true;
                    inner.push(' ');
                }
                ')' => in_parens = false,
                _ if in_parens => inner.push(c),
                _ => {}
            }
        }
        inner
    } else {
        text.to_string()
    };

    payload
        .split_whitespace()
        .filter(|tok| *tok != "\\")
        .map(|tok| tok.strip_suffix('\\').unwrap_or(tok))
        // A Makefile-style `target:` token names the output, not a dep.
        .filter(|tok| !tok.ends_with(':'))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_list() {
        assert_eq!(
            parse("src/a.cpp src/a.h\nsrc/b.h\n"),
            ["src/a.cpp", "src/a.h", "src/b.h"]
        );
    }

    #[test]
    fn backslash_continuations() {
        assert_eq!(
            parse("src/a.cpp \\\n  src/a.h \\\n  src/b.h"),
            ["src/a.cpp", "src/a.h", "src/b.h"]
        );
    }

    #[test]
    fn makefile_target_dropped() {
        assert_eq!(
            parse("obj/p/a.o: src/p/a.cpp src/p/a.h"),
            ["src/p/a.cpp", "src/p/a.h"]
        );
    }

    #[test]
    fn parenthesised_payload() {
        // Rule-syntax variant: only parenthesised text counts.
        assert_eq!(
            parse("import p.lo (src/p/lo/util.d) : ignored\nimport x (src/x.d)"),
            ["src/p/lo/util.d", "src/x.d"]
        );
    }

    #[test]
    fn empty() {
        assert!(parse("").is_empty());
        assert!(parse("\n  \n").is_empty());
    }
}

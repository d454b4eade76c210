//! Parser for Bubfiles, the declarative per-package build description.
//!
//! Statements have the shape `rule targets : arg1 : arg2 : arg3 ;` with
//! whitespace-delimited tokens, `#` comments to end of line, and `[tag](...)`
//! regions whose contents are kept only when the tag is an enabled
//! conditional.  `${NAME}` tokens are expanded from the options' variables as
//! they are read, each value becoming a separate token.

use crate::options::Options;
use crate::scanner::{ParseResult, Scanner};
use std::collections::HashSet;

/// One parsed statement.  `targets` is the first field after the rule word;
/// `args` holds the up-to-three `:`-separated fields that follow.
#[derive(Debug, PartialEq)]
pub struct Statement {
    pub rule: String,
    pub targets: Vec<String>,
    pub args: [Vec<String>; 3],
    pub line: usize,
}

impl Statement {
    pub fn arg(&self, n: usize) -> &[String] {
        &self.args[n]
    }
}

pub struct Parser<'a> {
    scanner: Scanner<'a>,
    options: &'a Options,
    conditionals: HashSet<&'a str>,
    /// True while inside an enabled `[tag]( ... )` region.
    in_region: bool,
}

impl<'a> Parser<'a> {
    pub fn new(buf: &'a [u8], options: &'a Options) -> Parser<'a> {
        Parser {
            scanner: Scanner::new(buf),
            options,
            conditionals: options.conditionals(),
            in_region: false,
        }
    }

    /// Read the next statement, or None at end of input.
    pub fn read(&mut self) -> ParseResult<Option<Statement>> {
        let mut fields: Vec<Vec<String>> = vec![Vec::new()];
        let mut line = 0;
        loop {
            let token = match self.read_token()? {
                None => {
                    if fields.len() == 1 && fields[0].is_empty() {
                        return Ok(None);
                    }
                    return self.scanner.parse_error("missing ';' at end of statement");
                }
                Some(t) => t,
            };
            match token.as_str() {
                ";" => {
                    if fields[0].is_empty() {
                        return self.scanner.parse_error("empty statement");
                    }
                    break;
                }
                ":" => {
                    if fields.len() == 4 {
                        return self.scanner.parse_error("too many fields in statement");
                    }
                    fields.push(Vec::new());
                }
                _ => {
                    if fields[0].is_empty() {
                        line = self.scanner.line;
                    }
                    self.expand(token, fields.last_mut().unwrap());
                }
            }
        }

        let mut fields = fields.into_iter();
        let mut first = fields.next().unwrap();
        let rule = first.remove(0);
        let mut args: [Vec<String>; 3] = Default::default();
        for (i, field) in fields.enumerate() {
            args[i] = field;
        }
        Ok(Some(Statement {
            rule,
            targets: first,
            args,
            line,
        }))
    }

    /// Splice a token's `${NAME}` references, one output token per value.
    fn expand(&self, token: String, out: &mut Vec<String>) {
        let fence = token.find("${").and_then(|s| {
            token[s..].find('}').map(|e| (s, s + e))
        });
        let (start, end) = match fence {
            Some(f) => f,
            None => {
                out.push(token);
                return;
            }
        };
        let name = &token[start + 2..end];
        // Command builtins resolve when an action is dispatched, not here.
        if matches!(name, "INPUT" | "OUTPUT" | "DEPS" | "LIBS") {
            out.push(token);
            return;
        }
        for value in self.options.values(name) {
            let spliced = format!("{}{}{}", &token[..start], value, &token[end + 1..]);
            self.expand(spliced, out);
        }
    }

    /// Read one raw token: a word, ":" or ";".  Handles comments and
    /// conditional regions.  None at end of input.
    fn read_token(&mut self) -> ParseResult<Option<String>> {
        loop {
            self.scanner.skip_whitespace();
            match self.scanner.peek() {
                '\0' => {
                    if self.in_region {
                        return self.scanner.parse_error("unterminated conditional region");
                    }
                    return Ok(None);
                }
                '#' => {
                    while !matches!(self.scanner.peek(), '\n' | '\0') {
                        self.scanner.next();
                    }
                }
                '[' => self.read_region_open()?,
                ')' => {
                    if !self.in_region {
                        return self.scanner.parse_error("')' outside conditional region");
                    }
                    self.in_region = false;
                    self.scanner.next();
                }
                ':' | ';' => {
                    let c = self.scanner.read();
                    return Ok(Some(c.to_string()));
                }
                _ => return Ok(Some(self.read_word()?)),
            }
        }
    }

    fn read_word(&mut self) -> ParseResult<String> {
        let start = self.scanner.ofs;
        loop {
            match self.scanner.peek() {
                ' ' | '\t' | '\r' | '\n' | '\0' | ':' | ';' | '#' | ')' => break,
                '[' => return self.scanner.parse_error("'[' inside token"),
                _ => self.scanner.next(),
            }
        }
        Ok(self.scanner.slice(start, self.scanner.ofs).to_string())
    }

    /// At '[': read the tag, the '(' that follows, and either enter the
    /// region or skip to its ')'.  Regions do not nest.
    fn read_region_open(&mut self) -> ParseResult<()> {
        if self.in_region {
            return self.scanner.parse_error("conditional regions do not nest");
        }
        self.scanner.expect('[')?;
        let start = self.scanner.ofs;
        while !matches!(self.scanner.peek(), ']' | '\n' | '\0') {
            self.scanner.next();
        }
        let tag = self.scanner.slice(start, self.scanner.ofs).to_string();
        self.scanner.expect(']')?;
        self.scanner.skip_whitespace();
        self.scanner.expect('(')?;
        if self.conditionals.contains(tag.as_str()) {
            self.in_region = true;
            return Ok(());
        }
        // Disabled: discard everything up to the closing paren.
        loop {
            match self.scanner.read() {
                ')' => return Ok(()),
                '[' => return self.scanner.parse_error("conditional regions do not nest"),
                '\0' => return self.scanner.parse_error("unterminated conditional region"),
                _ => {}
            }
        }
    }
}

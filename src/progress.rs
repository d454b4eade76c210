//! Console reporting: one line per started action, failure details with the
//! re-printed command and captured output, and the final summary.

use std::io::Write;

#[derive(Default)]
pub struct ConsoleProgress {
    /// Whether to print resolved command lines of started actions.
    verbose: bool,
}

impl ConsoleProgress {
    pub fn new(verbose: bool) -> Self {
        ConsoleProgress { verbose }
    }

    pub fn task_started(&self, name: &str, command: &str) {
        if self.verbose {
            println!("{}", command);
        } else {
            println!("{}", name);
        }
    }

    pub fn task_failed(&self, name: &str, command: &str, output: &[u8]) {
        println!("failed: {}", name);
        println!("{}", command);
        if !output.is_empty() {
            let _ = std::io::stdout().write_all(output);
            if !output.ends_with(b"\n") {
                println!();
            }
        }
    }

    pub fn interrupted(&self, name: &str) {
        println!("interrupted: {}", name);
    }

    pub fn log(&self, msg: &str) {
        println!("{}", msg);
    }

    pub fn summary(&self, seen: usize, built: usize, updated: usize) {
        if updated == 0 {
            println!("bub: no work to do ({} files seen, {} built)", seen, built);
        } else {
            println!(
                "bub: updated {} of {} built files ({} files seen)",
                updated, built, seen
            );
        }
    }

    pub fn failure_summary(&self, outstanding: usize) {
        println!("bub: build failed, {} files outstanding", outstanding);
    }
}

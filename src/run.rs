//! Command-line entry: parse flags, load the project, run the scheduler,
//! map the outcome to exit codes (0 success, 1 build failure, 2 bad usage).

use crate::{depcache, load, options, progress, signal, task, work};
use anyhow::anyhow;
use argh::FromArgs;
use std::path::Path;

#[derive(argh::FromArgs)]
/// bub, a bottom-up build system
struct Opts {
    /// build directory to run in [default=.]
    #[argh(option, short = 'C')]
    chdir: Option<String>,

    /// worker-pool size [default uses system thread count]
    #[argh(option, short = 'j')]
    jobs: Option<usize>,

    /// print resolved command lines
    #[argh(switch, short = 'v')]
    verbose: bool,
}

fn default_parallelism() -> anyhow::Result<usize> {
    let par = std::thread::available_parallelism()?;
    Ok(usize::from(par))
}

fn build(opts: &Opts) -> anyhow::Result<bool> {
    if let Some(dir) = &opts.chdir {
        std::env::set_current_dir(dir).map_err(|e| anyhow!("chdir {:?}: {}", dir, e))?;
    }
    let options = options::load(Path::new("Buboptions"))?;
    let cache = depcache::DependencyCache::open(Path::new("dependency-cache"))?;
    let project = load::read(options, cache)?;

    let progress = progress::ConsoleProgress::new(opts.verbose);
    let mut work = work::Work::new(project, &progress)?;
    work.cleanup_stale()?;

    signal::register();
    let jobs = match opts.jobs {
        Some(jobs) => jobs,
        None => default_parallelism()?,
    };
    let mut pool = task::Pool::new(jobs)?;
    let ok = work.run(&mut pool)?;

    // Flush on any orderly shutdown, so work that did complete is never
    // re-done; only a crash loses the cache.
    work.project.cache.flush()?;

    let (seen, built, updated) = work.counts();
    if ok {
        progress.summary(seen, built, updated);
    } else {
        progress.failure_summary(work.outstanding_count());
    }
    Ok(ok)
}

pub fn run() -> i32 {
    let args: Vec<String> = std::env::args().collect();
    let strs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
    let opts = match Opts::from_args(&strs[..1], &strs[1..]) {
        Ok(opts) => opts,
        Err(exit) => {
            print!("{}", exit.output);
            return match exit.status {
                Ok(()) => 0,
                Err(()) => 2,
            };
        }
    };
    match build(&opts) {
        Ok(true) => 0,
        Ok(false) => 1,
        Err(err) => {
            eprintln!("{}", err);
            1
        }
    }
}

pub mod binary;
pub mod bubfile;
pub mod depcache;
pub mod densemap;
pub mod depsfile;
pub mod graph;
pub mod includes;
pub mod load;
pub mod node;
pub mod options;
pub mod progress;
pub mod run;
pub mod scanner;
pub mod signal;
pub mod task;
pub mod work;

#[cfg(not(windows))]
use jemallocator::Jemalloc;

#[cfg(not(windows))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

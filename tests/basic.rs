//! Integration tests.  Runs the bub binary against a temp build directory
//! with shell-tool stand-ins for compilers: "compiling" is cat-ing the
//! source into the object, and each source may carry a `<name>.deps` file
//! listing what the fake compiler should report into `${DEPS}`.

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

fn bub_binary() -> PathBuf {
    std::env::current_exe()
        .expect("test binary path")
        .parent()
        .expect("test binary directory")
        .parent()
        .expect("binary directory")
        .join("bub")
        .to_path_buf()
}

fn bub_command(args: Vec<&str>) -> std::process::Command {
    let mut cmd = std::process::Command::new(bub_binary());
    cmd.args(args);
    cmd
}

fn print_output(out: &std::process::Output) {
    // Gross: use print! instead of writing to stdout so the Rust test
    // framework can capture it.
    print!("{}", String::from_utf8_lossy(&out.stdout));
    print!("{}", String::from_utf8_lossy(&out.stderr));
}

fn stdout_of(out: &std::process::Output) -> String {
    String::from_utf8_lossy(&out.stdout).to_string()
}

const OPTIONS: &str = "\
.cpp .obj = cat ${INPUT} > ${OUTPUT}; cat ${INPUT}.deps > ${DEPS} 2>/dev/null; true
.cpp .slib = cat ${INPUT} > ${OUTPUT}
.cpp .dlib = { echo DYN; cat ${INPUT}; } > ${OUTPUT}
.cpp .exe = cat ${INPUT} ${LIBS} > ${OUTPUT} && chmod +x ${OUTPUT}
";

/// Manages a temporary build directory for invoking bub.
struct TestSpace {
    dir: tempfile::TempDir,
}

impl TestSpace {
    fn new() -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        Ok(TestSpace { dir })
    }

    fn write(&self, path: &str, content: &str) -> std::io::Result<()> {
        let path = self.dir.path().join(path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)
    }

    fn read(&self, path: &str) -> std::io::Result<Vec<u8>> {
        std::fs::read(self.dir.path().join(path))
    }

    fn exists(&self, path: &str) -> bool {
        self.dir.path().join(path).exists()
    }

    fn delete(&self, path: &str) -> std::io::Result<()> {
        std::fs::remove_file(self.dir.path().join(path))
    }

    /// Push a file's mtime well past anything built so far.
    fn touch_future(&self, path: &str) -> std::io::Result<()> {
        let file = std::fs::File::options()
            .write(true)
            .open(self.dir.path().join(path))?;
        file.set_modified(SystemTime::now() + Duration::from_secs(60))
    }

    fn run(&self, cmd: &mut std::process::Command) -> std::io::Result<std::process::Output> {
        cmd.current_dir(self.dir.path()).output()
    }

    fn run_expect(&self, cmd: &mut std::process::Command) -> std::io::Result<std::process::Output> {
        let out = self.run(cmd)?;
        if !out.status.success() {
            print_output(&out);
            panic!("bub failed unexpectedly");
        }
        Ok(out)
    }
}

#[test]
fn single_object_build_then_idempotent() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("Buboptions", OPTIONS)?;
    space.write("src/Bubfile", "contain p;\n")?;
    space.write("src/p/Bubfile", "static-lib foo : foo.h : foo.cpp;\n")?;
    space.write("src/p/foo.h", "int foo();\n")?;
    space.write("src/p/foo.cpp", "#include \"p/foo.h\"\nint foo() { return 1; }\n")?;
    space.write("src/p/foo.cpp.deps", "src/p/foo.cpp src/p/foo.h\n")?;

    space.run_expect(&mut bub_command(vec![]))?;
    assert!(space.exists("obj/p/foo.o"));
    assert!(space.exists("obj/libp-foo-s.a"));
    assert!(space.exists("dependency-cache"));

    // Immediate rebuild does nothing.
    let out = space.run_expect(&mut bub_command(vec![]))?;
    assert!(stdout_of(&out).contains("no work"), "{}", stdout_of(&out));
    Ok(())
}

#[test]
fn header_touch_rebuilds_only_affected() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("Buboptions", OPTIONS)?;
    space.write("src/Bubfile", "contain p;\n")?;
    space.write(
        "src/p/Bubfile",
        "static-lib foo : foo.h : foo.cpp;\nstatic-lib bar : bar.h : bar.cpp;\n",
    )?;
    space.write("src/p/foo.h", "int foo();\n")?;
    space.write("src/p/foo.cpp", "#include \"p/foo.h\"\n")?;
    space.write("src/p/foo.cpp.deps", "src/p/foo.cpp src/p/foo.h\n")?;
    space.write("src/p/bar.h", "int bar();\n")?;
    space.write("src/p/bar.cpp", "#include \"p/bar.h\"\n")?;
    space.write("src/p/bar.cpp.deps", "src/p/bar.cpp src/p/bar.h\n")?;

    space.run_expect(&mut bub_command(vec![]))?;
    space.touch_future("src/p/foo.h")?;
    let out = space.run_expect(&mut bub_command(vec![]))?;
    let stdout = stdout_of(&out);
    assert!(stdout.contains("obj/p/foo.o"), "{}", stdout);
    assert!(stdout.contains("obj/libp-foo-s.a"), "{}", stdout);
    assert!(!stdout.contains("obj/p/bar.o"), "{}", stdout);
    assert!(!stdout.contains("libp-bar-s.a"), "{}", stdout);
    Ok(())
}

fn lo_hi_project(space: &TestSpace) -> anyhow::Result<()> {
    space.write("Buboptions", OPTIONS)?;
    space.write("src/Bubfile", "contain p;\n")?;
    space.write("src/p/Bubfile", "contain lo hi;\n")?;
    space.write("src/p/lo/Bubfile", "static-lib lo : lo.h : lo.cpp;\n")?;
    space.write("src/p/lo/lo.h", "int lo();\n")?;
    space.write("src/p/lo/lo.cpp", "#include \"p/lo/lo.h\"\nLO_IMPL\n")?;
    space.write("src/p/lo/lo.cpp.deps", "src/p/lo/lo.cpp src/p/lo/lo.h\n")?;
    space.write("src/p/hi/Bubfile", "dist-exe hi : hi.cpp;\n")?;
    space.write("src/p/hi/hi.cpp", "#include \"p/lo/lo.h\"\nHI_MAIN\n")?;
    space.write("src/p/hi/hi.cpp.deps", "src/p/hi/hi.cpp src/p/lo/lo.h\n")?;
    Ok(())
}

#[test]
fn inferred_static_lib_link() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    lo_hi_project(&space)?;

    space.run_expect(&mut bub_command(vec![]))?;
    let exe = space.read("dist/bin/hi")?;
    let exe = String::from_utf8_lossy(&exe);
    // The exe was linked against the inferred static lib: the fake link
    // command cats ${LIBS}, so the lib's contents are in the output.
    assert!(exe.contains("HI_MAIN"), "{}", exe);
    assert!(exe.contains("LO_IMPL"), "{}", exe);

    let out = space.run_expect(&mut bub_command(vec![]))?;
    assert!(stdout_of(&out).contains("no work"), "{}", stdout_of(&out));

    // A touched lo.cpp rebuilds lo.o, the lib, and the exe, but not hi.o.
    space.touch_future("src/p/lo/lo.cpp")?;
    let out = space.run_expect(&mut bub_command(vec![]))?;
    let stdout = stdout_of(&out);
    assert!(stdout.contains("obj/p/lo/lo.o"), "{}", stdout);
    assert!(stdout.contains("obj/libp-lo-s.a"), "{}", stdout);
    assert!(stdout.contains("dist/bin/hi"), "{}", stdout);
    assert!(!stdout.contains("obj/p/hi/hi.o"), "{}", stdout);
    Ok(())
}

#[test]
fn dynamic_lib_preempts_static() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    lo_hi_project(&space)?;
    // An earlier-declared dynamic lib packaging `lo` wins over the static.
    space.write(
        "src/p/lo/Bubfile",
        "static-lib lo : lo.h : lo.cpp;\ndynamic-lib lo-dyn : lo;\n",
    )?;

    space.run_expect(&mut bub_command(vec![]))?;
    assert!(space.exists("dist/lib/liblo-dyn.so"));
    let exe = space.read("dist/bin/hi")?;
    let exe = String::from_utf8_lossy(&exe);
    // The dynamic-lib command stamps DYN; its presence in the exe means
    // ${LIBS} resolved to the .so, not the .a.
    assert!(exe.contains("DYN"), "{}", exe);
    Ok(())
}

#[test]
fn visibility_violation_aborts_planning() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("Buboptions", OPTIONS)?;
    space.write("src/Bubfile", "contain p;\n")?;
    space.write("src/p/Bubfile", "contain a : protected;\ncontain b;\n")?;
    space.write("src/p/a/Bubfile", "static-lib foo : foo.h : foo.cpp;\n")?;
    space.write("src/p/a/foo.h", "int foo();\n")?;
    space.write("src/p/a/foo.cpp", "#include \"p/a/foo.h\"\n")?;
    space.write("src/p/b/Bubfile", "dist-exe ex : ex.cpp;\n")?;
    space.write("src/p/b/ex.cpp", "#include \"p/a/foo.h\"\n")?;

    let out = space.run(&mut bub_command(vec![]))?;
    assert_eq!(out.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&out.stderr).to_string();
    assert!(stderr.contains("ERROR"), "{}", stderr);
    assert!(stderr.contains("not visible"), "{}", stderr);
    Ok(())
}

#[test]
fn generator_fence_and_regeneration() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("Buboptions", OPTIONS)?;
    space.write("src/Bubfile", "contain p;\n")?;
    space.write(
        "src/p/Bubfile",
        "generate msg.h msg.cpp : sh src/p/gen.sh ${INPUT} ${OUTPUT} : msg.idl;\n\
         dist-exe hi : hi.cpp msg.cpp msg.h;\n",
    )?;
    space.write("src/p/gen.sh", "cat \"$1\" > \"$2\"; cat \"$1\" > \"$3\"\n")?;
    space.write("src/p/msg.idl", "MSG_DEF\n")?;
    space.write("src/p/hi.cpp", "#include \"p/msg.h\"\nHI_MAIN\n")?;
    space.write("src/p/hi.cpp.deps", "src/p/hi.cpp obj/p/msg.h\n")?;

    space.run_expect(&mut bub_command(vec![]))?;
    assert!(space.exists("obj/p/msg.h"));
    assert!(space.exists("obj/p/msg.o"));
    let exe = space.read("dist/bin/hi")?;
    assert!(String::from_utf8_lossy(&exe).contains("MSG_DEF"));

    let out = space.run_expect(&mut bub_command(vec![]))?;
    assert!(stdout_of(&out).contains("no work"), "{}", stdout_of(&out));

    // Touching the IDL regenerates and rebuilds everything downstream.
    space.touch_future("src/p/msg.idl")?;
    let out = space.run_expect(&mut bub_command(vec![]))?;
    let stdout = stdout_of(&out);
    assert!(stdout.contains("obj/p/msg.h"), "{}", stdout);
    assert!(stdout.contains("obj/p/msg.o"), "{}", stdout);
    assert!(stdout.contains("dist/bin/hi"), "{}", stdout);
    Ok(())
}

#[test]
fn stale_cache_recovery() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    lo_hi_project(&space)?;
    space.run_expect(&mut bub_command(vec![]))?;

    // With the cache gone, everything is maximally dirty but the build
    // still succeeds, and the cache is rewritten on exit.
    space.delete("dependency-cache")?;
    let out = space.run_expect(&mut bub_command(vec![]))?;
    assert!(stdout_of(&out).contains("updated"), "{}", stdout_of(&out));
    assert!(space.exists("dependency-cache"));

    let out = space.run_expect(&mut bub_command(vec![]))?;
    assert!(stdout_of(&out).contains("no work"), "{}", stdout_of(&out));
    Ok(())
}

#[test]
fn stale_outputs_are_deleted() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("Buboptions", OPTIONS)?;
    space.write("src/Bubfile", "contain p;\n")?;
    space.write("src/p/Bubfile", "static-lib foo : foo.h : foo.cpp;\n")?;
    space.write("src/p/foo.h", "int foo();\n")?;
    space.write("src/p/foo.cpp", "#include \"p/foo.h\"\n")?;

    space.run_expect(&mut bub_command(vec![]))?;
    space.write("obj/p/garbage.o", "leftover\n")?;
    space.write("dist/junk", "leftover\n")?;
    space.run_expect(&mut bub_command(vec![]))?;
    assert!(!space.exists("obj/p/garbage.o"));
    assert!(!space.exists("dist/junk"));
    assert!(space.exists("obj/p/foo.o"));
    Ok(())
}

#[test]
fn failed_action_cancels_and_reports() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "Buboptions",
        ".cpp .obj = false\n.cpp .slib = cat ${INPUT} > ${OUTPUT}\n",
    )?;
    space.write("src/Bubfile", "contain p;\n")?;
    space.write("src/p/Bubfile", "static-lib foo : foo.h : foo.cpp;\n")?;
    space.write("src/p/foo.h", "int foo();\n")?;
    space.write("src/p/foo.cpp", "#include \"p/foo.h\"\n")?;

    let out = space.run(&mut bub_command(vec![]))?;
    assert_eq!(out.status.code(), Some(1));
    let stdout = stdout_of(&out);
    assert!(stdout.contains("failed: obj/p/foo.o"), "{}", stdout);
    assert!(stdout.contains("outstanding"), "{}", stdout);
    // Partial outputs never survive a failed action.
    assert!(!space.exists("obj/p/foo.o"));
    Ok(())
}

#[test]
fn public_lib_exports_headers() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("Buboptions", OPTIONS)?;
    space.write("src/Bubfile", "contain p;\n")?;
    space.write("src/p/Bubfile", "public-lib foo : foo.h : foo.cpp;\n")?;
    space.write("src/p/foo.h", "int foo();\n")?;
    space.write("src/p/foo.cpp", "#include \"p/foo.h\"\n")?;

    space.run_expect(&mut bub_command(vec![]))?;
    assert!(space.exists("dist/lib/libp-foo-s.a"));
    assert!(space.exists("dist/include/p/foo.h"));
    Ok(())
}

#[test]
fn test_exe_runs_and_records_result() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("Buboptions", OPTIONS)?;
    space.write("src/Bubfile", "contain p;\n")?;
    space.write("src/p/Bubfile", "test-exe t : t.cpp : : 5;\n")?;
    // The "compiled" exe is this script verbatim, via the cat chain.
    space.write("src/p/t.cpp", "#!/bin/sh\necho TEST_RAN\nexit 0\n")?;

    space.run_expect(&mut bub_command(vec![]))?;
    assert!(space.exists("priv/p/t"));
    let result = space.read("priv/p/t-passed")?;
    assert!(String::from_utf8_lossy(&result).contains("TEST_RAN"));
    Ok(())
}

#[test]
fn conditional_regions_follow_options() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let options = format!("CONDITIONALS = Posix\n{}", OPTIONS);
    space.write("Buboptions", &options)?;
    space.write("src/Bubfile", "contain p;\n")?;
    space.write(
        "src/p/Bubfile",
        "static-lib s : s.h : s.cpp [Posix]( s_posix.cpp ) [Windows]( s_win.cpp );\n",
    )?;
    space.write("src/p/s.h", "int s();\n")?;
    space.write("src/p/s.cpp", "#include \"p/s.h\"\n")?;
    space.write("src/p/s_posix.cpp", "#include \"p/s.h\"\n")?;

    space.run_expect(&mut bub_command(vec![]))?;
    assert!(space.exists("obj/p/s_posix.o"));
    assert!(!space.exists("obj/p/s_win.o"));
    Ok(())
}

// Copyright (c) 2019 King's College London created by the Software Development
// Team <http://soft-dev.org/>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/UPL> at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The `gc_tests` harness (spec.md §4 test tooling): each file under
//! `gc_tests/tests/` is a standalone program, compiled against this crate
//! and run, whose leading `// Run-time:\n//  status: ...` comment block
//! tells `lang_tester` what outcome to expect. Mirrors this author group's
//! other `lang_tester`-driven suites (grmtools, yksom).

use std::{env, fs, path::PathBuf, process::Command};

use lang_tester::LangTester;
use tempdir::TempDir;

/// Directory holding the `rlib` and its dependencies that `cargo test` just
/// built, so the harness can `rustc --extern` against the very build under
/// test rather than a stale one.
fn deps_dir() -> PathBuf {
    let mut p = env::current_exe().unwrap();
    p.pop(); // the gc_tests harness binary itself
    p.pop(); // deps/
    p
}

fn main() {
    // Kept alive for the duration of `run()`: each compiled test binary is
    // written here rather than alongside the source.
    let tempdir = TempDir::new("gcmalloc_tests").unwrap();
    let deps = deps_dir();

    LangTester::new()
        .test_dir("gc_tests/tests")
        .test_file_filter(|p| p.extension().and_then(|e| e.to_str()) == Some("rs"))
        .test_extract(|p| {
            fs::read_to_string(p)
                .unwrap()
                .lines()
                .skip_while(|l| !l.starts_with("//"))
                .take_while(|l| l.starts_with("//"))
                .map(|l| &l[2..])
                .collect::<Vec<_>>()
                .join("\n")
        })
        .test_cmds(move |p| {
            let mut exe = PathBuf::new();
            exe.push(&tempdir);
            exe.push(p.file_stem().unwrap());

            let mut compiler = Command::new("rustc");
            compiler.args([
                "--edition=2018",
                "-L",
                deps.to_str().unwrap(),
                "--extern",
                &format!("gcmalloc={}/libgcmalloc.rlib", deps.to_str().unwrap()),
                "-o",
                exe.to_str().unwrap(),
                p.to_str().unwrap(),
            ]);

            let runtime = Command::new(exe);
            vec![("Compiler", compiler), ("Run-time", runtime)]
        })
        .run();
}

//! Shared helpers for the end-to-end tests.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use shardtest::backend::{Backend, CancelToken};
use shardtest::config::SpecLoader;
use shardtest::logging::{LogLevel, Logger};
use shardtest::report::Report;
use shardtest::runner::{Runner, RunnerError};

pub fn parse_job(yaml: &str) -> shardtest::config::TestJob {
    SpecLoader::parse(yaml, &BTreeMap::new()).expect("job spec must parse")
}

pub async fn run_with_backend(backend: Backend, yaml: &str) -> Result<Report, RunnerError> {
    let logger = Arc::new(Logger::new(LogLevel::Debug));
    let runner = Runner::new(backend, "default", logger);
    runner.run(&CancelToken::new(), parse_job(yaml)).await
}

pub async fn run_local(yaml: &str) -> Result<Report, RunnerError> {
    run_with_backend(Backend::local(), yaml).await
}

pub async fn run_dry(yaml: &str) -> Result<Report, RunnerError> {
    run_with_backend(Backend::dry_run(), yaml).await
}

/// Create a throwaway git repository with one commit.
pub fn init_git_repo(dir: &Path) {
    let run = |args: &[&str]| {
        let out = std::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .expect("git must be runnable");
        assert!(
            out.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&out.stderr)
        );
    };
    run(&["init", "-b", "main"]);
    std::fs::write(dir.join("hello.txt"), "tracked content\n").unwrap();
    run(&["add", "."]);
    run(&[
        "-c",
        "user.email=ci@example.com",
        "-c",
        "user.name=ci",
        "commit",
        "-m",
        "initial",
    ]);
}

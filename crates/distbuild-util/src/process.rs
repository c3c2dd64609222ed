//! The process executor: runs a child command to completion with captured stdout/stderr and exit
//! code. Treated as an opaque collaborator by the job-execution driver — command rendering
//! decides `argv`/cwd/env, this just runs it.

use anyhow::{Context as _, Result};
use std::path::Path;
use std::process::Output;
use tokio::process::Command;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Spawn `argv[0]` with the rest of `argv` as arguments, in `working_dir`, with `environ` (each
/// entry `KEY=VALUE`) replacing the child's environment entirely. Returns `Err` only for
/// infrastructural failures (the binary couldn't be spawned, an I/O error reading its output); a
/// nonzero exit code is a normal, successful `Ok` result.
pub async fn run(argv: &[String], working_dir: &Path, environ: &[String]) -> Result<ExecOutput> {
    let (program, args) = argv
        .split_first()
        .context("cmd has an empty argv")?;

    let mut cmd = Command::new(program);
    cmd.args(args).current_dir(working_dir).env_clear();
    for kv in environ {
        if let Some((k, v)) = kv.split_once('=') {
            cmd.env(k, v);
        }
    }

    let Output {
        status,
        stdout,
        stderr,
    } = cmd
        .output()
        .await
        .with_context(|| format!("spawning {program}"))?;

    Ok(ExecOutput {
        exit_code: status.code().unwrap_or(-1),
        stdout,
        stderr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let out = run(
            &["echo".into(), "OK".into()],
            Path::new("."),
            &[],
        )
        .await
        .unwrap();
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout, b"OK\n");
    }

    #[tokio::test]
    async fn nonzero_exit_is_not_an_error() {
        let out = run(&["false".into()], Path::new("."), &[]).await.unwrap();
        assert_eq!(out.exit_code, 1);
    }

    #[tokio::test]
    async fn unspawnable_program_is_an_error() {
        let result = run(&["/no/such/binary".into()], Path::new("."), &[]).await;
        assert!(result.is_err());
    }
}

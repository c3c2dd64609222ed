//! Command rendering and execution: resolves a single `Cmd` against a job's render context
//! (source dir, output dir, dep-ID -> absolute path) and runs it. `Exec` commands are handed to
//! the process executor; `CatTemplate` commands are just a file write, no child process involved.
//!
//! Token substitution is deliberately small: `{{source_dir}}`, `{{output_dir}}`, and
//! `{{dep:<hex-id>}}` are replaced with absolute paths wherever they appear in `argv`, `environ`
//! values, and `cat_template`. `working_dir` is always resolved relative to the source dir and
//! `cat_output` relative to the output dir, so neither needs tokens of its own.

use anyhow::{bail, Context as _, Result};
use distbuild_base::{Cmd, Id};
use distbuild_util::process::{self, ExecOutput};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// What a job's commands get to see: where its source files landed, where its output belongs,
/// and where each dependency's artifact directory lives on disk for the duration of the job.
pub struct RenderContext {
    pub source_dir: PathBuf,
    pub output_dir: PathBuf,
    pub deps: HashMap<Id, PathBuf>,
}

fn render_token_str(s: &str, ctx: &RenderContext) -> Result<String> {
    let mut out = s.replace("{{source_dir}}", &ctx.source_dir.display().to_string());
    out = out.replace("{{output_dir}}", &ctx.output_dir.display().to_string());

    while let Some(start) = out.find("{{dep:") {
        let rest = &out[start + "{{dep:".len()..];
        let Some(end) = rest.find("}}") else {
            bail!("unterminated {{{{dep:...}}}} token in {s:?}");
        };
        let hex = &rest[..end];
        let dep_id: Id = hex
            .parse()
            .with_context(|| format!("malformed dep id in token {{{{dep:{hex}}}}}"))?;
        let dep_path = ctx
            .deps
            .get(&dep_id)
            .with_context(|| format!("command references dep {dep_id} not in its JobSpec.Artifacts"))?;
        let token = format!("{{{{dep:{hex}}}}}");
        out = out.replacen(&token, &dep_path.display().to_string(), 1);
    }

    Ok(out)
}

/// The result of running one `Cmd`. `CatTemplate` always succeeds with an empty, zero-exit
/// `ExecOutput` once the write lands; there's no process to fail non-infrastructurally.
pub async fn run_cmd(cmd: &Cmd, ctx: &RenderContext) -> Result<ExecOutput> {
    match cmd {
        Cmd::Exec {
            argv,
            working_dir,
            environ,
        } => {
            let dir = ctx.source_dir.join(working_dir);
            let rendered_argv = argv
                .iter()
                .map(|a| render_token_str(a, ctx))
                .collect::<Result<Vec<_>>>()?;
            let rendered_environ = environ
                .iter()
                .map(|kv| match kv.split_once('=') {
                    Some((k, v)) => Ok(format!("{k}={}", render_token_str(v, ctx)?)),
                    None => Ok(kv.clone()),
                })
                .collect::<Result<Vec<_>>>()?;
            process::run(&rendered_argv, &dir, &rendered_environ).await
        }
        Cmd::CatTemplate {
            cat_template,
            cat_output,
        } => {
            let dest = ctx.output_dir.join(cat_output);
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("creating parent dir for {}", dest.display()))?;
            }
            let rendered = render_token_str(cat_template, ctx)?;
            tokio::fs::write(&dest, rendered.as_bytes())
                .await
                .with_context(|| format!("writing template to {}", dest.display()))?;
            Ok(ExecOutput {
                exit_code: 0,
                stdout: Vec::new(),
                stderr: Vec::new(),
            })
        }
    }
}

fn empty_ctx(root: &Path) -> RenderContext {
    RenderContext {
        source_dir: root.to_path_buf(),
        output_dir: root.to_path_buf(),
        deps: HashMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cat_template_writes_the_literal_string() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = Cmd::CatTemplate {
            cat_template: "hello world".to_owned(),
            cat_output: "out/stamp.txt".into(),
        };
        let ctx = empty_ctx(dir.path());
        let out = run_cmd(&cmd, &ctx).await.unwrap();
        assert_eq!(out.exit_code, 0);
        let contents = tokio::fs::read_to_string(dir.path().join("out/stamp.txt"))
            .await
            .unwrap();
        assert_eq!(contents, "hello world");
    }

    #[tokio::test]
    async fn exec_runs_in_the_job_relative_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir(dir.path().join("sub")).await.unwrap();
        let cmd = Cmd::Exec {
            argv: vec!["pwd".to_owned()],
            working_dir: "sub".into(),
            environ: vec![],
        };
        let ctx = empty_ctx(dir.path());
        let out = run_cmd(&cmd, &ctx).await.unwrap();
        assert_eq!(out.exit_code, 0);
        let pwd = String::from_utf8(out.stdout).unwrap();
        assert!(pwd.trim().ends_with("sub"));
    }

    #[tokio::test]
    async fn argv_token_resolves_to_dep_path() {
        let dir = tempfile::tempdir().unwrap();
        let dep_dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dep_dir.path().join("out.txt"), b"dep output").await.unwrap();

        let dep_id = Id([0x42; 16]);
        let mut deps = HashMap::new();
        deps.insert(dep_id, dep_dir.path().to_path_buf());
        let ctx = RenderContext {
            source_dir: dir.path().to_path_buf(),
            output_dir: dir.path().to_path_buf(),
            deps,
        };

        let cmd = Cmd::Exec {
            argv: vec!["cat".to_owned(), format!("{{{{dep:{dep_id}}}}}/out.txt")],
            working_dir: ".".into(),
            environ: vec![],
        };
        let out = run_cmd(&cmd, &ctx).await.unwrap();
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout, b"dep output");
    }

    #[tokio::test]
    async fn unknown_dep_token_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = empty_ctx(dir.path());
        let cmd = Cmd::Exec {
            argv: vec!["cat".to_owned(), format!("{{{{dep:{}}}}}/out.txt", Id([0x01; 16]))],
            working_dir: ".".into(),
            environ: vec![],
        };
        assert!(run_cmd(&cmd, &ctx).await.is_err());
    }
}

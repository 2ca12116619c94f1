//! `command`: delegate to an external program.
//!
//! Options:
//! - `program` (required): executable, looked up on `PATH`
//! - `args`: argument template; `{input}`, `{output}`, `{output_name}`,
//!   `{output_dir}` and `{name}` are substituted, an argument that is exactly
//!   `{inputs}` expands to every input path
//! - `per_file` (default `true`): one invocation per input file
//! - `extension`, `suffix`: naming of per-file outputs (`style` + `.min` + `css`)
//! - `output_file`: the single product of a whole-set invocation, required
//!   with `per_file = false`
//! - `stdin`, `stdout`: feed the input on stdin / take stdout as the output
//! - `then`: further programs (`[["npx", "postcss", "--use", "autoprefixer"]]`)
//!   the produced bytes are piped through, stdin to stdout, before the output
//!   is put in place
//!
//! Programs writing to `{output}` receive a temporary path that is renamed
//! into place only after every step succeeded.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use super::{string_list, Transform, TransformContext};
use crate::inputs::InputFile;
use crate::util::{temp_sibling, write_atomic};
use crate::{klog_debug, Error, Result};

const STDERR_TAIL_LINES: usize = 20;

pub struct CommandTransform;

struct Vars<'a> {
    input: Option<&'a Path>,
    output: Option<&'a Path>,
    output_dir: &'a Path,
    name: &'a str,
    inputs: &'a [InputFile],
}

fn expand_args(template: &[String], vars: &Vars<'_>) -> Vec<String> {
    let mut args = Vec::with_capacity(template.len());
    for arg in template {
        if arg == "{inputs}" {
            args.extend(
                vars.inputs
                    .iter()
                    .map(|i| i.path.to_string_lossy().into_owned()),
            );
            continue;
        }
        let mut expanded = arg.replace("{output_dir}", &vars.output_dir.to_string_lossy());
        if let Some(input) = vars.input {
            expanded = expanded.replace("{input}", &input.to_string_lossy());
        }
        if let Some(output) = vars.output {
            let file_name = output
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            expanded = expanded.replace("{output_name}", &file_name);
            expanded = expanded.replace("{output}", &output.to_string_lossy());
        }
        expanded = expanded.replace("{name}", vars.name);
        args.push(expanded);
    }
    args
}

/// Output path of a per-file invocation, mirroring the input's layout.
fn per_file_output(ctx: &TransformContext, input: &InputFile) -> PathBuf {
    let stem = input
        .path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let suffix = ctx.string_option("suffix").unwrap_or("");
    let extension = ctx
        .string_option("extension")
        .map(str::to_string)
        .or_else(|| {
            input
                .path
                .extension()
                .map(|e| e.to_string_lossy().into_owned())
        });
    let name = match extension {
        Some(ext) => format!("{}{}.{}", stem, suffix, ext.trim_start_matches('.')),
        None => format!("{}{}", stem, suffix),
    };
    let parent = input.relative.parent().unwrap_or_else(|| Path::new(""));
    ctx.output_dir.join(parent).join(name)
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

/// Post-processing programs from the `then` option, each as `[program, args...]`.
fn stages(options: &toml::Table) -> std::result::Result<Vec<Vec<String>>, String> {
    let Some(value) = options.get("then") else {
        return Ok(Vec::new());
    };
    let invalid = || "`then` must be an array of non-empty string arrays".to_string();
    let items = value.as_array().ok_or_else(invalid)?;
    items
        .iter()
        .map(|stage| {
            let parts = stage.as_array().ok_or_else(invalid)?;
            let parts = parts
                .iter()
                .map(|p| p.as_str().map(str::to_string).ok_or_else(invalid))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            if parts.is_empty() {
                return Err(invalid());
            }
            Ok(parts)
        })
        .collect()
}

fn check_status(ctx: &TransformContext, program: &str, output: Output) -> Result<Vec<u8>> {
    if output.status.success() {
        return Ok(output.stdout);
    }
    let tail = stderr_tail(&output.stderr);
    let message = if tail.is_empty() {
        format!("{} failed ({})", program, output.status)
    } else {
        format!("{} failed ({}):\n{}", program, output.status, tail)
    };
    Err(Error::transform(ctx.task.as_str(), message))
}

impl CommandTransform {
    fn program<'a>(ctx: &'a TransformContext) -> Result<(&'a str, PathBuf)> {
        let program = ctx
            .string_option("program")
            .ok_or_else(|| Error::transform(ctx.task.as_str(), "missing `program` option"))?;
        let resolved = which::which(program).map_err(|_| {
            Error::transform(ctx.task.as_str(), format!("program not found: {}", program))
        })?;
        Ok((program, resolved))
    }

    /// Run once; returns captured stdout.
    fn invoke(
        ctx: &TransformContext,
        program: &str,
        resolved: &Path,
        args: &[String],
        stdin: Option<&Path>,
    ) -> Result<Vec<u8>> {
        klog_debug!("[{}] {} {}", ctx.task, program, args.join(" "));

        let stdin = match stdin {
            Some(path) => Stdio::from(std::fs::File::open(path)?),
            None => Stdio::null(),
        };
        let output = Command::new(resolved)
            .args(args)
            .current_dir(&ctx.project_root)
            .stdin(stdin)
            .output()
            .map_err(|e| {
                Error::transform(ctx.task.as_str(), format!("failed to start {}: {}", program, e))
            })?;
        check_status(ctx, program, output)
    }

    /// Pipe `bytes` through every `then` stage in order.
    fn post_process(ctx: &TransformContext, stages: &[Vec<String>], mut bytes: Vec<u8>) -> Result<Vec<u8>> {
        for stage in stages {
            let Some((program, args)) = stage.split_first() else {
                continue;
            };
            let resolved = which::which(program).map_err(|_| {
                Error::transform(ctx.task.as_str(), format!("program not found: {}", program))
            })?;
            klog_debug!("[{}] | {} {}", ctx.task, program, args.join(" "));

            let mut child = Command::new(&resolved)
                .args(args)
                .current_dir(&ctx.project_root)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
                .map_err(|e| {
                    Error::transform(ctx.task.as_str(), format!("failed to start {}: {}", program, e))
                })?;
            let mut stdin = child
                .stdin
                .take()
                .ok_or_else(|| Error::transform(ctx.task.as_str(), format!("no stdin for {}", program)))?;
            // Written from another thread so a full stdout pipe cannot stall us.
            let writer = std::thread::spawn(move || {
                let _ = stdin.write_all(&bytes);
            });
            let output = child.wait_with_output()?;
            let _ = writer.join();
            bytes = check_status(ctx, program, output)?;
        }
        Ok(bytes)
    }

    /// Invoke with a final output path, honouring stdout capture and the
    /// temporary-then-rename protocol.
    fn produce(
        ctx: &TransformContext,
        program: &str,
        resolved: &Path,
        template: &[String],
        stages: &[Vec<String>],
        input: Option<&Path>,
        output: &Path,
    ) -> Result<()> {
        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let name = output
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let stdin = if ctx.bool_option("stdin", false) {
            input
        } else {
            None
        };

        if ctx.bool_option("stdout", false) {
            let vars = Vars {
                input,
                output: Some(output),
                output_dir: &ctx.output_dir,
                name: &name,
                inputs: &ctx.inputs,
            };
            let bytes = Self::invoke(ctx, program, resolved, &expand_args(template, &vars), stdin)?;
            let bytes = Self::post_process(ctx, stages, bytes)?;
            return write_atomic(output, &bytes);
        }

        let tmp = temp_sibling(output);
        let vars = Vars {
            input,
            output: Some(&tmp),
            output_dir: &ctx.output_dir,
            name: &name,
            inputs: &ctx.inputs,
        };
        let result = Self::invoke(ctx, program, resolved, &expand_args(template, &vars), stdin);
        if let Err(e) = result {
            let _ = std::fs::remove_file(&tmp);
            return Err(e);
        }
        if !tmp.exists() {
            return Err(Error::transform(
                ctx.task.as_str(),
                format!("{} did not write {}", program, output.display()),
            ));
        }
        if stages.is_empty() {
            std::fs::rename(&tmp, output)?;
            return Ok(());
        }
        let bytes = std::fs::read(&tmp);
        let _ = std::fs::remove_file(&tmp);
        let bytes = Self::post_process(ctx, stages, bytes?)?;
        write_atomic(output, &bytes)
    }
}

impl Transform for CommandTransform {
    fn kind(&self) -> &'static str {
        "command"
    }

    fn validate(&self, options: &toml::Table) -> std::result::Result<(), String> {
        match options.get("program").and_then(|v| v.as_str()) {
            Some(p) if !p.trim().is_empty() => {}
            _ => return Err("command requires a `program` option".to_string()),
        }
        if let Some(args) = options.get("args") {
            let all_strings = args
                .as_array()
                .map(|items| items.iter().all(|i| i.is_str()))
                .unwrap_or(false);
            if !all_strings {
                return Err("`args` must be an array of strings".to_string());
            }
        }
        let per_file = options
            .get("per_file")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        let stdin = options
            .get("stdin")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if !per_file && stdin {
            return Err("`stdin` requires `per_file`".to_string());
        }
        let output_file = options.get("output_file").and_then(|v| v.as_str());
        if !per_file && output_file.map_or(true, str::is_empty) {
            return Err("`per_file = false` requires an `output_file`".to_string());
        }
        stages(options)?;
        Ok(())
    }

    fn apply(&self, ctx: &TransformContext) -> Result<Vec<PathBuf>> {
        let (program, resolved) = Self::program(ctx)?;
        let stages = stages(&ctx.options).map_err(|e| Error::transform(ctx.task.as_str(), e))?;

        if ctx.bool_option("per_file", true) {
            let template = string_list(&ctx.options, "args")
                .unwrap_or_else(|| vec!["{input}".to_string(), "{output}".to_string()]);
            let mut produced = Vec::with_capacity(ctx.inputs.len());
            for input in &ctx.inputs {
                let output = per_file_output(ctx, input);
                Self::produce(ctx, program, &resolved, &template, &stages, Some(&input.path), &output)?;
                produced.push(output);
            }
            return Ok(produced);
        }

        // Only the declared file is reported, whatever else the program writes.
        let file = ctx
            .string_option("output_file")
            .ok_or_else(|| Error::transform(ctx.task.as_str(), "missing `output_file` option"))?;
        let template = string_list(&ctx.options, "args").unwrap_or_else(|| vec!["{inputs}".to_string()]);
        let output = ctx.output_dir.join(file);
        Self::produce(ctx, program, &resolved, &template, &stages, None, &output)?;
        Ok(vec![output])
    }
}

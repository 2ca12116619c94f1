//! `concat`: join matched files into a single output file.
//!
//! Options: `file` (required output file name), `separator` (default newline).

use std::path::PathBuf;

use super::{Transform, TransformContext};
use crate::util::write_atomic;
use crate::{Error, Result};

pub struct ConcatTransform;

impl Transform for ConcatTransform {
    fn kind(&self) -> &'static str {
        "concat"
    }

    fn validate(&self, options: &toml::Table) -> std::result::Result<(), String> {
        match options.get("file").and_then(|v| v.as_str()) {
            Some(file) if !file.is_empty() => Ok(()),
            _ => Err("concat requires a `file` option".to_string()),
        }
    }

    fn apply(&self, ctx: &TransformContext) -> Result<Vec<PathBuf>> {
        let file = ctx
            .string_option("file")
            .ok_or_else(|| Error::transform(ctx.task.as_str(), "missing `file` option"))?;
        let separator = ctx.string_option("separator").unwrap_or("\n");

        let mut out: Vec<u8> = Vec::new();
        for (i, input) in ctx.inputs.iter().enumerate() {
            if i > 0 {
                out.extend_from_slice(separator.as_bytes());
            }
            out.extend(std::fs::read(&input.path)?);
        }

        let dest = ctx.output_dir.join(file);
        write_atomic(&dest, &out)?;
        Ok(vec![dest])
    }
}

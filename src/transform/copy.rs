//! `copy`: mirror matched files into the output directory.

use std::path::PathBuf;

use super::{Transform, TransformContext};
use crate::util::copy_atomic;
use crate::Result;

pub struct CopyTransform;

impl Transform for CopyTransform {
    fn kind(&self) -> &'static str {
        "copy"
    }

    fn apply(&self, ctx: &TransformContext) -> Result<Vec<PathBuf>> {
        let mut produced = Vec::with_capacity(ctx.inputs.len());
        for input in &ctx.inputs {
            let dest = ctx.output_dir.join(&input.relative);
            copy_atomic(&input.path, &dest)?;
            produced.push(dest);
        }
        Ok(produced)
    }
}

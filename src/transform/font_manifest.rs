//! `font-manifest`: derive a stylesheet fragment from converted fonts.
//!
//! Reads the font files produced by the conversion tasks and writes one
//! `@font-face` rule per family, weight and style. The fragment is meant to be
//! edited by hand afterwards, so an existing non-empty file is left alone
//! unless `overwrite = true`.
//!
//! Options: `file` (default `_fonts.scss`), `url_prefix` (default `../fonts/`),
//! `overwrite` (default `false`).

use regex::Regex;
use std::collections::BTreeMap;
use std::path::PathBuf;

use super::{Transform, TransformContext};
use crate::util::write_atomic;
use crate::{klog_debug, Result};

/// Formats in order of preference inside a `src:` list.
const FORMATS: &[(&str, &str)] = &[("woff2", "woff2"), ("woff", "woff"), ("ttf", "truetype"), ("otf", "opentype")];

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Face {
    family: String,
    weight: u16,
    italic: bool,
}

pub struct FontManifestTransform {
    stem: Regex,
}

impl FontManifestTransform {
    pub fn new() -> Self {
        Self {
            // Lazy family so the longest weight keyword wins (ExtraBold over Bold).
            stem: Regex::new(
                r"(?i)^(?P<family>.+?)[-_ ]?(?P<weight>thin|hairline|extralight|ultralight|light|regular|normal|book|medium|semibold|demibold|extrabold|ultrabold|bold|black|heavy)?(?P<italic>italic|oblique)?$",
            )
            .expect("font stem pattern is valid"),
        }
    }

    fn face(&self, stem: &str) -> Face {
        match self.stem.captures(stem) {
            Some(caps) => Face {
                family: caps["family"].trim_end_matches(['-', '_', ' ']).to_string(),
                weight: caps
                    .name("weight")
                    .map(|w| weight_value(w.as_str()))
                    .unwrap_or(400),
                italic: caps.name("italic").is_some(),
            },
            None => Face {
                family: stem.to_string(),
                weight: 400,
                italic: false,
            },
        }
    }

    /// Render the fragment for the given font file names (`Roboto-Bold.woff2`).
    fn render(&self, files: &[String], url_prefix: &str) -> String {
        // face -> (stem, formats available)
        let mut faces: BTreeMap<Face, (String, Vec<&str>)> = BTreeMap::new();
        for file in files {
            let path = std::path::Path::new(file);
            let (Some(stem), Some(ext)) = (path.file_stem(), path.extension()) else {
                continue;
            };
            let stem = stem.to_string_lossy().into_owned();
            let ext = ext.to_string_lossy().to_lowercase();
            let Some(format) = FORMATS.iter().find(|(e, _)| *e == ext) else {
                continue;
            };
            let entry = faces
                .entry(self.face(&stem))
                .or_insert_with(|| (stem.clone(), Vec::new()));
            if !entry.1.contains(&format.0) {
                entry.1.push(format.0);
            }
        }

        let mut out = String::new();
        for (face, (stem, mut formats)) in faces {
            formats.sort_by_key(|f| FORMATS.iter().position(|(e, _)| e == f));
            let sources: Vec<String> = formats
                .iter()
                .map(|ext| {
                    let css_format = FORMATS
                        .iter()
                        .find(|(e, _)| e == ext)
                        .map(|(_, f)| *f)
                        .unwrap_or(*ext);
                    format!("url(\"{}{}.{}\") format(\"{}\")", url_prefix, stem, ext, css_format)
                })
                .collect();
            out.push_str("@font-face {\n");
            out.push_str(&format!("  font-family: \"{}\";\n", face.family));
            out.push_str(&format!("  src: {};\n", sources.join(",\n       ")));
            out.push_str(&format!("  font-weight: {};\n", face.weight));
            out.push_str(&format!(
                "  font-style: {};\n",
                if face.italic { "italic" } else { "normal" }
            ));
            out.push_str("  font-display: swap;\n");
            out.push_str("}\n\n");
        }
        out
    }
}

impl Default for FontManifestTransform {
    fn default() -> Self {
        Self::new()
    }
}

fn weight_value(keyword: &str) -> u16 {
    match keyword.to_lowercase().as_str() {
        "thin" | "hairline" => 100,
        "extralight" | "ultralight" => 200,
        "light" => 300,
        "medium" => 500,
        "semibold" | "demibold" => 600,
        "bold" => 700,
        "extrabold" | "ultrabold" => 800,
        "black" | "heavy" => 900,
        _ => 400,
    }
}

impl Transform for FontManifestTransform {
    fn kind(&self) -> &'static str {
        "font-manifest"
    }

    fn apply(&self, ctx: &TransformContext) -> Result<Vec<PathBuf>> {
        let file = ctx.string_option("file").unwrap_or("_fonts.scss");
        let dest = ctx.output_dir.join(file);
        let overwrite = ctx.bool_option("overwrite", false);

        let hand_edited = std::fs::metadata(&dest)
            .map(|m| m.len() > 0)
            .unwrap_or(false);
        if hand_edited && !overwrite {
            klog_debug!("[{}] {} exists, leaving it untouched", ctx.task, dest.display());
            return Ok(Vec::new());
        }

        let names: Vec<String> = ctx
            .inputs
            .iter()
            .filter_map(|i| i.path.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect();
        if names.is_empty() {
            return Ok(Vec::new());
        }

        let url_prefix = ctx.string_option("url_prefix").unwrap_or("../fonts/");
        write_atomic(&dest, self.render(&names, url_prefix).as_bytes())?;
        Ok(vec![dest])
    }
}

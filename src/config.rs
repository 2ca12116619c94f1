use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::task::{OutputRoot, TaskSpec};
use crate::{klog_debug, Result};

pub const DEFAULT_CONFIG_FILE: &str = "kiln.toml";

/// Pipeline configuration, loaded once and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    /// Maximum concurrently running tasks; defaults to available parallelism.
    pub jobs: Option<usize>,
    #[serde(default, rename = "task")]
    pub tasks: Vec<TaskSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_source")]
    pub source: String,
    #[serde(default = "default_output")]
    pub output: String,
}

fn default_source() -> String {
    "src".to_string()
}

fn default_output() -> String {
    "dist".to_string()
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            source: default_source(),
            output: default_output(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchConfig {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default)]
    pub bind: Vec<WatchBindingSpec>,
}

fn default_debounce_ms() -> u64 {
    200
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            bind: Vec::new(),
        }
    }
}

/// `[[watch.bind]]`: a project-relative glob and the tasks it re-runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchBindingSpec {
    pub pattern: String,
    pub tasks: Vec<String>,
}

impl WatchBindingSpec {
    pub fn new(pattern: &str, tasks: &[&str]) -> Self {
        Self {
            pattern: pattern.to_string(),
            tasks: tasks.iter().map(|t| t.to_string()).collect(),
        }
    }
}

/// Absolute project directories every task resolves against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectPaths {
    pub root: PathBuf,
    pub source: PathBuf,
    pub output: PathBuf,
}

impl ProjectPaths {
    pub fn new(root: &Path, source: &str, output: &str) -> Self {
        Self {
            root: root.to_path_buf(),
            source: root.join(source),
            output: root.join(output),
        }
    }
}

impl PipelineConfig {
    /// Load `path`, falling back to the built-in pipeline when it is absent.
    pub fn load(path: &Path) -> Result<Self> {
        klog_debug!("PipelineConfig::load path={}", path.display());
        if !path.exists() {
            klog_debug!("Config file not found, using built-in pipeline");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        klog_debug!(
            "Config loaded: {} tasks, {} watch bindings, output={}",
            config.tasks.len(),
            config.watch.bind.len(),
            config.paths.output
        );
        Ok(config)
    }

    pub fn project_paths(&self, root: &Path) -> ProjectPaths {
        ProjectPaths::new(root, &self.paths.source, &self.paths.output)
    }

    pub fn effective_jobs(&self) -> usize {
        self.jobs.filter(|j| *j > 0).unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }
}

impl Default for PipelineConfig {
    /// Classic front-end starter layout: markup, styles, scripts, libraries,
    /// images, an svg sprite and converted web fonts.
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            server: ServerConfig::default(),
            watch: WatchConfig {
                debounce_ms: default_debounce_ms(),
                bind: default_bindings(),
            },
            jobs: None,
            tasks: default_tasks(),
        }
    }
}

fn strings(items: &[&str]) -> toml::Value {
    toml::Value::Array(items.iter().map(|s| toml::Value::from(*s)).collect())
}

fn default_tasks() -> Vec<TaskSpec> {
    vec![
        TaskSpec::new("html", "command")
            .inputs(["src/*.html"])
            .output("", Some("*.html"))
            .group("assets")
            .option("program", "npx")
            .option(
                "args",
                strings(&["posthtml", "{input}", "-o", "{output}", "-u", "posthtml-include"]),
            ),
        // `*.css` would also match the release `*.min.css` variants, so
        // sources that would compile onto those names are left out.
        TaskSpec::new("style", "command")
            .inputs(["src/scss/*.scss"])
            .exclude(["src/scss/_*.scss", "src/scss/*.min.scss"])
            .output("css", Some("*.css"))
            .after(["font-manifest"])
            .group("assets")
            .option("program", "sass")
            .option("args", strings(&["--embed-source-map", "{input}", "{output}"]))
            .option(
                "then",
                toml::Value::Array(vec![strings(&["npx", "postcss", "--use", "autoprefixer", "--map"])]),
            )
            .option("extension", "css"),
        TaskSpec::new("style-min", "command")
            .inputs(["style.css"])
            .reads_output_of("style")
            .output("css", Some("*.min.css"))
            .release()
            .option("program", "npx")
            .option("args", strings(&["cleancss", "-o", "{output}", "{input}"]))
            .option("suffix", ".min"),
        TaskSpec::new("js", "command")
            .inputs(["src/js/main.js"])
            .output("js", Some("main.js"))
            .group("assets")
            .option("program", "npx")
            .option(
                "args",
                strings(&["esbuild", "{input}", "--bundle", "--sourcemap=inline", "--outfile={output}"]),
            ),
        TaskSpec::new("js-min", "command")
            .inputs(["main.js"])
            .reads_output_of("js")
            .output("js", Some("*.min.js"))
            .release()
            .option("program", "npx")
            .option("args", strings(&["terser", "{input}", "--compress", "--mangle", "-o", "{output}"]))
            .option("suffix", ".min"),
        TaskSpec::new("libs", "copy")
            .inputs(["src/libs/**/*"])
            .output("libs", None)
            .group("assets")
            .allow_empty(),
        TaskSpec::new("img", "command")
            .inputs(["src/img/**/*.{jpg,jpeg,png,gif,webp}"])
            .output("img", None)
            .group("assets")
            .allow_empty()
            .option("program", "npx")
            .option("args", strings(&["imagemin", "{input}"]))
            .option("stdout", true),
        TaskSpec::new("svg", "command")
            .inputs(["src/svg/*.svg"])
            .output("", Some("sprite.svg"))
            .group("assets")
            .allow_empty()
            .option("program", "npx")
            .option(
                "args",
                strings(&[
                    "svg-sprite",
                    "--stack",
                    "--stack-dest={output_dir}",
                    "--stack-sprite={output_name}",
                    "{inputs}",
                ]),
            )
            .option("per_file", false)
            .option("output_file", "sprite.svg"),
        TaskSpec::new("fonts-woff", "command")
            .inputs(["src/fonts/*.{ttf,otf}"])
            .output("fonts", Some("*.woff"))
            .group("fonts")
            .allow_empty()
            .option("program", "npx")
            .option("args", strings(&["ttf2woff", "{input}", "{output}"]))
            .option("extension", "woff"),
        TaskSpec::new("fonts-woff2", "command")
            .inputs(["src/fonts/*.{ttf,otf}"])
            .output("fonts", Some("*.woff2"))
            .group("fonts")
            .allow_empty()
            .option("program", "npx")
            .option("args", strings(&["ttf2woff2"]))
            .option("stdin", true)
            .option("stdout", true)
            .option("extension", "woff2"),
        TaskSpec::new("font-manifest", "font-manifest")
            .inputs(["*.woff2", "*.woff"])
            .reads_output_of("fonts-woff2")
            .after(["fonts-woff"])
            .output("src/scss", Some("_fonts.scss"))
            .output_root(OutputRoot::Project)
            .group("fonts")
            .allow_empty()
            .option("file", "_fonts.scss")
            .option("url_prefix", "../fonts/"),
    ]
}

fn default_bindings() -> Vec<WatchBindingSpec> {
    vec![
        WatchBindingSpec::new("src/libs/**/*", &["libs"]),
        WatchBindingSpec::new("src/*.html", &["html"]),
        WatchBindingSpec::new("src/fonts/*", &["fonts-woff", "fonts-woff2", "font-manifest"]),
        WatchBindingSpec::new("src/scss/**/*.scss", &["style"]),
        WatchBindingSpec::new("src/js/**/*.js", &["js"]),
        WatchBindingSpec::new("src/img/**/*", &["img"]),
        WatchBindingSpec::new("src/svg/*.svg", &["svg"]),
    ]
}

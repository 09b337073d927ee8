//! Provider that delegates each step to an external program.
//!
//! Points are exchanged as text, one `x y z` line per point. For every call
//! the provider creates a scratch directory, writes `points_in.txt`, runs the
//! configured program with placeholders substituted, and reads
//! `points_out.txt` back:
//!
//! | Placeholder | Value |
//! |---|---|
//! | `{input}` | path of the input points file |
//! | `{output}` | path the program must write |
//! | `{source}` / `{target}` | step endpoints |
//! | `{region}` | `primary` or `secondary` |
//!
//! Registration engines driven this way usually keep process-wide state, so
//! the provider reports itself as not thread-safe unless configured otherwise.

use super::{TransformError, TransformProvider};
use crate::route::ChainStep;
use crate::types::Point;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::process::Command;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CommandConfig {
    pub program: String,
    pub args: Vec<String>,
    pub thread_safe: bool,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            program: "Rscript".into(),
            args: vec![
                "transform_points.R".into(),
                "{input}".into(),
                "{output}".into(),
                "{source}".into(),
                "{target}".into(),
                "{region}".into(),
            ],
            thread_safe: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandProvider {
    config: CommandConfig,
}

impl CommandProvider {
    pub fn new(config: CommandConfig) -> Self {
        Self { config }
    }

    fn fail(step: &ChainStep, reason: impl Into<String>) -> TransformError {
        TransformError::Failed {
            step: step.clone(),
            reason: reason.into(),
        }
    }
}

impl TransformProvider for CommandProvider {
    fn apply(&self, points: &[Point], step: &ChainStep) -> Result<Vec<Point>, TransformError> {
        let scratch = tempfile::tempdir().map_err(|e| Self::fail(step, e.to_string()))?;
        let input = scratch.path().join("points_in.txt");
        let output = scratch.path().join("points_out.txt");
        std::fs::write(&input, format_points(points)).map_err(|e| Self::fail(step, e.to_string()))?;

        let input_str = input.to_string_lossy();
        let output_str = output.to_string_lossy();
        let region = step.region.as_str();
        let args: Vec<String> = self
            .config
            .args
            .iter()
            .map(|a| {
                a.replace("{input}", &input_str)
                    .replace("{output}", &output_str)
                    .replace("{source}", &step.source)
                    .replace("{target}", &step.target)
                    .replace("{region}", region)
            })
            .collect();

        tracing::debug!(program = %self.config.program, %step, points = points.len(), "running transform command");
        let result = Command::new(&self.config.program)
            .args(&args)
            .output()
            .map_err(|e| Self::fail(step, format!("could not run {}: {e}", self.config.program)))?;
        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            let last = stderr.lines().last().unwrap_or("").trim();
            return Err(Self::fail(step, format!("{} exited with {}: {last}", self.config.program, result.status)));
        }

        let text = std::fs::read_to_string(&output)
            .map_err(|e| Self::fail(step, format!("no output points: {e}")))?;
        parse_points(&text).map_err(|reason| Self::fail(step, reason))
    }

    fn is_thread_safe(&self) -> bool {
        self.config.thread_safe
    }
}

fn format_points(points: &[Point]) -> String {
    let mut out = String::with_capacity(points.len() * 32);
    for p in points {
        // Writing to a String cannot fail.
        let _ = writeln!(out, "{} {} {}", p[0], p[1], p[2]);
    }
    out
}

fn parse_points(text: &str) -> Result<Vec<Point>, String> {
    text.lines()
        .enumerate()
        .filter(|(_, l)| !l.trim().is_empty())
        .map(|(i, line)| {
            let coords: Vec<f64> = line
                .split(|c: char| c.is_whitespace() || c == ',')
                .filter(|f| !f.is_empty())
                .map(str::parse)
                .collect::<Result<_, _>>()
                .map_err(|e| format!("output line {}: {e}", i + 1))?;
            match coords[..] {
                [x, y, z] => Ok([x, y, z]),
                _ => Err(format!("output line {}: expected 3 values", i + 1)),
            }
        })
        .collect()
}

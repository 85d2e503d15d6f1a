//! Workspace validation: test-case discovery, tag filtering, and the
//! referenced-flow dependency walk.
//!
//! Discovery obeys the workspace `flows` patterns: `"*"` (the default)
//! takes top-level files only, `"**"` walks recursively, `"prefix/*"`
//! takes files in `prefix/` plus files directly inside its immediate
//! subdirectories, anything else is a standard glob. `config.yaml` and
//! `config.yml` are never test cases.
//!
//! Every flow referenced through `runFlow`, `retry.file` or a lifecycle
//! hook is parsed exactly once per run; a file reachable from itself is a
//! circular dependency and reports the full cycle.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::config::{ConfigError, WorkspaceConfig};
use crate::flow::{parse_flow_file, Flow};
use crate::step::Step;

/// Errors surfaced by workspace validation.
#[derive(Error, Debug)]
pub enum ValidationError {
    /// A flow file failed to parse.
    #[error("Failed to parse {}: {message}", .path.display())]
    Parse { path: PathBuf, message: String },

    /// A referenced flow file does not exist.
    #[error("Missing flow {} (referenced from {})", .path.display(), .referenced_from.display())]
    MissingFlow {
        path: PathBuf,
        referenced_from: PathBuf,
    },

    /// A flow is reachable from itself.
    #[error("circular dependency detected: {}", .cycle.join(" -> "))]
    CircularDependency { cycle: Vec<String> },

    /// The workspace config could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of validating a workspace: the runnable test cases plus every
/// error found along the way.
#[derive(Debug)]
pub struct ValidationReport {
    pub test_cases: Vec<Flow>,
    pub errors: Vec<ValidationError>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Validates a workspace path (a flow file or a directory of flows).
///
/// CLI tag filters are unioned with the workspace config's.
pub fn validate_workspace(
    path: &Path,
    cli_include_tags: &[String],
    cli_exclude_tags: &[String],
) -> Result<ValidationReport, ValidationError> {
    let (workspace_dir, files) = if path.is_dir() {
        let config = WorkspaceConfig::load(path)?;
        let files = discover_test_files(path, &config.flow_patterns())?;
        (path.to_path_buf(), (config, files))
    } else {
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        let config = WorkspaceConfig::load(&dir)?;
        (dir, (config, vec![path.to_path_buf()]))
    };
    let (config, files) = files;

    let include = union_tags(cli_include_tags, &config.include_tags);
    let exclude = union_tags(cli_exclude_tags, &config.exclude_tags);
    debug!(
        workspace = %workspace_dir.display(),
        files = files.len(),
        "validating workspace"
    );

    let mut report = ValidationReport {
        test_cases: Vec::new(),
        errors: Vec::new(),
    };
    // Flows parsed so far, by canonical path; referenced files are parsed
    // exactly once across the whole run.
    let mut parsed: HashMap<PathBuf, Option<Flow>> = HashMap::new();
    // A cycle is reported once, not once per rotation.
    let mut seen_cycles: HashSet<Vec<PathBuf>> = HashSet::new();

    for file in files {
        let canonical = match file.canonicalize() {
            Ok(c) => c,
            Err(e) => {
                report.errors.push(ValidationError::Parse {
                    path: file,
                    message: e.to_string(),
                });
                continue;
            }
        };
        let mut stack = Vec::new();
        visit(
            &canonical,
            &mut stack,
            &mut parsed,
            &mut seen_cycles,
            &mut report.errors,
        );

        if let Some(Some(flow)) = parsed.get(&canonical) {
            if passes_tags(&flow.config.tags, &include, &exclude) {
                report.test_cases.push(flow.clone());
            }
        }
    }
    Ok(report)
}

fn visit(
    path: &Path,
    stack: &mut Vec<PathBuf>,
    parsed: &mut HashMap<PathBuf, Option<Flow>>,
    seen_cycles: &mut HashSet<Vec<PathBuf>>,
    errors: &mut Vec<ValidationError>,
) {
    if let Some(position) = stack.iter().position(|p| p == path) {
        let mut members: Vec<PathBuf> = stack[position..].to_vec();
        members.sort();
        if seen_cycles.insert(members) {
            let mut cycle: Vec<String> = stack[position..]
                .iter()
                .map(|p| display_name(p))
                .collect();
            cycle.push(display_name(path));
            errors.push(ValidationError::CircularDependency { cycle });
        }
        return;
    }
    let first_visit = !parsed.contains_key(path);
    if first_visit {
        match parse_flow_file(path) {
            Ok(flow) => {
                parsed.insert(path.to_path_buf(), Some(flow));
            }
            Err(e) => {
                parsed.insert(path.to_path_buf(), None);
                errors.push(ValidationError::Parse {
                    path: path.to_path_buf(),
                    message: e.to_string(),
                });
                return;
            }
        }
    }
    let Some(Some(flow)) = parsed.get(path) else {
        return;
    };

    let mut references = Vec::new();
    collect_references(&flow.steps, &mut references);
    collect_references(&flow.config.on_flow_start, &mut references);
    collect_references(&flow.config.on_flow_complete, &mut references);
    if references.is_empty() {
        return;
    }

    let base_dir = path.parent().map(|p| p.to_path_buf()).unwrap_or_default();
    stack.push(path.to_path_buf());
    let mut seen_here = HashSet::new();
    for reference in references {
        let target = base_dir.join(&reference);
        let canonical = match target.canonicalize() {
            Ok(c) => c,
            Err(_) => {
                errors.push(ValidationError::MissingFlow {
                    path: target,
                    referenced_from: path.to_path_buf(),
                });
                continue;
            }
        };
        if seen_here.insert(canonical.clone()) {
            visit(&canonical, stack, parsed, seen_cycles, errors);
        }
    }
    stack.pop();
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

/// Gathers every flow file referenced by a step list, nested control flow
/// included.
pub fn collect_references(steps: &[Step], out: &mut Vec<String>) {
    for step in steps {
        match step {
            Step::RunFlow { file, commands, .. } => {
                if let Some(file) = file {
                    out.push(file.clone());
                }
                collect_references(commands, out);
            }
            Step::Retry { file, commands, .. } => {
                if let Some(file) = file {
                    out.push(file.clone());
                }
                collect_references(commands, out);
            }
            Step::Repeat { commands, .. } => collect_references(commands, out),
            _ => {}
        }
    }
}

/// Include tags must intersect when set; exclude tags must not.
pub fn passes_tags(tags: &[String], include: &[String], exclude: &[String]) -> bool {
    if !include.is_empty() && !tags.iter().any(|t| include.contains(t)) {
        return false;
    }
    !tags.iter().any(|t| exclude.contains(t))
}

fn union_tags(a: &[String], b: &[String]) -> Vec<String> {
    let mut out: Vec<String> = a.to_vec();
    for tag in b {
        if !out.contains(tag) {
            out.push(tag.clone());
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

/// Collects test-case files under a workspace directory per the `flows`
/// patterns.
pub fn discover_test_files(
    dir: &Path,
    patterns: &[String],
) -> Result<Vec<PathBuf>, ValidationError> {
    let mut found = BTreeSet::new();
    for pattern in patterns {
        match pattern.as_str() {
            "*" => {
                collect_dir_files(dir, &mut found)?;
            }
            "**" => {
                collect_recursive(dir, &mut found)?;
            }
            p if p.ends_with("/*") => {
                // An explicit sub-path pattern also takes files one level
                // below the named prefix.
                let prefix = dir.join(&p[..p.len() - 2]);
                if prefix.is_dir() {
                    collect_dir_files(&prefix, &mut found)?;
                    for entry in std::fs::read_dir(&prefix)? {
                        let entry = entry?;
                        if entry.path().is_dir() {
                            collect_dir_files(&entry.path(), &mut found)?;
                        }
                    }
                }
            }
            p => {
                let full = dir.join(p);
                if let Ok(paths) = glob::glob(&full.to_string_lossy()) {
                    for path in paths.flatten() {
                        if path.is_file() && is_flow_file(&path) {
                            found.insert(path);
                        }
                    }
                }
            }
        }
    }
    Ok(found.into_iter().collect())
}

fn collect_dir_files(dir: &Path, out: &mut BTreeSet<PathBuf>) -> Result<(), ValidationError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && is_flow_file(&path) {
            out.insert(path);
        }
    }
    Ok(())
}

fn collect_recursive(dir: &Path, out: &mut BTreeSet<PathBuf>) -> Result<(), ValidationError> {
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in std::fs::read_dir(&current)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else if is_flow_file(&path) {
                out.insert(path);
            }
        }
    }
    Ok(())
}

fn is_flow_file(path: &Path) -> bool {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return false;
    };
    if !matches!(ext, "yaml" | "yml") {
        return false;
    }
    !matches!(
        path.file_name().and_then(|n| n.to_str()),
        Some("config.yaml") | Some("config.yml")
    )
}

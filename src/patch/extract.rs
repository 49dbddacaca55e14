//! Patch extraction from raw model text.

use crate::registry::PatchFormat;

use super::{FileReplacement, Patch};

/// A fenced code block.
struct Fence<'a> {
    lang: &'a str,
    lines: Vec<&'a str>,
}

/// Extracts the change in the task's declared format, falling back to the
/// other format when the model ignored the instructions.
pub fn extract(response: &str, format: PatchFormat) -> Option<Patch> {
    match format {
        PatchFormat::FullFile => extract_files(response).or_else(|| extract_diff(response)),
        PatchFormat::Diff => extract_diff(response).or_else(|| extract_files(response)),
    }
}

/// Collects fenced blocks tagged with a `filepath:` comment in their first
/// three lines. A later block for the same path replaces an earlier one.
pub fn extract_files(response: &str) -> Option<Patch> {
    let mut files: Vec<FileReplacement> = Vec::new();

    for fence in fences(response) {
        let Some((index, path)) = fence
            .lines
            .iter()
            .take(3)
            .enumerate()
            .find_map(|(i, line)| filepath_comment(line).map(|p| (i, p)))
        else {
            continue;
        };

        let code: Vec<&str> = fence
            .lines
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != index)
            .map(|(_, line)| *line)
            .collect();
        let content = code.join("\n");
        let content = content.trim_matches('\n');
        if content.trim().is_empty() {
            continue;
        }

        let replacement = FileReplacement {
            path: normalize(path),
            content: format!("{}\n", content),
        };
        match files.iter_mut().find(|f| f.path == replacement.path) {
            Some(existing) => *existing = replacement,
            None => files.push(replacement),
        }
    }

    if files.is_empty() {
        None
    } else {
        Some(Patch::Files(files))
    }
}

/// Collects ```diff / ```patch blocks, or an unfenced diff starting at the
/// first `--- ` header.
pub fn extract_diff(response: &str) -> Option<Patch> {
    let fenced: Vec<String> = fences(response)
        .into_iter()
        .filter(|f| matches!(f.lang, "diff" | "patch"))
        .map(|f| f.lines.join("\n"))
        .collect();

    let diff = if fenced.is_empty() {
        let lines: Vec<&str> = response.lines().collect();
        let start = lines
            .iter()
            .position(|l| l.starts_with("--- "))?;
        lines[start..]
            .iter()
            .take_while(|l| !l.trim_start().starts_with("```"))
            .copied()
            .collect::<Vec<_>>()
            .join("\n")
    } else {
        fenced.join("\n")
    };

    let well_formed = diff.lines().any(|l| l.starts_with("+++ "))
        && diff.lines().any(|l| l.starts_with("@@"));
    if well_formed {
        Some(Patch::Diff(format!("{}\n", diff.trim_end())))
    } else {
        None
    }
}

/// Target paths of a unified diff, without `a/`/`b/` prefixes.
pub(super) fn diff_paths(diff: &str) -> Vec<String> {
    let mut paths: Vec<String> = Vec::new();
    let mut last_old: Option<String> = None;

    for line in diff.lines() {
        if let Some(old) = line.strip_prefix("--- ") {
            last_old = header_path(old, "a/");
        } else if let Some(new) = line.strip_prefix("+++ ") {
            // Deleted files only name the old path.
            if let Some(path) = header_path(new, "b/").or_else(|| last_old.take()) {
                if !paths.contains(&path) {
                    paths.push(path);
                }
            }
        }
    }

    paths
}

fn header_path(header: &str, prefix: &str) -> Option<String> {
    let path = header.split('\t').next()?.trim();
    if path == "/dev/null" || path.is_empty() {
        return None;
    }
    Some(path.strip_prefix(prefix).unwrap_or(path).to_string())
}

fn fences(response: &str) -> Vec<Fence<'_>> {
    let mut fences = Vec::new();
    let mut current: Option<Fence<'_>> = None;

    for line in response.lines() {
        let trimmed = line.trim_start();
        match current.take() {
            None => {
                if let Some(lang) = trimmed.strip_prefix("```") {
                    current = Some(Fence {
                        lang: lang.trim(),
                        lines: Vec::new(),
                    });
                }
            }
            Some(mut fence) => {
                if trimmed.trim_end() == "```" {
                    fences.push(fence);
                } else {
                    fence.lines.push(line);
                    current = Some(fence);
                }
            }
        }
    }

    fences
}

/// Parses `# filepath: x`, `// filepath: x` or `/* filepath: x */`.
fn filepath_comment(line: &str) -> Option<&str> {
    let line = line.trim();
    let rest = ["#", "//", "/*"]
        .iter()
        .find_map(|prefix| line.strip_prefix(prefix))?
        .trim_start();

    if !rest.get(..9)?.eq_ignore_ascii_case("filepath:") {
        return None;
    }
    let path = rest[9..].trim();
    let path = path.strip_suffix("*/").unwrap_or(path).trim();
    if path.is_empty() {
        None
    } else {
        Some(path)
    }
}

fn normalize(path: &str) -> String {
    let path = path.replace('\\', "/");
    path.strip_prefix("./").map(str::to_string).unwrap_or(path)
}

use anyhow::{Context, Result};
use calsync_core::Task;
use futures::stream::{self, StreamExt};
use std::path::{Path, PathBuf};

const MAX_CONCURRENT_FILE_READS: usize = 16;

/// Stands in for the excluded host document store (SPEC_FULL.md Non-goals):
/// walks a directory tree for markdown files and parses every checkbox line
/// into a `Task`, concurrently across files (spec.md §4.1).
pub async fn scan_vault(root: &Path) -> Result<Vec<Task>> {
    let files = collect_markdown_files(root)?;

    let tasks = stream::iter(files)
        .map(|path| async move { parse_file(&path).await })
        .buffer_unordered(MAX_CONCURRENT_FILE_READS)
        .collect::<Vec<_>>()
        .await;

    let mut out = Vec::new();
    for result in tasks {
        out.extend(result?);
    }
    Ok(out)
}

fn collect_markdown_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let entries = std::fs::read_dir(&dir)
            .with_context(|| format!("reading vault directory {}", dir.display()))?;
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                if path.file_name().and_then(|n| n.to_str()).map(|n| n.starts_with('.')).unwrap_or(false) {
                    continue;
                }
                stack.push(path);
            } else if path.extension().and_then(|e| e.to_str()) == Some("md") {
                out.push(path);
            }
        }
    }

    Ok(out)
}

async fn parse_file(path: &Path) -> Result<Vec<Task>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let source_path = path.to_string_lossy().to_string();

    let mut tasks = Vec::new();
    let mut in_fenced_block = false;

    for (index, line) in content.lines().enumerate() {
        if line.trim_start().starts_with("```") {
            in_fenced_block = !in_fenced_block;
            continue;
        }
        if in_fenced_block {
            continue;
        }
        if let Some(task) = calsync_parser::parse_line(line, &source_path, index + 1) {
            tasks.push(task);
        }
    }

    Ok(tasks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scans_nested_markdown_files_and_skips_fenced_code() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("tasks.md"),
            "- [ ] Buy milk 🛫 2025-01-10 📅 2025-01-11\n```\n- [ ] not a real task\n```\n",
        )
        .expect("write file");

        let nested = dir.path().join("nested");
        std::fs::create_dir(&nested).expect("mkdir");
        std::fs::write(nested.join("more.md"), "- [x] Already done\n").expect("write nested file");

        let tasks = scan_vault(dir.path()).await.expect("scans vault");
        assert_eq!(tasks.len(), 2);
    }
}

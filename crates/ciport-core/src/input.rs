use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::types::RepoRef;

/// Load the repository list from a CSV or JSON file. JSON may be an array
/// of URL strings or of `{repo_url|url, target_branch}` objects; CSV wants
/// a `repo_url` / `url` / `repo` column with an optional `target_branch`.
/// Anything without a `.json` extension is treated as CSV.
pub fn load_repos(path: &str, default_branch: &str) -> Result<Vec<RepoRef>> {
    let p = Path::new(path);
    if !p.exists() {
        bail!("input file not found: {path}");
    }
    let is_json = p
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if is_json {
        load_json(p, default_branch)
    } else {
        load_csv(p, default_branch)
    }
}

fn load_json(path: &Path, default_branch: &str) -> Result<Vec<RepoRef>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("read {}", path.display()))?;
    let data: serde_json::Value =
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    let Some(items) = data.as_array() else {
        bail!("JSON input must be an array of strings or objects");
    };

    let mut repos = Vec::new();
    for item in items {
        if let Some(url) = item.as_str() {
            let url = url.trim();
            if !url.is_empty() {
                repos.push(RepoRef::new(url, default_branch));
            }
        } else if let Some(obj) = item.as_object() {
            let url = obj
                .get("repo_url")
                .or_else(|| obj.get("url"))
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .trim();
            if url.is_empty() {
                continue;
            }
            let branch = obj
                .get("target_branch")
                .and_then(|v| v.as_str())
                .filter(|b| !b.is_empty())
                .unwrap_or(default_branch);
            repos.push(RepoRef::new(url, branch));
        }
    }
    Ok(repos)
}

fn load_csv(path: &Path, default_branch: &str) -> Result<Vec<RepoRef>> {
    let mut reader =
        csv::Reader::from_path(path).with_context(|| format!("open {}", path.display()))?;
    let headers = reader.headers()?.clone();

    let url_idx = ["repo_url", "url", "repo"]
        .iter()
        .find_map(|name| headers.iter().position(|h| h == *name))
        .with_context(|| "input CSV needs a repo_url, url, or repo column")?;
    let branch_idx = headers.iter().position(|h| h == "target_branch");

    let mut repos = Vec::new();
    for record in reader.records() {
        let record = record?;
        let url = record.get(url_idx).unwrap_or_default().trim();
        if url.is_empty() {
            continue;
        }
        let branch = branch_idx
            .and_then(|i| record.get(i))
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .unwrap_or(default_branch);
        repos.push(RepoRef::new(url, branch));
    }
    Ok(repos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &tempfile::TempDir, name: &str, contents: &str) -> String {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn csv_with_repo_url_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            &dir,
            "repos.csv",
            "repo_url,target_branch\nhttps://github.com/a/b,develop\nhttps://github.com/c/d,\n",
        );
        let repos = load_repos(&path, "main").unwrap();
        assert_eq!(repos.len(), 2);
        assert_eq!(repos[0].target_branch, "develop");
        assert_eq!(repos[1].target_branch, "main");
    }

    #[test]
    fn csv_accepts_alternate_url_headers() {
        let dir = tempfile::tempdir().unwrap();
        for header in ["url", "repo"] {
            let path = write_file(
                &dir,
                &format!("{header}.csv"),
                &format!("{header}\nhttps://github.com/a/b\n"),
            );
            let repos = load_repos(&path, "main").unwrap();
            assert_eq!(repos.len(), 1);
            assert_eq!(repos[0].url, "https://github.com/a/b");
        }
    }

    #[test]
    fn csv_without_url_column_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "bad.csv", "name\nfoo\n");
        assert!(load_repos(&path, "main").is_err());
    }

    #[test]
    fn json_array_of_strings() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            &dir,
            "repos.json",
            r#"["https://github.com/a/b", "  ", "https://github.com/c/d"]"#,
        );
        let repos = load_repos(&path, "main").unwrap();
        assert_eq!(repos.len(), 2);
        assert_eq!(repos[1].url, "https://github.com/c/d");
    }

    #[test]
    fn json_array_of_objects() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            &dir,
            "repos.json",
            r#"[{"repo_url": "https://github.com/a/b", "target_branch": "master"},
                {"url": "https://github.com/c/d"},
                {"note": "no url here"}]"#,
        );
        let repos = load_repos(&path, "main").unwrap();
        assert_eq!(repos.len(), 2);
        assert_eq!(repos[0].target_branch, "master");
        assert_eq!(repos[1].target_branch, "main");
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(load_repos("/nonexistent/repos.csv", "main").is_err());
    }
}

//! Read-only repository inspection.
//!
//! [`RepositoryInspector`] is the contract the tool registry executes against.
//! [`GitInspector`] implements it over a local git checkout, pinned to the
//! commit its reference resolved to when it was opened, so every read in a
//! session sees the same snapshot. git2 handles are not `Sync`; each operation
//! opens the repository inside `spawn_blocking` instead of sharing one.

use crate::error::InspectError;
use crate::models::{CommitAuthor, CommitInfo};
use crate::repo::cache::{CacheKey, ContentCache};
use crate::repo::code::{self, FunctionInfo, Language};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use git2::{
    BlameOptions, Commit, Delta, DiffFormat, ErrorCode, ObjectType, Oid, Patch, Repository, Sort,
    Tree, TreeWalkMode, TreeWalkResult,
};
use regex::RegexBuilder;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

const MAX_TREE_NODES: usize = 500;
const MAX_SEARCH_BLOB_BYTES: usize = 1 << 20;
const MAX_FILE_MATCHES: usize = 50;
const MAX_IMPORTERS: usize = 50;
const MAX_PATCH_BYTES: usize = 8_000;
const MAX_ORIGIN_VERSIONS: usize = 200;
const HIT_PREVIEW_CHARS: usize = 200;
const CONTEXT_LINES: usize = 2;

/// Inclusive, 1-indexed line range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LineRange {
    pub start: usize,
    pub end: usize,
}

impl LineRange {
    pub fn new(start: usize, end: usize) -> Result<Self, InspectError> {
        if start == 0 {
            return Err(InspectError::InvalidArgument(
                "line numbers start at 1".to_string(),
            ));
        }
        if end < start {
            return Err(InspectError::InvalidArgument(format!(
                "end line {} is before start line {}",
                end, start
            )));
        }
        Ok(Self { start, end })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
    Submodule,
}

#[derive(Debug, Clone, Serialize)]
pub struct TreeNode {
    pub name: String,
    pub path: String,
    pub kind: EntryKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TreeNode>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RepoTree {
    pub root: String,
    pub nodes: Vec<TreeNode>,
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LineHit {
    pub line_number: usize,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CodeMatch {
    pub path: String,
    pub score: usize,
    pub name_match: bool,
    pub lines: Vec<LineHit>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileContent {
    pub path: String,
    pub total_lines: usize,
    pub start_line: usize,
    pub end_line: usize,
    pub content: String,
    pub truncated: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DirEntry {
    pub name: String,
    pub path: String,
    pub kind: EntryKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommitSummary {
    pub commit_id: String,
    pub short_id: String,
    pub author: CommitAuthor,
    pub date: DateTime<Utc>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BlameLine {
    pub line_number: usize,
    pub content: String,
    pub commit_id: String,
    pub author: CommitAuthor,
    pub date: DateTime<Utc>,
    pub summary: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChangedFile {
    pub path: String,
    pub status: &'static str,
    pub additions: usize,
    pub deletions: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommitDetail {
    #[serde(flatten)]
    pub summary: CommitSummary,
    pub full_message: String,
    pub files: Vec<ChangedFile>,
    pub additions: usize,
    pub deletions: usize,
    pub patch: String,
    pub patch_truncated: bool,
}

impl CommitDetail {
    pub fn to_commit_info(&self) -> CommitInfo {
        CommitInfo {
            commit_id: self.summary.commit_id.clone(),
            short_id: self.summary.short_id.clone(),
            author: self.summary.author.clone(),
            date: self.summary.date,
            message: self.full_message.trim().to_string(),
            url: self.summary.url.clone(),
            files_changed: self.files.iter().map(|f| f.path.clone()).collect(),
            additions: self.additions,
            deletions: self.deletions,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Dependencies {
    pub path: String,
    pub language: Language,
    pub imports: Vec<String>,
    pub imported_by: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileMatch {
    pub line_number: usize,
    pub line: String,
    pub before: Vec<String>,
    pub after: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileSearch {
    pub path: String,
    pub pattern: String,
    /// False when the pattern was not a valid regex and was matched literally.
    pub regex: bool,
    pub total_matches: usize,
    pub matches: Vec<FileMatch>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LineOrigin {
    pub path: String,
    pub line_number: usize,
    pub line_content: String,
    pub introduced_by: CommitSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified_by: Option<CommitSummary>,
}

/// The read-only repository operations available to the agents.
#[async_trait]
pub trait RepositoryInspector: Send + Sync {
    /// Directory tree down to `max_depth` levels below `path`.
    async fn repository_structure(
        &self,
        max_depth: usize,
        path: &str,
    ) -> Result<RepoTree, InspectError>;

    /// Files whose name or content mentions `keyword`, best matches first.
    async fn search_code(
        &self,
        keyword: &str,
        path_filter: Option<&str>,
        max_results: usize,
    ) -> Result<Vec<CodeMatch>, InspectError>;

    async fn file_content(
        &self,
        path: &str,
        range: Option<LineRange>,
    ) -> Result<FileContent, InspectError>;

    async fn directory_files(&self, path: &str) -> Result<Vec<DirEntry>, InspectError>;

    /// Commits that changed `path`, newest first.
    async fn file_history(
        &self,
        path: &str,
        max_entries: usize,
    ) -> Result<Vec<CommitSummary>, InspectError>;

    async fn file_blame(
        &self,
        path: &str,
        range: Option<LineRange>,
    ) -> Result<Vec<BlameLine>, InspectError>;

    async fn commit_details(&self, id: &str) -> Result<CommitDetail, InspectError>;

    async fn file_dependencies(&self, path: &str) -> Result<Dependencies, InspectError>;

    async fn search_in_file(&self, path: &str, pattern: &str) -> Result<FileSearch, InspectError>;

    /// The commit that introduced the text currently on `line`.
    async fn line_origin(&self, path: &str, line: usize) -> Result<LineOrigin, InspectError>;

    async fn recent_commits(&self, max_count: usize) -> Result<Vec<CommitSummary>, InspectError>;

    async fn analyze_function(&self, path: &str, name: &str)
        -> Result<FunctionInfo, InspectError>;
}

/// Everything a blocking worker needs to read the pinned snapshot.
#[derive(Debug, Clone)]
struct Snapshot {
    root: PathBuf,
    commit: Oid,
    cache: Arc<ContentCache>,
    max_file_bytes: usize,
    web_url: Option<String>,
}

/// [`RepositoryInspector`] over a local git repository.
#[derive(Debug, Clone)]
pub struct GitInspector {
    reference: String,
    snapshot: Snapshot,
}

impl GitInspector {
    /// Open the repository at `root` and pin `reference` (branch, tag or id).
    pub fn open(
        root: &Path,
        reference: &str,
        cache: Arc<ContentCache>,
        max_file_bytes: usize,
    ) -> Result<Self, InspectError> {
        let repo = Repository::open(root)?;
        let commit = repo.revparse_single(reference)?.peel_to_commit()?.id();
        let web_url = repo
            .find_remote("origin")
            .ok()
            .and_then(|remote| remote.url().and_then(crate::repo::cloner::github_web_url));

        debug!("Pinned {} at {}", reference, commit);
        Ok(Self {
            reference: reference.to_string(),
            snapshot: Snapshot {
                root: root.to_path_buf(),
                commit,
                cache,
                max_file_bytes,
                web_url,
            },
        })
    }

    pub fn reference(&self) -> &str {
        &self.reference
    }

    pub fn commit_id(&self) -> String {
        self.snapshot.commit.to_string()
    }

    async fn run<T, F>(&self, op: &'static str, f: F) -> Result<T, InspectError>
    where
        T: Send + 'static,
        F: FnOnce(&Snapshot, &Repository) -> Result<T, InspectError> + Send + 'static,
    {
        let snapshot = self.snapshot.clone();
        tokio::task::spawn_blocking(move || {
            let repo = Repository::open(&snapshot.root)?;
            f(&snapshot, &repo)
        })
        .await
        .map_err(|e| InspectError::Worker(format!("{}: {}", op, e)))?
    }
}

#[async_trait]
impl RepositoryInspector for GitInspector {
    async fn repository_structure(
        &self,
        max_depth: usize,
        path: &str,
    ) -> Result<RepoTree, InspectError> {
        let path = clean_path(path);
        let max_depth = max_depth.clamp(1, 10);
        self.run("repository_structure", move |snap, repo| {
            snap.structure(repo, &path, max_depth)
        })
        .await
    }

    async fn search_code(
        &self,
        keyword: &str,
        path_filter: Option<&str>,
        max_results: usize,
    ) -> Result<Vec<CodeMatch>, InspectError> {
        let keyword = keyword.trim().to_string();
        if keyword.is_empty() {
            return Err(InspectError::InvalidArgument(
                "search keyword is empty".to_string(),
            ));
        }
        let filter = path_filter.map(clean_path).filter(|f| !f.is_empty());
        let max_results = max_results.clamp(1, 100);
        self.run("search_code", move |snap, repo| {
            snap.search_code(repo, &keyword, filter.as_deref(), max_results)
        })
        .await
    }

    async fn file_content(
        &self,
        path: &str,
        range: Option<LineRange>,
    ) -> Result<FileContent, InspectError> {
        let path = clean_path(path);
        self.run("file_content", move |snap, repo| {
            snap.file_content(repo, &path, range)
        })
        .await
    }

    async fn directory_files(&self, path: &str) -> Result<Vec<DirEntry>, InspectError> {
        let path = clean_path(path);
        self.run("directory_files", move |snap, repo| {
            snap.directory_files(repo, &path)
        })
        .await
    }

    async fn file_history(
        &self,
        path: &str,
        max_entries: usize,
    ) -> Result<Vec<CommitSummary>, InspectError> {
        let path = clean_path(path);
        let max_entries = max_entries.clamp(1, 100);
        self.run("file_history", move |snap, repo| {
            let ids = snap.history(repo, &path, max_entries)?;
            if ids.is_empty() {
                snap.lookup(repo, &path)?;
            }
            ids.into_iter()
                .map(|id| -> Result<CommitSummary, InspectError> {
                    Ok(snap.summarize(&repo.find_commit(id)?))
                })
                .collect()
        })
        .await
    }

    async fn file_blame(
        &self,
        path: &str,
        range: Option<LineRange>,
    ) -> Result<Vec<BlameLine>, InspectError> {
        let path = clean_path(path);
        self.run("file_blame", move |snap, repo| snap.blame(repo, &path, range))
            .await
    }

    async fn commit_details(&self, id: &str) -> Result<CommitDetail, InspectError> {
        let id = id.trim().to_string();
        if id.is_empty() {
            return Err(InspectError::InvalidArgument(
                "commit id is empty".to_string(),
            ));
        }
        self.run("commit_details", move |snap, repo| {
            snap.commit_details(repo, &id)
        })
        .await
    }

    async fn file_dependencies(&self, path: &str) -> Result<Dependencies, InspectError> {
        let path = clean_path(path);
        self.run("file_dependencies", move |snap, repo| {
            snap.dependencies(repo, &path)
        })
        .await
    }

    async fn search_in_file(&self, path: &str, pattern: &str) -> Result<FileSearch, InspectError> {
        let path = clean_path(path);
        let pattern = pattern.to_string();
        if pattern.trim().is_empty() {
            return Err(InspectError::InvalidArgument(
                "search pattern is empty".to_string(),
            ));
        }
        self.run("search_in_file", move |snap, repo| {
            snap.search_in_file(repo, &path, &pattern)
        })
        .await
    }

    async fn line_origin(&self, path: &str, line: usize) -> Result<LineOrigin, InspectError> {
        let path = clean_path(path);
        self.run("line_origin", move |snap, repo| {
            snap.line_origin(repo, &path, line)
        })
        .await
    }

    async fn recent_commits(&self, max_count: usize) -> Result<Vec<CommitSummary>, InspectError> {
        let max_count = max_count.clamp(1, 100);
        self.run("recent_commits", move |snap, repo| {
            let mut walk = repo.revwalk()?;
            walk.push(snap.commit)?;
            walk.set_sorting(Sort::TIME)?;
            walk.take(max_count)
                .map(|id| -> Result<CommitSummary, InspectError> {
                    Ok(snap.summarize(&repo.find_commit(id?)?))
                })
                .collect()
        })
        .await
    }

    async fn analyze_function(
        &self,
        path: &str,
        name: &str,
    ) -> Result<FunctionInfo, InspectError> {
        let path = clean_path(path);
        let name = name.trim().to_string();
        self.run("analyze_function", move |snap, repo| {
            let text = snap.read_text(repo, &path)?;
            code::extract_function(&text, &name, &path)
                .ok_or(InspectError::FunctionNotFound { path, name })
        })
        .await
    }
}

impl Snapshot {
    fn tree<'r>(&self, repo: &'r Repository) -> Result<Tree<'r>, InspectError> {
        Ok(repo.find_commit(self.commit)?.tree()?)
    }

    fn lookup(&self, repo: &Repository, path: &str) -> Result<git2::TreeEntry<'static>, InspectError> {
        self.tree(repo)?
            .get_path(Path::new(path))
            .map_err(|e| not_found_or(e, || format!("'{}'", path)))
    }

    fn read_text(&self, repo: &Repository, path: &str) -> Result<Arc<str>, InspectError> {
        self.read_text_at(repo, self.commit, path)
    }

    /// File text at `commit`, through the shared cache.
    fn read_text_at(
        &self,
        repo: &Repository,
        commit: Oid,
        path: &str,
    ) -> Result<Arc<str>, InspectError> {
        let key = CacheKey::new(path, commit.to_string());
        self.cache.get_or_try_insert_with(key, || {
            let tree = repo.find_commit(commit)?.tree()?;
            let entry = tree
                .get_path(Path::new(path))
                .map_err(|e| not_found_or(e, || format!("file '{}'", path)))?;
            if entry.kind() != Some(ObjectType::Blob) {
                return Err(InspectError::InvalidArgument(format!(
                    "'{}' is a directory, not a file",
                    path
                )));
            }
            let blob = repo.find_blob(entry.id())?;
            if blob.is_binary() {
                return Err(InspectError::Binary(path.to_string()));
            }
            Ok(String::from_utf8_lossy(blob.content()).into_owned())
        })
    }

    fn summarize(&self, commit: &Commit<'_>) -> CommitSummary {
        let id = commit.id().to_string();
        let author = commit.author();
        CommitSummary {
            short_id: id.chars().take(7).collect(),
            author: CommitAuthor {
                name: author.name().unwrap_or("unknown").to_string(),
                email: author.email().unwrap_or("unknown").to_string(),
            },
            date: timestamp(commit.time().seconds()),
            message: commit.summary().unwrap_or_default().to_string(),
            url: self
                .web_url
                .as_ref()
                .map(|base| format!("{}/commit/{}", base, id)),
            commit_id: id,
        }
    }

    /// Blob paths under the pinned tree, with ids and sizes.
    fn blobs(&self, repo: &Repository) -> Result<Vec<(String, Oid)>, InspectError> {
        let tree = self.tree(repo)?;
        let mut blobs = Vec::new();
        tree.walk(TreeWalkMode::PreOrder, |dir, entry| {
            if entry.kind() == Some(ObjectType::Blob) {
                if let Some(name) = entry.name() {
                    blobs.push((format!("{}{}", dir, name), entry.id()));
                }
            }
            TreeWalkResult::Ok
        })?;
        Ok(blobs)
    }

    fn structure(
        &self,
        repo: &Repository,
        path: &str,
        max_depth: usize,
    ) -> Result<RepoTree, InspectError> {
        let root_tree = if path.is_empty() {
            self.tree(repo)?
        } else {
            match self.lookup(repo, path) {
                Ok(entry) if entry.kind() == Some(ObjectType::Tree) => repo.find_tree(entry.id())?,
                Ok(_) => return Ok(empty_tree(path, format!("'{}' is a file", path))),
                Err(InspectError::NotFound(_)) => {
                    return Ok(empty_tree(path, format!("path '{}' not found", path)))
                }
                Err(e) => return Err(e),
            }
        };

        let mut budget = MAX_TREE_NODES;
        let nodes = build_nodes(repo, &root_tree, path, 1, max_depth, &mut budget)?;
        Ok(RepoTree {
            root: if path.is_empty() { "/".to_string() } else { path.to_string() },
            nodes,
            truncated: budget == 0,
            note: None,
        })
    }

    fn search_code(
        &self,
        repo: &Repository,
        keyword: &str,
        filter: Option<&str>,
        max_results: usize,
    ) -> Result<Vec<CodeMatch>, InspectError> {
        let needle = keyword.to_lowercase();
        let mut found = Vec::new();

        for (path, id) in self.blobs(repo)? {
            if filter.is_some_and(|f| !path.contains(f)) {
                continue;
            }
            let blob = repo.find_blob(id)?;
            if blob.size() > MAX_SEARCH_BLOB_BYTES || blob.is_binary() {
                continue;
            }
            let text = String::from_utf8_lossy(blob.content());
            let hits: Vec<LineHit> = text
                .lines()
                .enumerate()
                .filter(|(_, line)| line.to_lowercase().contains(&needle))
                .map(|(idx, line)| LineHit {
                    line_number: idx + 1,
                    text: preview(line),
                })
                .collect();

            let file_name = path.rsplit('/').next().unwrap_or(&path).to_lowercase();
            let name_match = file_name.contains(&needle);
            if hits.is_empty() && !name_match {
                continue;
            }
            found.push(CodeMatch {
                score: hits.len() + if name_match { 5 } else { 0 },
                name_match,
                lines: hits.into_iter().take(3).collect(),
                path,
            });
        }

        found.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.path.cmp(&b.path)));
        found.truncate(max_results);
        Ok(found)
    }

    fn file_content(
        &self,
        repo: &Repository,
        path: &str,
        range: Option<LineRange>,
    ) -> Result<FileContent, InspectError> {
        let text = self.read_text(repo, path)?;
        let lines: Vec<&str> = text.lines().collect();
        let total_lines = lines.len();

        let (start, end, body) = match range {
            None => (1, total_lines, text.to_string()),
            Some(range) => {
                if range.start > total_lines.max(1) {
                    return Err(InspectError::InvalidArgument(format!(
                        "line {} is past the end of '{}' ({} lines)",
                        range.start, path, total_lines
                    )));
                }
                let end = range.end.min(total_lines);
                (range.start, end, lines[range.start - 1..end].join("\n"))
            }
        };

        let (content, truncated) = truncate_bytes(&body, self.max_file_bytes);
        Ok(FileContent {
            path: path.to_string(),
            total_lines,
            start_line: start,
            end_line: end,
            content: content.to_string(),
            truncated,
        })
    }

    fn directory_files(&self, repo: &Repository, path: &str) -> Result<Vec<DirEntry>, InspectError> {
        let tree = if path.is_empty() {
            self.tree(repo)?
        } else {
            let entry = self
                .tree(repo)?
                .get_path(Path::new(path))
                .map_err(|e| not_found_or(e, || format!("directory '{}'", path)))?;
            if entry.kind() != Some(ObjectType::Tree) {
                return Err(InspectError::InvalidArgument(format!(
                    "'{}' is a file, not a directory",
                    path
                )));
            }
            repo.find_tree(entry.id())?
        };

        let mut entries: Vec<DirEntry> = tree
            .iter()
            .filter_map(|entry| {
                let name = entry.name()?.to_string();
                let kind = entry_kind(entry.kind())?;
                let size = match kind {
                    EntryKind::File => repo.find_blob(entry.id()).ok().map(|b| b.size() as u64),
                    _ => None,
                };
                Some(DirEntry {
                    path: join_path(path, &name),
                    name,
                    kind,
                    size,
                })
            })
            .collect();
        entries.sort_by(|a, b| {
            (a.kind != EntryKind::Directory, &a.name).cmp(&(b.kind != EntryKind::Directory, &b.name))
        });
        Ok(entries)
    }

    /// Ids of commits reachable from the snapshot whose version of `path`
    /// differs from their first parent's, newest first.
    fn history(&self, repo: &Repository, path: &str, max: usize) -> Result<Vec<Oid>, InspectError> {
        let mut walk = repo.revwalk()?;
        walk.push(self.commit)?;
        walk.set_sorting(Sort::TIME)?;

        let mut changed = Vec::new();
        for id in walk {
            let commit = repo.find_commit(id?)?;
            let current = blob_id_at(&commit, path);
            if current.is_none() {
                continue;
            }
            let parent = commit.parent(0).ok().and_then(|p| blob_id_at(&p, path));
            if current != parent {
                changed.push(commit.id());
                if changed.len() >= max {
                    break;
                }
            }
        }
        Ok(changed)
    }

    fn blame(
        &self,
        repo: &Repository,
        path: &str,
        range: Option<LineRange>,
    ) -> Result<Vec<BlameLine>, InspectError> {
        let text = self.read_text(repo, path)?;
        let lines: Vec<&str> = text.lines().collect();
        if lines.is_empty() {
            return Ok(Vec::new());
        }
        let (start, end) = match range {
            Some(r) => (r.start.min(lines.len()), r.end.min(lines.len())),
            None => (1, lines.len()),
        };

        let mut opts = BlameOptions::new();
        opts.newest_commit(self.commit).min_line(start).max_line(end);
        let blame = repo.blame_file(Path::new(path), Some(&mut opts))?;

        let mut commits: HashMap<Oid, (DateTime<Utc>, String)> = HashMap::new();
        let mut out = Vec::with_capacity(end + 1 - start);
        for line_number in start..=end {
            let Some(hunk) = blame.get_line(line_number) else {
                continue;
            };
            let id = hunk.final_commit_id();
            let (date, summary) = match commits.get(&id) {
                Some(known) => known.clone(),
                None => {
                    let commit = repo.find_commit(id)?;
                    let entry = (
                        timestamp(commit.time().seconds()),
                        commit.summary().unwrap_or_default().to_string(),
                    );
                    commits.insert(id, entry.clone());
                    entry
                }
            };
            let signature = hunk.final_signature();
            out.push(BlameLine {
                line_number,
                content: lines[line_number - 1].to_string(),
                commit_id: id.to_string(),
                author: CommitAuthor {
                    name: signature.name().unwrap_or("unknown").to_string(),
                    email: signature.email().unwrap_or("unknown").to_string(),
                },
                date,
                summary,
            });
        }
        Ok(out)
    }

    fn commit_details(&self, repo: &Repository, id: &str) -> Result<CommitDetail, InspectError> {
        let commit = repo
            .revparse_single(id)
            .and_then(|object| object.peel_to_commit())
            .map_err(|e| not_found_or(e, || format!("commit '{}'", id)))?;
        let tree = commit.tree()?;
        let parent_tree = commit.parent(0).ok().map(|p| p.tree()).transpose()?;
        let diff = repo.diff_tree_to_tree(parent_tree.as_ref(), Some(&tree), None)?;

        let mut files = Vec::new();
        for (idx, delta) in diff.deltas().enumerate() {
            let path = delta
                .new_file()
                .path()
                .or_else(|| delta.old_file().path())
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default();
            let (additions, deletions) = match Patch::from_diff(&diff, idx)? {
                Some(patch) => {
                    let (_, adds, dels) = patch.line_stats()?;
                    (adds, dels)
                }
                None => (0, 0),
            };
            files.push(ChangedFile {
                path,
                status: delta_status(delta.status()),
                additions,
                deletions,
            });
        }

        let stats = diff.stats()?;
        let mut patch = String::new();
        let mut patch_truncated = false;
        diff.print(DiffFormat::Patch, |_, _, line| {
            if patch.len() >= MAX_PATCH_BYTES {
                patch_truncated = true;
                return true;
            }
            if matches!(line.origin(), '+' | '-' | ' ') {
                patch.push(line.origin());
            }
            patch.push_str(&String::from_utf8_lossy(line.content()));
            true
        })?;
        let (head, cut) = truncate_bytes(&patch, MAX_PATCH_BYTES);
        let patch = head.to_string();

        Ok(CommitDetail {
            summary: self.summarize(&commit),
            full_message: commit.message().unwrap_or_default().to_string(),
            files,
            additions: stats.insertions(),
            deletions: stats.deletions(),
            patch,
            patch_truncated: patch_truncated || cut,
        })
    }

    fn dependencies(&self, repo: &Repository, path: &str) -> Result<Dependencies, InspectError> {
        let text = self.read_text(repo, path)?;
        let language = Language::from_path(path);
        let imports = code::extract_imports(&text, path);

        let mut imported_by = Vec::new();
        if language != Language::Other {
            for (other, id) in self.blobs(repo)? {
                if other == path || Language::from_path(&other) != language {
                    continue;
                }
                let blob = repo.find_blob(id)?;
                if blob.size() > self.max_file_bytes || blob.is_binary() {
                    continue;
                }
                let source = String::from_utf8_lossy(blob.content());
                if code::extract_imports(&source, &other)
                    .iter()
                    .any(|import| code::import_refers_to(import, path))
                {
                    imported_by.push(other);
                    if imported_by.len() >= MAX_IMPORTERS {
                        break;
                    }
                }
            }
        }

        Ok(Dependencies {
            path: path.to_string(),
            language,
            imports,
            imported_by,
        })
    }

    fn search_in_file(
        &self,
        repo: &Repository,
        path: &str,
        pattern: &str,
    ) -> Result<FileSearch, InspectError> {
        let text = self.read_text(repo, path)?;
        let lines: Vec<&str> = text.lines().collect();

        let regex = RegexBuilder::new(pattern).case_insensitive(true).build().ok();
        let needle = pattern.to_lowercase();
        let is_match = |line: &str| match &regex {
            Some(re) => re.is_match(line),
            None => line.to_lowercase().contains(&needle),
        };

        let hits: Vec<usize> = (0..lines.len()).filter(|&i| is_match(lines[i])).collect();
        let matches = hits
            .iter()
            .take(MAX_FILE_MATCHES)
            .map(|&i| FileMatch {
                line_number: i + 1,
                line: lines[i].to_string(),
                before: lines[i.saturating_sub(CONTEXT_LINES)..i]
                    .iter()
                    .map(|l| l.to_string())
                    .collect(),
                after: lines[i + 1..(i + 1 + CONTEXT_LINES).min(lines.len())]
                    .iter()
                    .map(|l| l.to_string())
                    .collect(),
            })
            .collect();

        Ok(FileSearch {
            path: path.to_string(),
            pattern: pattern.to_string(),
            regex: regex.is_some(),
            total_matches: hits.len(),
            matches,
        })
    }

    fn line_origin(&self, repo: &Repository, path: &str, line: usize) -> Result<LineOrigin, InspectError> {
        let text = self.read_text(repo, path)?;
        let line_not_found = || InspectError::LineNotFound {
            path: path.to_string(),
            line,
        };
        let target = match line.checked_sub(1).and_then(|i| text.lines().nth(i)) {
            Some(l) => l.to_string(),
            None => return Err(line_not_found()),
        };
        let needle = target.trim();

        // Walk back through versions of the file while the line is still there.
        let mut introduced = None;
        for id in self.history(repo, path, MAX_ORIGIN_VERSIONS)? {
            let version = self.read_text_at(repo, id, path)?;
            if version.lines().any(|l| l.trim() == needle) {
                introduced = Some(id);
            } else {
                break;
            }
        }
        let introduced = introduced.ok_or_else(line_not_found)?;

        let mut opts = BlameOptions::new();
        opts.newest_commit(self.commit).min_line(line).max_line(line);
        let last_modified_by = repo
            .blame_file(Path::new(path), Some(&mut opts))
            .ok()
            .and_then(|blame| blame.get_line(line).map(|h| h.final_commit_id()))
            .and_then(|id| repo.find_commit(id).ok())
            .map(|commit| self.summarize(&commit));

        Ok(LineOrigin {
            path: path.to_string(),
            line_number: line,
            line_content: target,
            introduced_by: self.summarize(&repo.find_commit(introduced)?),
            last_modified_by,
        })
    }
}

fn build_nodes(
    repo: &Repository,
    tree: &Tree<'_>,
    prefix: &str,
    depth: usize,
    max_depth: usize,
    budget: &mut usize,
) -> Result<Vec<TreeNode>, InspectError> {
    let mut nodes = Vec::new();
    for entry in tree.iter() {
        if *budget == 0 {
            break;
        }
        let (Some(name), Some(kind)) = (entry.name(), entry_kind(entry.kind())) else {
            continue;
        };
        *budget -= 1;
        let path = join_path(prefix, name);
        let (size, children) = match kind {
            EntryKind::File => (repo.find_blob(entry.id()).ok().map(|b| b.size() as u64), Vec::new()),
            EntryKind::Directory if depth < max_depth => {
                let subtree = repo.find_tree(entry.id())?;
                (None, build_nodes(repo, &subtree, &path, depth + 1, max_depth, budget)?)
            }
            _ => (None, Vec::new()),
        };
        nodes.push(TreeNode {
            name: name.to_string(),
            path,
            kind,
            size,
            children,
        });
    }
    Ok(nodes)
}

fn empty_tree(path: &str, note: String) -> RepoTree {
    RepoTree {
        root: path.to_string(),
        nodes: Vec::new(),
        truncated: false,
        note: Some(note),
    }
}

fn entry_kind(kind: Option<ObjectType>) -> Option<EntryKind> {
    match kind? {
        ObjectType::Blob => Some(EntryKind::File),
        ObjectType::Tree => Some(EntryKind::Directory),
        ObjectType::Commit => Some(EntryKind::Submodule),
        _ => None,
    }
}

fn delta_status(status: Delta) -> &'static str {
    match status {
        Delta::Added => "added",
        Delta::Deleted => "deleted",
        Delta::Modified => "modified",
        Delta::Renamed => "renamed",
        Delta::Copied => "copied",
        _ => "changed",
    }
}

fn blob_id_at(commit: &Commit<'_>, path: &str) -> Option<Oid> {
    commit
        .tree()
        .ok()?
        .get_path(Path::new(path))
        .ok()
        .filter(|e| e.kind() == Some(ObjectType::Blob))
        .map(|e| e.id())
}

fn not_found_or(err: git2::Error, what: impl FnOnce() -> String) -> InspectError {
    match err.code() {
        ErrorCode::NotFound | ErrorCode::InvalidSpec | ErrorCode::Ambiguous => {
            InspectError::NotFound(what())
        }
        _ => InspectError::Git(err),
    }
}

fn timestamp(seconds: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(seconds, 0).unwrap_or_default()
}

fn clean_path(path: &str) -> String {
    path.trim()
        .trim_start_matches("./")
        .trim_matches('/')
        .to_string()
}

fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", prefix, name)
    }
}

fn preview(line: &str) -> String {
    line.trim().chars().take(HIT_PREVIEW_CHARS).collect()
}

/// Cut `text` to at most `max` bytes on a char boundary.
fn truncate_bytes(text: &str, max: usize) -> (&str, bool) {
    if text.len() <= max {
        return (text, false);
    }
    let mut cut = max;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    (&text[..cut], true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::fixture::FixtureRepo;

    const STATS_V1: &str = "def average(values):\n    total = sum(values)\n    return total / len(values)\n";
    const STATS_V2: &str = "def average(values):\n    total = sum(values)\n    if not values:\n        return 0\n    return total / len(values)\n";
    const MAIN: &str = "from app.stats import average\n\nprint(average([1, 2]))\n";

    struct Setup {
        _fixture: FixtureRepo,
        inspector: GitInspector,
        first: String,
        second: String,
    }

    fn setup_with(max_file_bytes: usize) -> Setup {
        let fixture = FixtureRepo::new();
        let first = fixture.commit(
            "Add stats module",
            &[
                ("app/stats.py", STATS_V1),
                ("app/main.py", MAIN),
                ("README.md", "# Stats\n"),
                ("assets/logo.bin", "\u{0}\u{1}PNG\u{0}"),
            ],
        );
        let second = fixture.commit_as(
            "Grace Hopper",
            "grace@example.com",
            "Handle empty input",
            &[("app/stats.py", STATS_V2)],
        );
        fixture.set_origin("https://github.com/acme/stats.git");

        let cache = Arc::new(ContentCache::new(16));
        let inspector = GitInspector::open(fixture.path(), "HEAD", cache, max_file_bytes).unwrap();
        Setup {
            _fixture: fixture,
            inspector,
            first,
            second,
        }
    }

    fn setup() -> Setup {
        setup_with(100 * 1024)
    }

    #[tokio::test]
    async fn test_repository_structure() {
        let s = setup();
        let tree = s.inspector.repository_structure(3, "").await.unwrap();
        let app = tree.nodes.iter().find(|n| n.name == "app").unwrap();
        assert_eq!(app.kind, EntryKind::Directory);
        let children: Vec<&str> = app.children.iter().map(|c| c.path.as_str()).collect();
        assert_eq!(children, vec!["app/main.py", "app/stats.py"]);

        let shallow = s.inspector.repository_structure(1, "").await.unwrap();
        let app = shallow.nodes.iter().find(|n| n.name == "app").unwrap();
        assert!(app.children.is_empty());
    }

    #[tokio::test]
    async fn test_structure_of_missing_path_is_empty_with_note() {
        let s = setup();
        let tree = s.inspector.repository_structure(2, "nowhere").await.unwrap();
        assert!(tree.nodes.is_empty());
        assert!(tree.note.unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_search_code_ranks_by_matches() {
        let s = setup();
        let results = s.inspector.search_code("AVERAGE", None, 10).await.unwrap();
        let paths: Vec<&str> = results.iter().map(|m| m.path.as_str()).collect();
        assert_eq!(paths, vec!["app/main.py", "app/stats.py"]);
        assert_eq!(results[0].lines[0].line_number, 1);

        let filtered = s
            .inspector
            .search_code("average", Some("stats"), 10)
            .await
            .unwrap();
        assert_eq!(filtered.len(), 1);

        let none = s.inspector.search_code("no_such_symbol", None, 10).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_file_content_is_idempotent() {
        let s = setup();
        let a = s.inspector.file_content("app/stats.py", None).await.unwrap();
        let b = s.inspector.file_content("./app/stats.py", None).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.content, STATS_V2);
        assert_eq!(a.total_lines, 5);
        assert!(!a.truncated);
    }

    #[tokio::test]
    async fn test_file_content_range_and_truncation() {
        let s = setup();
        let excerpt = s
            .inspector
            .file_content("app/stats.py", Some(LineRange::new(3, 4).unwrap()))
            .await
            .unwrap();
        assert_eq!(excerpt.content, "    if not values:\n        return 0");
        assert_eq!((excerpt.start_line, excerpt.end_line), (3, 4));

        let small = setup_with(10);
        let cut = small.inspector.file_content("app/stats.py", None).await.unwrap();
        assert!(cut.truncated);
        assert_eq!(cut.content.len(), 10);
    }

    #[tokio::test]
    async fn test_file_content_errors() {
        let s = setup();
        let missing = s.inspector.file_content("nope.py", None).await.unwrap_err();
        assert!(matches!(missing, InspectError::NotFound(_)));
        let binary = s.inspector.file_content("assets/logo.bin", None).await.unwrap_err();
        assert!(matches!(binary, InspectError::Binary(_)));
    }

    #[tokio::test]
    async fn test_directory_files() {
        let s = setup();
        let root = s.inspector.directory_files("").await.unwrap();
        assert_eq!(root[0].kind, EntryKind::Directory);
        let app = s.inspector.directory_files("app").await.unwrap();
        assert_eq!(app.len(), 2);
        assert_eq!(app[1].path, "app/stats.py");

        let missing = s.inspector.directory_files("docs").await.unwrap_err();
        assert!(matches!(missing, InspectError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_file_history_newest_first() {
        let s = setup();
        let history = s.inspector.file_history("app/stats.py", 10).await.unwrap();
        let ids: Vec<&str> = history.iter().map(|c| c.commit_id.as_str()).collect();
        assert_eq!(ids, vec![s.second.as_str(), s.first.as_str()]);
        assert_eq!(history[0].message, "Handle empty input");
        assert_eq!(
            history[0].url.as_deref(),
            Some(format!("https://github.com/acme/stats/commit/{}", s.second).as_str())
        );

        let main = s.inspector.file_history("app/main.py", 10).await.unwrap();
        assert_eq!(main.len(), 1);
    }

    #[tokio::test]
    async fn test_blame_attributes_lines() {
        let s = setup();
        let blame = s.inspector.file_blame("app/stats.py", None).await.unwrap();
        assert_eq!(blame.len(), 5);
        assert_eq!(blame[0].commit_id, s.first);
        assert_eq!(blame[2].commit_id, s.second);
        assert_eq!(blame[2].author.name, "Grace Hopper");
        assert_eq!(blame[4].commit_id, s.first);

        let range = s
            .inspector
            .file_blame("app/stats.py", Some(LineRange::new(3, 4).unwrap()))
            .await
            .unwrap();
        assert_eq!(range.len(), 2);
        assert_eq!(range[0].line_number, 3);

        let binary = s.inspector.file_blame("assets/logo.bin", None).await.unwrap_err();
        assert!(matches!(binary, InspectError::Binary(_)));
    }

    #[tokio::test]
    async fn test_commit_details() {
        let s = setup();
        let detail = s.inspector.commit_details(&s.second[..10]).await.unwrap();
        assert_eq!(detail.summary.commit_id, s.second);
        assert_eq!(detail.files.len(), 1);
        assert_eq!(detail.files[0].status, "modified");
        assert_eq!(detail.additions, 2);
        assert!(detail.patch.contains("+    if not values:"));

        let info = detail.to_commit_info();
        assert_eq!(info.files_changed, vec!["app/stats.py"]);
        assert_eq!(info.author.email, "grace@example.com");
    }

    #[tokio::test]
    async fn test_unknown_commit_is_sanitized_not_found() {
        let s = setup();
        let err = s.inspector.commit_details("deadbeefcafe").await.unwrap_err();
        assert!(matches!(err, InspectError::NotFound(_)));
        let message = err.public_message();
        assert!(message.contains("deadbeefcafe"));
        assert!(!message.contains("class="));
    }

    #[tokio::test]
    async fn test_file_dependencies() {
        let s = setup();
        let stats = s.inspector.file_dependencies("app/stats.py").await.unwrap();
        assert!(stats.imports.is_empty());
        assert_eq!(stats.imported_by, vec!["app/main.py"]);

        let main = s.inspector.file_dependencies("app/main.py").await.unwrap();
        assert_eq!(main.imports, vec!["app.stats"]);

        let readme = s.inspector.file_dependencies("README.md").await.unwrap();
        assert!(readme.imports.is_empty() && readme.imported_by.is_empty());
    }

    #[tokio::test]
    async fn test_search_in_file() {
        let s = setup();
        let found = s.inspector.search_in_file("app/stats.py", "return").await.unwrap();
        let lines: Vec<usize> = found.matches.iter().map(|m| m.line_number).collect();
        assert_eq!(lines, vec![4, 5]);
        assert_eq!(found.matches[0].before.len(), 2);
        assert!(found.regex);

        let literal = s.inspector.search_in_file("app/stats.py", "len(").await.unwrap();
        assert!(!literal.regex);
        assert_eq!(literal.total_matches, 1);
    }

    #[tokio::test]
    async fn test_line_origin() {
        let s = setup();
        let added = s.inspector.line_origin("app/stats.py", 3).await.unwrap();
        assert_eq!(added.introduced_by.commit_id, s.second);
        assert_eq!(added.line_content, "    if not values:");

        let original = s.inspector.line_origin("app/stats.py", 5).await.unwrap();
        assert_eq!(original.introduced_by.commit_id, s.first);
        assert_eq!(
            original.last_modified_by.map(|c| c.commit_id),
            Some(s.first.clone())
        );

        let err = s.inspector.line_origin("app/stats.py", 99).await.unwrap_err();
        assert!(matches!(err, InspectError::LineNotFound { line: 99, .. }));
    }

    #[tokio::test]
    async fn test_recent_commits() {
        let s = setup();
        let recent = s.inspector.recent_commits(1).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].commit_id, s.second);
        assert_eq!(recent[0].short_id.len(), 7);
    }

    #[tokio::test]
    async fn test_analyze_function() {
        let s = setup();
        let info = s.inspector.analyze_function("app/stats.py", "average").await.unwrap();
        assert_eq!((info.start_line, info.end_line), (1, 5));

        let err = s
            .inspector
            .analyze_function("app/stats.py", "median")
            .await
            .unwrap_err();
        assert!(matches!(err, InspectError::FunctionNotFound { .. }));
    }

    #[test]
    fn test_line_range_validation() {
        assert!(LineRange::new(0, 3).is_err());
        assert!(LineRange::new(5, 3).is_err());
        assert!(LineRange::new(2, 2).is_ok());
    }
}

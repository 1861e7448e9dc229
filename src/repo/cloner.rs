//! Obtaining a local checkout of the repository under investigation.
//!
//! Remote repositories are cloned with full history into a temporary directory
//! (blame and line-origin tracing need every commit). Local checkouts are used
//! in place.

use anyhow::{Context, Result};
use git2::{FetchOptions, Progress, RemoteCallbacks, Repository};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{debug, info};

/// A repository checkout ready for inspection.
#[derive(Debug)]
pub struct Checkout {
    /// Path to the working tree root.
    pub path: PathBuf,
    /// URL of the `origin` remote, when known.
    pub remote_url: Option<String>,
    /// Keeps a temporary clone alive for as long as the checkout is in use.
    _temp_dir: Option<TempDir>,
}

impl Checkout {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Web base URL for commit links (`https://github.com/owner/repo`).
    pub fn web_url(&self) -> Option<String> {
        self.remote_url.as_deref().and_then(github_web_url)
    }
}

/// Options for cloning a repository.
#[derive(Debug, Clone)]
pub struct CloneOptions {
    /// Branch to checkout (None for the remote's default branch).
    pub branch: Option<String>,
    /// Depth for a shallow clone (None for full history).
    pub depth: Option<i32>,
    /// Whether to show progress.
    pub show_progress: bool,
}

impl Default for CloneOptions {
    fn default() -> Self {
        Self {
            branch: None,
            depth: None,
            show_progress: true,
        }
    }
}

/// Clone a repository from a URL into a temporary directory.
pub fn clone_repository(url: &str, options: CloneOptions) -> Result<Checkout> {
    info!("Cloning repository: {}", url);

    let temp = TempDir::new().context("Failed to create temporary directory")?;
    let path = temp.path().to_path_buf();
    debug!("Clone target: {}", path.display());

    let progress_bar = if options.show_progress {
        let pb = ProgressBar::new(0);
        pb.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} objects",
                )
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        Some(Arc::new(pb))
    } else {
        None
    };

    let pb_clone = progress_bar.clone();
    let mut callbacks = RemoteCallbacks::new();
    callbacks.transfer_progress(move |progress: Progress<'_>| {
        if let Some(ref pb) = pb_clone {
            pb.set_length(progress.total_objects() as u64);
            pb.set_position(progress.received_objects() as u64);
        }
        true
    });

    let mut fetch_opts = FetchOptions::new();
    fetch_opts.remote_callbacks(callbacks);
    if let Some(depth) = options.depth {
        fetch_opts.depth(depth);
    }

    let mut builder = git2::build::RepoBuilder::new();
    builder.fetch_options(fetch_opts);
    if let Some(ref branch) = options.branch {
        builder.branch(branch);
    }

    builder
        .clone(url, &path)
        .with_context(|| format!("Failed to clone repository: {}", url))?;

    if let Some(pb) = progress_bar {
        pb.finish_with_message("Clone complete");
    }
    info!("Cloned repository to: {}", path.display());

    Ok(Checkout {
        path,
        remote_url: Some(url.to_string()),
        _temp_dir: Some(temp),
    })
}

/// Open an existing local repository.
pub fn open_local_repository(path: &Path) -> Result<Checkout> {
    info!("Opening local repository: {}", path.display());

    if !path.exists() {
        anyhow::bail!("Repository path does not exist: {}", path.display());
    }

    let repo = Repository::open(path)
        .with_context(|| format!("Failed to open repository: {}", path.display()))?;
    let remote_url = repo
        .find_remote("origin")
        .ok()
        .and_then(|remote| remote.url().map(String::from));
    let root = repo
        .workdir()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| path.to_path_buf());

    Ok(Checkout {
        path: root,
        remote_url,
        _temp_dir: None,
    })
}

/// Parse a GitHub URL to extract owner and repo name.
pub fn parse_github_url(url: &str) -> Option<(String, String)> {
    let url = url.trim_end_matches('/').trim_end_matches(".git");

    let rest = url
        .strip_prefix("https://github.com/")
        .or_else(|| url.strip_prefix("http://github.com/"))
        .or_else(|| url.strip_prefix("git@github.com:"))?;

    let parts: Vec<&str> = rest.split('/').collect();
    if parts.len() >= 2 && !parts[0].is_empty() && !parts[1].is_empty() {
        Some((parts[0].to_string(), parts[1].to_string()))
    } else {
        None
    }
}

/// `https://github.com/owner/repo` for any recognised GitHub remote URL.
pub fn github_web_url(url: &str) -> Option<String> {
    parse_github_url(url).map(|(owner, repo)| format!("https://github.com/{}/{}", owner, repo))
}

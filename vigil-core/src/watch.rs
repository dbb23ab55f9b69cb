//! Filesystem watch boundary.
//!
//! A thin wrapper around `notify` that normalizes raw notifications into
//! [`ChangeEvent`]s and filters them through the configured allow/deny lists.
//! Renames become a `Deleted` for the old path plus a `Created` for the new
//! one. Watcher errors are surfaced explicitly so the pipeline can fall back
//! to a rescan of every root.

use std::env;
use std::fmt;
use std::path::{Component, Path, PathBuf};

use notify::event::{EventKind, ModifyKind, RenameMode};
use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::WatchConfig;
use crate::error::{PipelineError, Result};
use crate::types::ChangeEvent;

/// Lowercased extension without the dot.
pub fn file_extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
}

/// Static allow/deny filter applied to every observed path.
///
/// Deny substrings are matched against the path relative to the deepest
/// watch root containing it, so a root that itself lives under `build/` or
/// `dist/` is still scanned. Excluded directories (the state directory) are
/// rejected outright.
#[derive(Debug, Clone, Default)]
pub struct WatchFilter {
    allow_extensions: Vec<String>,
    deny_substrings: Vec<String>,
    roots: Vec<PathBuf>,
    excluded: Vec<PathBuf>,
}

impl WatchFilter {
    pub fn new(allow_extensions: Vec<String>, deny_substrings: Vec<String>) -> Self {
        Self {
            allow_extensions: allow_extensions
                .into_iter()
                .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            deny_substrings,
            roots: Vec::new(),
            excluded: Vec::new(),
        }
    }

    pub fn from_config(config: &WatchConfig) -> Self {
        Self::new(
            config.allow_extensions.clone(),
            config.deny_substrings.clone(),
        )
    }

    /// Anchor deny matching at these roots.
    pub fn with_roots(mut self, roots: &[PathBuf]) -> Self {
        self.roots = roots.to_vec();
        self
    }

    /// Reject everything under `dir`.
    pub fn excluding(mut self, dir: PathBuf) -> Self {
        self.excluded.push(dir);
        self
    }

    pub fn accepts(&self, path: &Path) -> bool {
        if self.excluded.iter().any(|dir| path.starts_with(dir)) {
            return false;
        }

        let relative = self.relative_to_root(path);
        let mut normalized = relative.to_string_lossy().replace('\\', "/");
        if !normalized.starts_with('/') {
            normalized.insert(0, '/');
        }
        if self
            .deny_substrings
            .iter()
            .any(|needle| normalized.contains(needle.as_str()))
        {
            return false;
        }

        if self.allow_extensions.is_empty() {
            return true;
        }

        file_extension(path).is_some_and(|ext| self.allow_extensions.contains(&ext))
    }

    fn relative_to_root<'a>(&self, path: &'a Path) -> &'a Path {
        self.roots
            .iter()
            .filter_map(|root| path.strip_prefix(root).ok())
            .min_by_key(|rel| rel.components().count())
            .unwrap_or(path)
    }
}

/// Output of the notify callback.
pub enum WatchMessage {
    Change(ChangeEvent),
    Error(String),
}

impl fmt::Debug for WatchMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchMessage::Change(event) => f
                .debug_struct("WatchMessage::Change")
                .field("kind", &event.kind)
                .field("path", &event.path)
                .finish(),
            WatchMessage::Error(message) => f
                .debug_struct("WatchMessage::Error")
                .field("message", message)
                .finish(),
        }
    }
}

/// Keeps notify streams alive; dropping it stops every watcher.
pub struct WatchGuard {
    watchers: Vec<RecommendedWatcher>,
    roots: Vec<PathBuf>,
}

impl fmt::Debug for WatchGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchGuard")
            .field("watcher_count", &self.watchers.len())
            .field("roots", &self.roots)
            .finish()
    }
}

/// Make every root absolute against the current directory.
pub fn resolve_roots(roots: &[PathBuf]) -> Vec<PathBuf> {
    let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    roots
        .iter()
        .map(|path| {
            if path.is_absolute() {
                path.clone()
            } else {
                cwd.join(path)
            }
        })
        .map(|path| std::fs::canonicalize(&path).unwrap_or(path))
        .collect()
}

/// Attach a recursive watcher to every root. Blocking; call from
/// `spawn_blocking`. A root that cannot be watched is a configuration error.
pub fn init_watchers(
    roots: Vec<PathBuf>,
    filter: WatchFilter,
    tx: mpsc::Sender<WatchMessage>,
) -> Result<WatchGuard> {
    let mut watchers = Vec::with_capacity(roots.len());
    for root in &roots {
        let root_clone = root.clone();
        let tx_event = tx.clone();
        let filter = filter.clone();
        let mut watcher = RecommendedWatcher::new(
            move |res: std::result::Result<Event, notify::Error>| match res {
                Ok(event) => {
                    for change in convert_event(&root_clone, &filter, event) {
                        if let Err(err) = tx_event.blocking_send(WatchMessage::Change(change)) {
                            warn!(
                                target: "vigil::watch",
                                root = %root_clone.display(),
                                error = %err,
                                "watch channel closed"
                            );
                            return;
                        }
                    }
                }
                Err(err) => {
                    let _ = tx_event.blocking_send(WatchMessage::Error(err.to_string()));
                }
            },
            NotifyConfig::default(),
        )
        .map_err(|err| {
            PipelineError::Watch(format!(
                "failed to create watcher for {}: {}",
                root.display(),
                err
            ))
        })?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(|err| {
                PipelineError::Config(format!("failed to watch {}: {}", root.display(), err))
            })?;

        debug!(target: "vigil::watch", root = %root.display(), "watching root");
        watchers.push(watcher);
    }

    Ok(WatchGuard { watchers, roots })
}

/// Walk every root and list the files the filter accepts. Blocking.
pub fn scan_roots(roots: &[PathBuf], filter: &WatchFilter) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for root in roots {
        for entry in WalkDir::new(root).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(target: "vigil::watch", root = %root.display(), error = %err, "scan entry failed");
                    continue;
                }
            };
            if entry.file_type().is_file() && filter.accepts(entry.path()) {
                files.push(entry.into_path());
            }
        }
    }
    files
}

pub(crate) fn convert_event(root: &Path, filter: &WatchFilter, event: Event) -> Vec<ChangeEvent> {
    let mut paths = event
        .paths
        .iter()
        .filter_map(|path| sanitize_path(root, path));

    let changes = match event.kind {
        EventKind::Create(_) => paths.next().map(ChangeEvent::created).into_iter().collect(),
        EventKind::Remove(_) => paths.next().map(ChangeEvent::deleted).into_iter().collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let old = paths.next();
            let new = paths.next();
            old.map(ChangeEvent::deleted)
                .into_iter()
                .chain(new.map(ChangeEvent::created))
                .collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            paths.next().map(ChangeEvent::deleted).into_iter().collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            paths.next().map(ChangeEvent::created).into_iter().collect()
        }
        EventKind::Modify(_) => paths.next().map(ChangeEvent::modified).into_iter().collect(),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
    };

    changes
        .into_iter()
        .filter(|change| filter.accepts(&change.path))
        .collect()
}

fn sanitize_path(root: &Path, path: &Path) -> Option<PathBuf> {
    let rel = path.strip_prefix(root).ok()?;
    let mut clean = PathBuf::new();
    for component in rel.components() {
        match component {
            Component::Normal(seg) => clean.push(seg),
            Component::CurDir => {}
            Component::ParentDir => {
                if !clean.pop() {
                    return None;
                }
            }
            _ => return None,
        }
    }

    if clean.as_os_str().is_empty() {
        return None;
    }
    Some(root.join(clean))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChangeKind;
    use notify::event::{CreateKind, DataChange, RemoveKind};

    fn filter() -> WatchFilter {
        WatchFilter::from_config(&WatchConfig::default())
    }

    #[test]
    fn filter_applies_allow_and_deny_lists() {
        let filter = filter();
        assert!(filter.accepts(Path::new("/repo/src/a.py")));
        assert!(filter.accepts(Path::new("/repo/Config.TOML")));
        assert!(!filter.accepts(Path::new("/repo/.git/config.json")));
        assert!(!filter.accepts(Path::new("/repo/target/debug/out.rs")));
        assert!(!filter.accepts(Path::new("/repo/image.png")));
        assert!(!filter.accepts(Path::new("/repo/Makefile")));
    }

    #[test]
    fn empty_allow_list_accepts_everything_not_denied() {
        let filter = WatchFilter::new(Vec::new(), vec!["/node_modules/".into()]);
        assert!(filter.accepts(Path::new("/repo/Makefile")));
        assert!(!filter.accepts(Path::new("/repo/node_modules/x.js")));
    }

    #[test]
    fn deny_list_is_relative_to_the_watch_root() {
        let root = PathBuf::from("/ci/build/project");
        let filter = filter().with_roots(std::slice::from_ref(&root));
        assert!(filter.accepts(&root.join("a.py")));
        assert!(filter.accepts(&root.join("pkg/dist_utils.py")));
        assert!(!filter.accepts(&root.join("build/gen.py")));
        assert!(!filter.accepts(&root.join("pkg/.git/hooks.py")));
    }

    #[test]
    fn nested_roots_use_the_deepest_match() {
        let outer = PathBuf::from("/repo");
        let inner = PathBuf::from("/repo/dist/site");
        let filter = filter().with_roots(&[outer.clone(), inner.clone()]);
        assert!(filter.accepts(&inner.join("page.json")));
        assert!(!filter.accepts(&outer.join("dist/other.json")));
    }

    #[test]
    fn excluded_directory_is_rejected() {
        let root = PathBuf::from("/repo");
        let filter = WatchFilter::new(Vec::new(), Vec::new())
            .with_roots(std::slice::from_ref(&root))
            .excluding(root.join("state"));
        assert!(!filter.accepts(&root.join("state/health.json")));
        assert!(!filter.accepts(&root.join("state/cache/index")));
        assert!(filter.accepts(&root.join("statements.py")));
    }

    #[test]
    fn rename_becomes_delete_plus_create() {
        let root = Path::new("/repo");
        let event = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(root.join("old.py"))
            .add_path(root.join("new.py"));

        let changes = convert_event(root, &filter(), event);
        let kinds: Vec<_> = changes.iter().map(|c| (c.kind, c.path.clone())).collect();
        assert_eq!(
            kinds,
            vec![
                (ChangeKind::Deleted, root.join("old.py")),
                (ChangeKind::Created, root.join("new.py")),
            ]
        );
    }

    #[test]
    fn data_and_remove_events_map_to_kinds() {
        let root = Path::new("/repo");
        let modify = Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content)))
            .add_path(root.join("a.py"));
        let remove = Event::new(EventKind::Remove(RemoveKind::File)).add_path(root.join("a.py"));
        let create = Event::new(EventKind::Create(CreateKind::File)).add_path(root.join("b.py"));

        assert_eq!(convert_event(root, &filter(), modify)[0].kind, ChangeKind::Modified);
        assert_eq!(convert_event(root, &filter(), remove)[0].kind, ChangeKind::Deleted);
        assert_eq!(convert_event(root, &filter(), create)[0].kind, ChangeKind::Created);
    }

    #[test]
    fn events_outside_root_or_filtered_are_ignored() {
        let root = Path::new("/repo");
        let outside = Event::new(EventKind::Create(CreateKind::File))
            .add_path(PathBuf::from("/elsewhere/a.py"));
        let denied = Event::new(EventKind::Create(CreateKind::File))
            .add_path(root.join("node_modules/pkg/index.js"));
        let access = Event::new(EventKind::Access(notify::event::AccessKind::Any))
            .add_path(root.join("a.py"));

        assert!(convert_event(root, &filter(), outside).is_empty());
        assert!(convert_event(root, &filter(), denied).is_empty());
        assert!(convert_event(root, &filter(), access).is_empty());
    }

    #[test]
    fn scan_walks_nested_directories() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path().to_path_buf();
        std::fs::create_dir_all(root.join("pkg/sub")).expect("mkdir");
        std::fs::create_dir_all(root.join("target")).expect("mkdir");
        std::fs::write(root.join("a.py"), "x").expect("write");
        std::fs::write(root.join("pkg/sub/b.rs"), "fn main() {}").expect("write");
        std::fs::write(root.join("pkg/notes.png"), "png").expect("write");
        std::fs::write(root.join("target/c.rs"), "").expect("write");

        let mut files = scan_roots(&[root.clone()], &filter());
        files.sort();
        assert_eq!(files, vec![root.join("a.py"), root.join("pkg/sub/b.rs")]);
    }
}

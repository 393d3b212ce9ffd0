// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::fs::FileSystem;

/// Maps between the absolute file URIs the runtime reports
/// (`file:///srv/app/public/index.php`) and local copies of the same
/// source tree under the configured base directory.
///
/// The runtime's prefix is not knowable up front, so it gets derived
/// per session: walk the URI components right to left, and the first
/// one that also exists directly under `base_path` marks the split
/// between the shared suffix and the runtime-only prefix. The prefix
/// becomes `client_base_path` and is used to build remote paths for
/// `breakpoint_set`; it is forgotten again when the session ends.
#[derive(Debug, Clone)]
pub struct PathReconciler {
    base_path: PathBuf,
    client_base_path: Option<String>,
}

impl PathReconciler {
    pub fn new(base_path: PathBuf) -> Self {
        PathReconciler { base_path, client_base_path: None }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn client_base_path(&self) -> Option<&str> {
        self.client_base_path.as_deref()
    }

    /// Derive (or re-derive) the client base path from a URI the
    /// runtime reported and return the local path, relative to
    /// `base_path`, of the matching file. Returns None when no suffix
    /// component exists locally, in which case no mapping is
    /// available and breakpoints cannot be pushed.
    pub fn reconcile(&mut self, file_uri: &str, fs: &dyn FileSystem) -> Option<String> {
        let parts: Vec<&str> = file_uri.split('/').collect();
        // The first three parts are the empty shards of the leading
        // `file:///`, not path components.
        if parts.len() <= 3 {
            debug!("uri '{file_uri}' has no path components to probe");
            self.client_base_path = None;
            return None;
        }

        for (i, part) in parts[3..].iter().enumerate().rev() {
            let candidate = self.base_path.join(part);
            if fs.exists(&candidate) {
                let split = 3 + i;
                let client_base = parts[..split].join("/");
                let relative = parts[split..].join("/");
                info!("reconciled '{file_uri}': client base '{client_base}', local '{relative}'");
                self.client_base_path = Some(client_base);
                return Some(relative);
            }
        }

        debug!("no suffix of '{file_uri}' exists under {:?}", self.base_path);
        self.client_base_path = None;
        None
    }

    /// The runtime-side path for a local file, used when issuing
    /// `breakpoint_set`. Only available once a session's URI has been
    /// reconciled.
    pub fn remote_path_for(&self, local: &str) -> Option<String> {
        self.client_base_path.as_ref().map(|base| format!("{base}/{local}"))
    }

    /// Forget the per-session prefix. Called when a session ends.
    pub fn clear(&mut self) {
        self.client_base_path = None;
    }
}

#[cfg(test)]
mod test {
    use std::{collections::HashSet, path::Path};

    use super::*;

    struct FakeFs {
        existing: HashSet<PathBuf>,
    }

    impl FakeFs {
        fn with_paths(paths: &[&str]) -> Self {
            FakeFs { existing: paths.iter().map(PathBuf::from).collect() }
        }
    }

    impl FileSystem for FakeFs {
        fn exists(&self, path: &Path) -> bool {
            self.existing.contains(path)
        }

        fn read(&self, path: &Path) -> anyhow::Result<Vec<u8>> {
            if self.exists(path) {
                Ok(b"example data".to_vec())
            } else {
                Err(anyhow::anyhow!("could not read file"))
            }
        }
    }

    #[test]
    fn derives_client_base_path_from_matching_suffix() {
        let fs = FakeFs::with_paths(&["/proj/index.php"]);
        let mut reconciler = PathReconciler::new(PathBuf::from("/proj"));

        let relative = reconciler.reconcile("file:///srv/app/public/index.php", &fs);
        assert_eq!(relative.as_deref(), Some("index.php"));
        assert_eq!(reconciler.client_base_path(), Some("file:///srv/app/public"));
    }

    #[test]
    fn remote_path_round_trips_to_the_original_uri() {
        let fs = FakeFs::with_paths(&["/proj/index.php"]);
        let mut reconciler = PathReconciler::new(PathBuf::from("/proj"));

        let uri = "file:///srv/app/public/index.php";
        let relative = reconciler.reconcile(uri, &fs).expect("reconciliation to succeed");
        assert_eq!(reconciler.remote_path_for(&relative).as_deref(), Some(uri));
    }

    #[test]
    fn deeper_components_win_over_shallower_ones() {
        // Both `public` and `index.php` exist locally; the scan runs
        // right to left so the file itself decides the split.
        let fs = FakeFs::with_paths(&["/proj/public", "/proj/index.php"]);
        let mut reconciler = PathReconciler::new(PathBuf::from("/proj"));

        let relative = reconciler.reconcile("file:///srv/app/public/index.php", &fs);
        assert_eq!(relative.as_deref(), Some("index.php"));
        assert_eq!(reconciler.client_base_path(), Some("file:///srv/app/public"));
    }

    #[test]
    fn no_matching_suffix_yields_none() {
        let fs = FakeFs::with_paths(&[]);
        let mut reconciler = PathReconciler::new(PathBuf::from("/proj"));

        assert_eq!(reconciler.reconcile("file:///srv/app/public/index.php", &fs), None);
        assert_eq!(reconciler.client_base_path(), None);
        assert_eq!(reconciler.remote_path_for("index.php"), None);
    }

    #[test]
    fn uri_without_path_components_yields_none() {
        let fs = FakeFs::with_paths(&["/proj/index.php"]);
        let mut reconciler = PathReconciler::new(PathBuf::from("/proj"));
        assert_eq!(reconciler.reconcile("file://", &fs), None);
    }

    #[test]
    fn clear_forgets_the_session_prefix() {
        let fs = FakeFs::with_paths(&["/proj/index.php"]);
        let mut reconciler = PathReconciler::new(PathBuf::from("/proj"));

        reconciler.reconcile("file:///srv/app/public/index.php", &fs);
        assert!(reconciler.client_base_path().is_some());

        reconciler.clear();
        assert_eq!(reconciler.client_base_path(), None);
        assert_eq!(reconciler.remote_path_for("index.php"), None);
    }
}

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use fs4::fs_std::FileExt;
use tokio::sync::Mutex;

use fleet_common::{target_addr, ScrapeTargetGroup, TargetLabels};

use crate::error::RegistryError;

/// The file-based service discovery list the metrics backend scrapes.
///
/// Mutations hold the handle's mutex and an exclusive advisory lock on
/// `<path>.lock` for the whole read-modify-write, so other handles and
/// other processes on the same file are serialized too. Writes land
/// through a uniquely named temp file in the same directory, renamed over
/// the target. Both mutations fail soft: errors are logged and the file is
/// left as it was.
#[derive(Debug)]
pub struct TargetRegistry {
    path: PathBuf,
    lock: Mutex<()>,
    failures: AtomicU64,
}

impl TargetRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
            failures: AtomicU64::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Mutations that failed and were absorbed since startup.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Current groups. A missing or empty file is an empty registry.
    pub async fn load(&self) -> Result<Vec<ScrapeTargetGroup>, RegistryError> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(RegistryError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        serde_json::from_slice(&raw).map_err(|source| RegistryError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Blocks until no other handle holds the file. Released on drop.
    async fn lock_file(&self) -> Result<std::fs::File, RegistryError> {
        let lock_path = self.lock_path();
        self.blocking(move || {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&lock_path)?;
            file.lock_exclusive()?;
            Ok(file)
        })
        .await
    }

    async fn store(&self, groups: &[ScrapeTargetGroup]) -> Result<(), RegistryError> {
        let mut body = serde_json::to_vec_pretty(groups)?;
        body.push(b'\n');

        let path = self.path.clone();
        self.blocking(move || {
            let dir = match path.parent() {
                Some(dir) if !dir.as_os_str().is_empty() => dir,
                _ => Path::new("."),
            };
            let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
            tmp.write_all(&body)?;
            // the scraper usually runs as another user
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                tmp.as_file().set_permissions(std::fs::Permissions::from_mode(0o644))?;
            }
            tmp.as_file().sync_all()?;
            tmp.persist(&path).map_err(|e| e.error)?;
            Ok(())
        })
        .await
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, RegistryError>
    where
        F: FnOnce() -> std::io::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(std::io::Error::other)
            .and_then(|res| res)
            .map_err(|source| RegistryError::Io {
                path: self.path.clone(),
                source,
            })
    }

    /// Register `ip:port` for every ip as one new group. Targets already
    /// present in any group are skipped. Returns the number added.
    pub async fn add_targets(&self, ips: &[String], port: u16, labels: TargetLabels) -> usize {
        if ips.is_empty() {
            return 0;
        }
        let _guard = self.lock.lock().await;
        match self.add_locked(ips, port, labels).await {
            Ok(added) => {
                if added > 0 {
                    tracing::info!(path=%self.path.display(), added, "registered scrape targets");
                }
                added
            }
            Err(e) => {
                tracing::warn!(path=%self.path.display(), error=%e, "failed to register scrape targets");
                self.failures.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    async fn add_locked(&self, ips: &[String], port: u16, labels: TargetLabels) -> Result<usize, RegistryError> {
        let _file_lock = self.lock_file().await?;
        let mut groups = self.load().await?;
        let mut known: HashSet<String> = groups.iter().flat_map(|g| g.targets.iter().cloned()).collect();

        let targets: Vec<String> = ips
            .iter()
            .filter(|ip| !ip.is_empty())
            .map(|ip| target_addr(ip, port))
            .filter(|t| known.insert(t.clone()))
            .collect();
        if targets.is_empty() {
            return Ok(0);
        }

        let added = targets.len();
        groups.push(ScrapeTargetGroup { targets, labels });
        self.store(&groups).await?;
        Ok(added)
    }

    /// Drop the given targets from every group, and any group left empty.
    /// Returns the number of targets removed.
    pub async fn remove_targets(&self, targets: &[String]) -> usize {
        if targets.is_empty() {
            return 0;
        }
        let _guard = self.lock.lock().await;
        match self.remove_locked(targets).await {
            Ok(removed) => {
                if removed > 0 {
                    tracing::info!(path=%self.path.display(), removed, "pruned scrape targets");
                }
                removed
            }
            Err(e) => {
                tracing::warn!(path=%self.path.display(), error=%e, "failed to prune scrape targets");
                self.failures.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    async fn remove_locked(&self, targets: &[String]) -> Result<usize, RegistryError> {
        let drop: HashSet<&str> = targets.iter().map(String::as_str).collect();
        let _file_lock = self.lock_file().await?;
        let mut groups = self.load().await?;

        let mut removed = 0;
        for group in &mut groups {
            let before = group.targets.len();
            group.targets.retain(|t| !drop.contains(t.as_str()));
            removed += before - group.targets.len();
        }
        let groups_before = groups.len();
        groups.retain(|g| !g.targets.is_empty());

        if removed > 0 || groups.len() != groups_before {
            self.store(&groups).await?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn registry() -> (tempfile::TempDir, TargetRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let reg = TargetRegistry::new(dir.path().join("targets.json"));
        (dir, reg)
    }

    fn ips(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_add_then_remove_leaves_no_groups() {
        let (_dir, reg) = registry();
        assert_eq!(reg.add_targets(&ips(&["10.0.0.1"]), 27684, TargetLabels::for_cluster("demo")).await, 1);

        let groups = reg.load().await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].targets, vec!["10.0.0.1:27684".to_string()]);
        assert_eq!(groups[0].labels.cluster.as_deref(), Some("demo"));

        assert_eq!(reg.remove_targets(&ips(&["10.0.0.1:27684"])).await, 1);
        assert!(reg.load().await.unwrap().is_empty());

        // pruning again is a no-op
        assert_eq!(reg.remove_targets(&ips(&["10.0.0.1:27684"])).await, 0);
        assert!(reg.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_each_add_is_its_own_group() {
        let (_dir, reg) = registry();
        reg.add_targets(&ips(&["10.0.0.1", "10.0.0.2"]), 27684, TargetLabels::for_cluster("a")).await;
        reg.add_targets(&ips(&["10.0.0.3"]), 27684, TargetLabels::for_cluster("a")).await;
        reg.add_targets(&ips(&["10.0.0.3", "10.0.0.4"]), 27684, TargetLabels::for_cluster("a")).await;

        let groups = reg.load().await.unwrap();
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[2].targets, vec!["10.0.0.4:27684".to_string()]);

        assert_eq!(reg.add_targets(&ips(&["10.0.0.1"]), 27684, TargetLabels::for_cluster("a")).await, 0);
        assert_eq!(reg.add_targets(&[], 27684, TargetLabels::for_cluster("a")).await, 0);
        assert_eq!(reg.load().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_remove_keeps_partially_pruned_groups() {
        let (_dir, reg) = registry();
        reg.add_targets(&ips(&["10.0.0.1", "10.0.0.2"]), 27684, TargetLabels::for_cluster("a")).await;
        reg.add_targets(&ips(&["192.168.0.9"]), 27683, TargetLabels::for_region("bj")).await;

        reg.remove_targets(&ips(&["10.0.0.1:27684", "192.168.0.9:27683"])).await;
        let groups = reg.load().await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].targets, vec!["10.0.0.2:27684".to_string()]);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_left_untouched() {
        let (_dir, reg) = registry();
        tokio::fs::write(reg.path(), b"{not json").await.unwrap();

        assert_eq!(reg.add_targets(&ips(&["10.0.0.1"]), 27684, TargetLabels::for_cluster("a")).await, 0);
        assert_eq!(reg.remove_targets(&ips(&["10.0.0.1:27684"])).await, 0);
        assert_eq!(tokio::fs::read(reg.path()).await.unwrap(), b"{not json");
        assert!(matches!(reg.load().await, Err(RegistryError::Parse { .. })));
        assert_eq!(reg.failures(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_adds_are_serialized() {
        let (_dir, reg) = registry();
        let reg = Arc::new(reg);

        let mut handles = Vec::new();
        for i in 0..16 {
            let reg = Arc::clone(&reg);
            handles.push(tokio::spawn(async move {
                reg.add_targets(&[format!("10.0.1.{i}")], 27684, TargetLabels::for_cluster("c")).await
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap(), 1);
        }

        let groups = reg.load().await.unwrap();
        assert_eq!(groups.len(), 16);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_separate_handles_on_one_file_keep_every_group() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("targets.json");

        let mut handles = Vec::new();
        for i in 0..32 {
            let reg = TargetRegistry::new(path.clone());
            handles.push(tokio::spawn(async move {
                reg.add_targets(&[format!("10.0.2.{i}")], 27684, TargetLabels::for_cluster("c")).await
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap(), 1);
        }

        let reg = TargetRegistry::new(path);
        assert_eq!(reg.load().await.unwrap().len(), 32);
        assert_eq!(reg.remove_targets(&["10.0.2.7:27684".to_string()]).await, 1);
        assert_eq!(reg.load().await.unwrap().len(), 31);

        // no temp files left behind
        let mut names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        assert_eq!(names, ["targets.json", "targets.json.lock"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_written_file_is_world_readable() {
        use std::os::unix::fs::PermissionsExt;

        let (_dir, reg) = registry();
        reg.add_targets(&ips(&["10.0.0.1"]), 27684, TargetLabels::for_cluster("a")).await;
        let mode = std::fs::metadata(reg.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
    }
}

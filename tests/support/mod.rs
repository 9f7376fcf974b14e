#![allow(dead_code)]
/// Shared helpers: throwaway git repositories for planner tests.
use git2::{Repository, Signature};
use scmp::config::Config;
use scmp::metadata::{serialize_with_header, FileMetadata};
use std::path::Path;

pub struct TestRepo {
    pub dir: tempfile::TempDir,
    pub repo: Repository,
}

pub fn init_repo() -> TestRepo {
    let dir = tempfile::tempdir().expect("tempdir");
    let repo = Repository::init(dir.path()).expect("git init");
    TestRepo { dir, repo }
}

impl TestRepo {
    /// Writes the given files into the working tree, stages everything
    /// listed, removes `deleted` from both, and commits. Returns the hex
    /// commit id.
    pub fn commit(&self, files: &[(&str, &[u8])], deleted: &[&str], message: &str) -> String {
        let workdir = self.repo.workdir().expect("workdir");
        for (rel, contents) in files {
            let path = workdir.join(rel);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).expect("mkdir");
            }
            std::fs::write(&path, contents).expect("write");
        }
        for rel in deleted {
            let path = workdir.join(rel);
            if path.exists() {
                std::fs::remove_file(&path).expect("rm");
            }
        }

        let mut index = self.repo.index().expect("index");
        for (rel, _) in files {
            index.add_path(Path::new(rel)).expect("add");
        }
        for rel in deleted {
            index.remove_path(Path::new(rel)).expect("remove");
        }
        index.write().expect("index write");
        let tree_id = index.write_tree().expect("write tree");
        let tree = self.repo.find_tree(tree_id).expect("find tree");

        let sig = Signature::now("tester", "tester@example.com").expect("signature");
        let parent = self.repo.head().ok().and_then(|h| h.peel_to_commit().ok());
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        let oid = self
            .repo
            .commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
            .expect("commit");
        oid.to_string()
    }

    /// Stages and commits a symlink at `rel` pointing at `target`.
    pub fn commit_symlink(&self, rel: &str, target: &str, message: &str) -> String {
        let workdir = self.repo.workdir().expect("workdir");
        let path = workdir.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("mkdir");
        }
        std::os::unix::fs::symlink(target, &path).expect("symlink");

        let mut index = self.repo.index().expect("index");
        index.add_path(Path::new(rel)).expect("add");
        index.write().expect("index write");
        let tree_id = index.write_tree().expect("write tree");
        let tree = self.repo.find_tree(tree_id).expect("find tree");

        let sig = Signature::now("tester", "tester@example.com").expect("signature");
        let parent = self.repo.head().ok().and_then(|h| h.peel_to_commit().ok());
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        self.repo
            .commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
            .expect("commit")
            .to_string()
    }

    /// Controller config whose RepositoryPath points at this repo.
    pub fn config(&self, extra_yaml: &str) -> Config {
        let raw = format!(
            "RepositoryPath: {}\n{}",
            self.dir.path().display(),
            extra_yaml
        );
        Config::parse(&raw).expect("config")
    }
}

/// A deployable file body wrapped in the standard metadata header.
pub fn headered(owner_group: &str, permissions: u32, reload: &[&str], body: &[u8]) -> Vec<u8> {
    let meta = FileMetadata {
        owner_group: owner_group.to_string(),
        permissions,
        reload_commands: reload.iter().map(|s| s.to_string()).collect(),
        ..FileMetadata::default()
    };
    serialize_with_header(&meta, body)
}

pub const HOSTS_YAML: &str = r#"UniversalDirectory: UniversalConfs
UniversalGroups:
  UniversalConfs_Web:
    - web
IgnoreDirectories:
  - docs
Hosts:
  webA:
    GroupTags: [web]
  webB:
    GroupTags: [web]
  db1: {}
"#;

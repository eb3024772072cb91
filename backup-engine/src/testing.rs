//! Test doubles shared by the unit tests.

use crate::apps::AppLauncher;
use crate::config::RepositoryConfig;
use crate::executor::{BackupRequest, BackupService, ExecutorSettings};
use crate::jobs::{Job, JobRegistry};
use crate::process::{CommandOutput, CommandRunner};
use crate::repository::{LocalFsRepository, ObjectInfo, ObjectRepository, StaticRepositoryProvider};
use crate::runtime::{Bind, BindSource, ContainerRuntime, TaskOutput, VolumeInfo, SCRATCH_MOUNT};
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;

pub fn valid_repository_config() -> RepositoryConfig {
    RepositoryConfig {
        endpoint: "http://minio:9000".into(),
        bucket: "volumes".into(),
        access_key: "minio".into(),
        secret_key: "minio-secret".into(),
        ..RepositoryConfig::default()
    }
}

/// Order-independent digest of a directory tree: relative paths and contents.
pub fn dir_checksum(dir: &Path) -> String {
    if !dir.exists() {
        return "missing".into();
    }
    let mut hasher = Sha256::new();
    for entry in walkdir::WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.unwrap();
        let rel = entry.path().strip_prefix(dir).unwrap();
        hasher.update(rel.to_string_lossy().as_bytes());
        if entry.file_type().is_file() {
            hasher.update(std::fs::read(entry.path()).unwrap());
        }
        hasher.update(b"\0");
    }
    hex::encode(hasher.finalize())
}

fn clear_dir(dir: &Path) {
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                std::fs::remove_dir_all(path).unwrap();
            } else {
                std::fs::remove_file(path).unwrap();
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecordedTask {
    pub image: String,
    pub cmd: Vec<String>,
    pub binds: Vec<Bind>,
}

/// Container runtime whose volumes are directories and whose helper tasks
/// run the archive and restore scripts with the `tar` crate.
pub struct FakeRuntime {
    root: PathBuf,
    tasks: Mutex<Vec<RecordedTask>>,
    removed: Mutex<Vec<String>>,
    fail_archive: Mutex<HashSet<String>>,
    fail_restore_once: Mutex<HashSet<String>>,
    held: watch::Sender<bool>,
}

impl FakeRuntime {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.join("volumes"),
            tasks: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
            fail_archive: Mutex::new(HashSet::new()),
            fail_restore_once: Mutex::new(HashSet::new()),
            held: watch::channel(false).0,
        }
    }

    pub fn volume_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Create or replace a volume with exactly these files.
    pub fn seed_volume(&self, name: &str, files: &[(&str, &str)]) {
        let dir = self.volume_path(name);
        std::fs::create_dir_all(&dir).unwrap();
        clear_dir(&dir);
        for (rel, content) in files {
            let path = dir.join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, content).unwrap();
        }
    }

    pub fn remove_volume_dir(&self, name: &str) {
        std::fs::remove_dir_all(self.volume_path(name)).unwrap();
    }

    pub fn read(&self, volume: &str, rel: &str) -> Option<String> {
        std::fs::read_to_string(self.volume_path(volume).join(rel)).ok()
    }

    pub fn fail_archive(&self, volume: &str) {
        self.fail_archive.lock().unwrap().insert(volume.to_string());
    }

    /// The next restore into `volume` wipes it and then fails.
    pub fn fail_restore_once(&self, volume: &str) {
        self.fail_restore_once.lock().unwrap().insert(volume.to_string());
    }

    pub fn hold_tasks(&self) {
        self.held.send_replace(true);
    }

    pub fn release_tasks(&self) {
        self.held.send_replace(false);
    }

    pub fn tasks(&self) -> Vec<RecordedTask> {
        self.tasks.lock().unwrap().clone()
    }

    pub fn removed_volumes(&self) -> Vec<String> {
        self.removed.lock().unwrap().clone()
    }

    fn scratch_file(script: &str, flag: &str) -> Option<String> {
        let needle = format!("{flag} {SCRATCH_MOUNT}/");
        let start = script.find(&needle)? + needle.len();
        script[start..].split_whitespace().next().map(str::to_string)
    }

    fn execute(&self, cmd: &[String], binds: &[Bind]) -> TaskOutput {
        let script = cmd.last().cloned().unwrap_or_default();
        let volume = binds.iter().find_map(|b| match &b.source {
            BindSource::Volume(name) => Some(name.clone()),
            BindSource::HostPath(_) => None,
        });
        let scratch = binds.iter().find_map(|b| match &b.source {
            BindSource::HostPath(path) if b.target == SCRATCH_MOUNT => Some(path.clone()),
            _ => None,
        });
        let (Some(volume), Some(scratch)) = (volume, scratch) else {
            return TaskOutput {
                exit_code: 125,
                logs: "missing binds".into(),
            };
        };
        let volume_dir = self.volume_path(&volume);
        // Binding a missing named volume creates it
        std::fs::create_dir_all(&volume_dir).unwrap();

        if let Some(file) = Self::scratch_file(&script, "tar -czf") {
            if self.fail_archive.lock().unwrap().contains(&volume) {
                return TaskOutput {
                    exit_code: 1,
                    logs: "tar: simulated failure\n".into(),
                };
            }
            let out = std::fs::File::create(scratch.join(file)).unwrap();
            let mut builder = tar::Builder::new(out);
            builder.append_dir_all(".", &volume_dir).unwrap();
            builder.into_inner().unwrap();
            return TaskOutput::default();
        }

        if let Some(file) = Self::scratch_file(&script, "tar -xzf") {
            clear_dir(&volume_dir);
            if self.fail_restore_once.lock().unwrap().remove(&volume) {
                return TaskOutput {
                    exit_code: 2,
                    logs: "tar: unexpected end of archive\n".into(),
                };
            }
            let input = std::fs::File::open(scratch.join(file)).unwrap();
            tar::Archive::new(input).unpack(&volume_dir).unwrap();
            return TaskOutput::default();
        }

        TaskOutput {
            exit_code: 127,
            logs: format!("unknown script: {script}"),
        }
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn run_ephemeral_task(&self, image: &str, cmd: &[String], binds: &[Bind]) -> Result<TaskOutput> {
        let mut held = self.held.subscribe();
        let _ = held.wait_for(|h| !*h).await;

        self.tasks.lock().unwrap().push(RecordedTask {
            image: image.to_string(),
            cmd: cmd.to_vec(),
            binds: binds.to_vec(),
        });
        Ok(self.execute(cmd, binds))
    }

    async fn create_volume(&self, name: &str) -> Result<VolumeInfo> {
        let mountpoint = self.volume_path(name);
        std::fs::create_dir_all(&mountpoint)?;
        Ok(VolumeInfo {
            name: name.to_string(),
            mountpoint,
        })
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        let path = self.volume_path(name);
        if path.exists() {
            std::fs::remove_dir_all(path)?;
        }
        self.removed.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn inspect_volume(&self, name: &str) -> Result<Option<VolumeInfo>> {
        let mountpoint = self.volume_path(name);
        Ok(mountpoint.is_dir().then(|| VolumeInfo {
            name: name.to_string(),
            mountpoint,
        }))
    }
}

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

/// Command runner that records calls and succeeds unless told otherwise.
#[derive(Default)]
pub struct ScriptedRunner {
    calls: Mutex<Vec<RecordedCall>>,
    failures: Mutex<Vec<(String, String)>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail any call with an argument containing `needle`.
    pub fn fail_when(&self, needle: &str, stderr: &str) {
        self.failures
            .lock()
            .unwrap()
            .push((needle.to_string(), stderr.to_string()));
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, program: &str, args: &[String], env: &[(String, String)]) -> Result<CommandOutput> {
        self.calls.lock().unwrap().push(RecordedCall {
            program: program.to_string(),
            args: args.to_vec(),
            env: env.to_vec(),
        });
        let failure = self
            .failures
            .lock()
            .unwrap()
            .iter()
            .find(|(needle, _)| args.iter().any(|a| a.contains(needle.as_str())))
            .map(|(_, stderr)| stderr.clone());
        Ok(match failure {
            Some(stderr) => CommandOutput {
                stderr,
                exit_code: 1,
                ..Default::default()
            },
            None => CommandOutput::default(),
        })
    }
}

#[derive(Debug, Clone)]
struct FakeSnapshot {
    id: String,
    time: chrono::DateTime<Utc>,
    tags: Vec<String>,
    paths: Vec<String>,
}

impl FakeSnapshot {
    fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "short_id": &self.id[..8],
            "time": self.time.to_rfc3339(),
            "tags": self.tags,
            "paths": self.paths,
            "hostname": "test",
            "summary": { "total_bytes_processed": 4096 },
        })
    }

    fn matches(&self, id: &str) -> bool {
        self.id == id || &self.id[..8] == id
    }
}

#[derive(Default)]
struct ResticState {
    initialized: bool,
    counter: u64,
    snapshots: Vec<FakeSnapshot>,
    check_fails: bool,
    calls: Vec<RecordedCall>,
}

/// In-memory stand-in for the restic CLI.
#[derive(Default)]
pub struct FakeRestic {
    state: Mutex<ResticState>,
}

fn ok(stdout: String) -> CommandOutput {
    CommandOutput {
        stdout,
        ..Default::default()
    }
}

fn fatal(stderr: &str) -> CommandOutput {
    CommandOutput {
        stderr: stderr.to_string(),
        exit_code: 1,
        ..Default::default()
    }
}

fn flag_values<'a>(args: &'a [String], flag: &str) -> Vec<&'a str> {
    args.windows(2)
        .filter(|w| w[0] == flag)
        .map(|w| w[1].as_str())
        .collect()
}

impl FakeRestic {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, command: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.args.first().map(String::as_str) == Some(command))
            .count()
    }

    pub fn last_call(&self) -> Option<RecordedCall> {
        self.state.lock().unwrap().calls.last().cloned()
    }

    pub fn set_check_fails(&self, fails: bool) {
        self.state.lock().unwrap().check_fails = fails;
    }

    fn handle(state: &mut ResticState, args: &[String]) -> CommandOutput {
        let filter_tags: Vec<String> = flag_values(args, "--tag")
            .iter()
            .flat_map(|t| t.split(','))
            .map(str::to_string)
            .collect();
        let tagged = |s: &FakeSnapshot| filter_tags.iter().all(|t| s.tags.contains(t));

        match args.first().map(String::as_str) {
            Some("init") => {
                if state.initialized {
                    return fatal("Fatal: create repository failed: config file already exists");
                }
                state.initialized = true;
                ok("created restic repository".into())
            }
            Some("backup") => {
                state.counter += 1;
                let id = format!("{:08x}{}", state.counter, "ab".repeat(28));
                let base = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
                state.snapshots.push(FakeSnapshot {
                    id: id.clone(),
                    time: base + ChronoDuration::minutes(state.counter as i64),
                    tags: flag_values(args, "--tag").iter().map(|t| t.to_string()).collect(),
                    paths: args.last().cloned().into_iter().collect(),
                });
                ok(format!(
                    "{}\n{}\n",
                    serde_json::json!({"message_type": "status", "percent_done": 1.0}),
                    serde_json::json!({"message_type": "summary", "snapshot_id": id})
                ))
            }
            Some("snapshots") => {
                let listed: Vec<_> = state.snapshots.iter().filter(|s| tagged(s)).map(FakeSnapshot::to_json).collect();
                ok(serde_json::Value::Array(listed).to_string())
            }
            Some("forget") => match args.get(1) {
                Some(id) if !id.starts_with("--") => {
                    let before = state.snapshots.len();
                    state.snapshots.retain(|s| !s.matches(id));
                    if state.snapshots.len() == before {
                        return fatal(&format!("Ignoring \"{id}\": no matching ID found"));
                    }
                    ok(String::new())
                }
                _ => {
                    if let Some(keep) = flag_values(args, "--keep-last").first() {
                        let keep: usize = keep.parse().unwrap();
                        let mut matching: Vec<FakeSnapshot> =
                            state.snapshots.iter().filter(|s| tagged(s)).cloned().collect();
                        matching.sort_by(|a, b| b.time.cmp(&a.time));
                        let drop: Vec<String> = matching.iter().skip(keep).map(|s| s.id.clone()).collect();
                        state.snapshots.retain(|s| !drop.contains(&s.id));
                    }
                    ok(String::new())
                }
            },
            Some("stats") => {
                let id = args.get(1).cloned().unwrap_or_default();
                if state.snapshots.iter().any(|s| s.matches(&id)) {
                    ok(serde_json::json!({"total_size": 4096, "total_file_count": 3}).to_string())
                } else {
                    fatal("Fatal: no matching ID found")
                }
            }
            Some("check") if state.check_fails => fatal("Fatal: repository contains errors"),
            Some("check") | Some("prune") | Some("restore") => ok(String::new()),
            _ => fatal("unknown command"),
        }
    }
}

#[async_trait]
impl CommandRunner for FakeRestic {
    async fn run(&self, program: &str, args: &[String], env: &[(String, String)]) -> Result<CommandOutput> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(RecordedCall {
            program: program.to_string(),
            args: args.to_vec(),
            env: env.to_vec(),
        });
        Ok(Self::handle(&mut state, args))
    }
}

#[derive(Default)]
pub struct RecordingLauncher {
    restarted: Mutex<Vec<Vec<String>>>,
    fail: Mutex<bool>,
}

impl RecordingLauncher {
    pub fn restarted(&self) -> Vec<Vec<String>> {
        self.restarted.lock().unwrap().clone()
    }

    /// Every later restart fails without recording anything.
    pub fn fail_restarts(&self) {
        *self.fail.lock().unwrap() = true;
    }
}

#[async_trait]
impl AppLauncher for RecordingLauncher {
    async fn restart_apps(&self, app_ids: &[String]) -> Result<()> {
        if *self.fail.lock().unwrap() {
            return Err(EngineError::Execution(format!(
                "docker compose up failed for {}",
                app_ids.join(", ")
            )));
        }
        self.restarted.lock().unwrap().push(app_ids.to_vec());
        Ok(())
    }
}

/// Local repository that records upload order and can silently lose uploads.
pub struct TestRepository {
    inner: LocalFsRepository,
    put_order: Mutex<Vec<String>>,
    lose: Mutex<Option<String>>,
}

impl TestRepository {
    pub fn new(root: &Path) -> Self {
        Self {
            inner: LocalFsRepository::new(root),
            put_order: Mutex::new(Vec::new()),
            lose: Mutex::new(None),
        }
    }

    pub fn put_order(&self) -> Vec<String> {
        self.put_order.lock().unwrap().clone()
    }

    /// Uploads whose key contains `pattern` report success but store nothing.
    pub fn drop_uploads_matching(&self, pattern: &str) {
        *self.lose.lock().unwrap() = Some(pattern.to_string());
    }

    fn record(&self, key: &str) -> bool {
        self.put_order.lock().unwrap().push(key.to_string());
        !self
            .lose
            .lock()
            .unwrap()
            .as_deref()
            .is_some_and(|p| key.contains(p))
    }
}

#[async_trait]
impl ObjectRepository for TestRepository {
    async fn put_file(&self, key: &str, path: &Path) -> Result<u64> {
        if self.record(key) {
            self.inner.put_file(key, path).await
        } else {
            Ok(std::fs::metadata(path)?.len())
        }
    }

    async fn put_bytes(&self, key: &str, data: Bytes) -> Result<()> {
        if self.record(key) {
            self.inner.put_bytes(key, data).await
        } else {
            Ok(())
        }
    }

    async fn get_bytes(&self, key: &str) -> Result<Option<Bytes>> {
        self.inner.get_bytes(key).await
    }

    async fn get_to_file(&self, key: &str, path: &Path) -> Result<bool> {
        self.inner.get_to_file(key, path).await
    }

    async fn stat(&self, key: &str) -> Result<Option<ObjectInfo>> {
        self.inner.stat(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        self.inner.list(prefix).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key).await
    }
}

/// A backup service wired to fakes under one temporary directory.
pub struct Harness {
    pub temp: TempDir,
    pub repo: Arc<TestRepository>,
    pub runtime: Arc<FakeRuntime>,
    pub launcher: Arc<RecordingLauncher>,
    pub service: BackupService,
}

impl Harness {
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let repo = Arc::new(TestRepository::new(&temp.path().join("bucket")));
        let runtime = Arc::new(FakeRuntime::new(temp.path()));
        let launcher = Arc::new(RecordingLauncher::default());
        let settings = ExecutorSettings {
            helper_image: "alpine".into(),
            scratch_dir: temp.path().join("scratch"),
            apps_dir: temp.path().join("apps"),
        };
        let service = BackupService::new(
            Arc::new(StaticRepositoryProvider::new(repo.clone(), "backups")),
            runtime.clone(),
            launcher.clone(),
            JobRegistry::in_memory(),
            settings,
        );
        Self {
            temp,
            repo,
            runtime,
            launcher,
            service,
        }
    }

    pub fn app_dir(&self, app_id: &str) -> PathBuf {
        self.temp.path().join("apps").join(app_id)
    }

    pub async fn wait(&self, job_id: &str) -> Job {
        self.service
            .jobs()
            .wait_for_terminal(job_id, Some(Duration::from_secs(10)))
            .await
            .unwrap()
            .expect("job did not finish")
    }

    pub async fn backup(&self, request: BackupRequest) -> Job {
        let job_id = self.service.create_backup(request).await.unwrap();
        self.wait(&job_id).await
    }
}

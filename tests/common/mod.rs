//! Common test utilities: an in-process exporter wired to a temporary
//! repository layout and a clone backend that copies instead of
//! reflinking.

use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::net::TcpListener;

use coriolis_ovm_exporter::auth::{issue_token, OvmClient};
use coriolis_ovm_exporter::config::{ApiServerConfig, Config, JwtConfig};
use coriolis_ovm_exporter::db::Database;
use coriolis_ovm_exporter::error::{ExporterError, ExporterResult};
use coriolis_ovm_exporter::inventory::{repos::Repo, HostInventory};
use coriolis_ovm_exporter::models::Chunk;
use coriolis_ovm_exporter::{create_router, AppState, CloneBackend, SnapshotManager};

pub const VM1: &str = "0004fb0000060001";
pub const VM2: &str = "0004fb0000060002";
pub const VM3: &str = "0004fb0000060003";

const BLOCK_SIZE: usize = 4096;

/// Clone backend for tests: copies the file and synthesizes one chunk per
/// 4 KiB block with a content-derived physical address, so rewriting a
/// block moves it physically exactly like a CoW filesystem would.
pub struct FakeBackend {
    clones_before_failure: Option<AtomicUsize>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            clones_before_failure: None,
        }
    }

    /// Backend whose clone operation fails after `n` successful clones.
    pub fn failing_after(n: usize) -> Self {
        Self {
            clones_before_failure: Some(AtomicUsize::new(n)),
        }
    }
}

impl CloneBackend for FakeBackend {
    fn clone_file(&self, src: &Path, dst: &Path) -> ExporterResult<()> {
        if let Some(remaining) = &self.clones_before_failure {
            if remaining.fetch_sub(1, Ordering::SeqCst) == 0 {
                return Err(ExporterError::io(
                    "creating reflink",
                    std::io::Error::other("injected clone failure"),
                ));
            }
        }
        if dst.exists() {
            return Err(ExporterError::io(
                format!("creating {}", dst.display()),
                std::io::Error::from(std::io::ErrorKind::AlreadyExists),
            ));
        }
        fs::copy(src, dst)
            .map_err(|e| ExporterError::io(format!("copying {}", src.display()), e))?;
        Ok(())
    }

    fn extents(&self, path: &Path) -> ExporterResult<Vec<Chunk>> {
        let data =
            fs::read(path).map_err(|e| ExporterError::io(format!("reading {}", path.display()), e))?;
        let mut chunks = Vec::new();
        for (idx, block) in data.chunks(BLOCK_SIZE).enumerate() {
            let mut hasher = DefaultHasher::new();
            block.hash(&mut hasher);
            chunks.push(Chunk {
                start: (idx * BLOCK_SIZE) as u64,
                length: block.len() as u64,
                physical: hasher.finish(),
            });
        }
        Ok(chunks)
    }
}

/// An exporter instance listening on a random local port, backed by a
/// temporary repository tree.
pub struct TestEnv {
    pub base_url: String,
    pub token: String,
    pub client: reqwest::Client,
    pub repo_root: PathBuf,
    _tmp: TempDir,
}

impl TestEnv {
    pub async fn start() -> Self {
        Self::start_with_backend(Arc::new(FakeBackend::new())).await
    }

    pub async fn start_with_backend(backend: Arc<dyn CloneBackend>) -> Self {
        let tmp = TempDir::new().unwrap();
        let repo_root = tmp.path().join("repo1");

        let disks_dir = repo_root.join("VirtualDisks");
        fs::create_dir_all(&disks_dir).unwrap();

        // vm1: two populated disks.
        fs::write(disks_dir.join("root.img"), vec![0xAAu8; 2 * BLOCK_SIZE]).unwrap();
        fs::write(disks_dir.join("data.img"), vec![0xBBu8; BLOCK_SIZE]).unwrap();
        write_vm_cfg(
            &repo_root,
            VM1,
            "test-vm-one",
            &[
                (disks_dir.join("root.img"), "xvda"),
                (disks_dir.join("data.img"), "xvdb"),
            ],
        );

        // vm2: a single thinly provisioned (empty) disk.
        fs::write(disks_dir.join("thin.img"), b"").unwrap();
        write_vm_cfg(&repo_root, VM2, "test-vm-two", &[(disks_dir.join("thin.img"), "xvda")]);

        // vm3: a disk the repo metadata classifies as an ISO, not a
        // virtual disk, making the VM non-cloneable.
        fs::write(disks_dir.join("installer.iso"), vec![0xCCu8; BLOCK_SIZE]).unwrap();
        write_vm_cfg(
            &repo_root,
            VM3,
            "test-vm-three",
            &[(disks_dir.join("installer.iso"), "xvda")],
        );
        fs::write(
            repo_root.join(".ovsmeta"),
            r#"{"installer.iso": {"OBJECT_TYPE": "ISO", "SIMPLE_NAME": "installer"}}"#,
        )
        .unwrap();

        let repo = Repo {
            id: "repo1".into(),
            mount_point: repo_root.clone(),
            filesystem: "ocfs2".into(),
            alias: Some("repo-one".into()),
        };

        let config = Arc::new(Config {
            db_file: tmp.path().join("exporter.db"),
            ovm_endpoint: Some("https://127.0.0.1:1".into()),
            api: ApiServerConfig::default(),
            jwt: JwtConfig {
                secret: "integration-test-secret".into(),
                time_to_live: Duration::from_secs(3600),
            },
            log_file: None,
        });

        let db = Database::open(&config.db_file).unwrap();
        let inventory = Arc::new(HostInventory::with_repos(vec![repo]));
        let manager = Arc::new(SnapshotManager::new(db, inventory, backend));
        let ovm = Arc::new(OvmClient::new(config.ovm_endpoint.as_deref().unwrap()).unwrap());

        let token = issue_token(&config.jwt, "admin").unwrap();

        let state = AppState {
            config,
            manager,
            ovm,
        };
        let app = create_router(state);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{addr}/api/v1"),
            token,
            client: reqwest::Client::new(),
            repo_root,
            _tmp: tmp,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.client.get(self.url(path)).bearer_auth(&self.token)
    }

    pub fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.client.post(self.url(path)).bearer_auth(&self.token)
    }

    pub fn delete(&self, path: &str) -> reqwest::RequestBuilder {
        self.client.delete(self.url(path)).bearer_auth(&self.token)
    }

    pub fn head(&self, path: &str) -> reqwest::RequestBuilder {
        self.client.head(self.url(path)).bearer_auth(&self.token)
    }

    /// Path of a source disk image inside the test repository.
    pub fn disk_path(&self, name: &str) -> PathBuf {
        self.repo_root.join("VirtualDisks").join(name)
    }

    /// Overwrites one 4 KiB block of a source disk, simulating guest
    /// writes between snapshots.
    pub fn rewrite_block(&self, disk: &str, block: usize, fill: u8) {
        let path = self.disk_path(disk);
        let mut data = fs::read(&path).unwrap();
        let start = block * BLOCK_SIZE;
        data[start..start + BLOCK_SIZE].fill(fill);
        fs::write(&path, data).unwrap();
    }

    /// Directory holding the clones of one snapshot.
    pub fn snapshot_dir(&self, snap_id: &str) -> PathBuf {
        self.repo_root.join("CoriolisSnapshots").join(snap_id)
    }
}

fn write_vm_cfg(repo_root: &Path, name: &str, simple_name: &str, disks: &[(PathBuf, &str)]) {
    let vm_dir = repo_root.join("VirtualMachines").join(name);
    fs::create_dir_all(&vm_dir).unwrap();
    let disk_entries: Vec<String> = disks
        .iter()
        .map(|(path, device)| format!("'file:{},{},w'", path.display(), device))
        .collect();
    let cfg = format!(
        "OVM_simple_name = '{simple_name}'\n\
         name = '{name}'\n\
         uuid = '{name}'\n\
         disk = [{}]\n\
         memory = 2048\n",
        disk_entries.join(", ")
    );
    fs::write(vm_dir.join("vm.cfg"), cfg).unwrap();
}

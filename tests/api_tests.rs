//! End-to-end API tests.

mod common;

use std::sync::Arc;

use common::{FakeBackend, TestEnv, VM1, VM2, VM3};
use coriolis_ovm_exporter::models::{ApiErrorResponse, VirtualMachine, VmSnapshot};

#[tokio::test]
async fn requests_without_token_are_rejected() {
    let env = TestEnv::start().await;

    let response = env.client.get(env.url("/vms")).send().await.unwrap();
    assert_eq!(response.status(), 401);
    let body: ApiErrorResponse = response.json().await.unwrap();
    assert_eq!(body.error, "Authentication failed");
    assert_eq!(body.details, "Invalid authentication token");
}

#[tokio::test]
async fn requests_with_garbage_token_are_rejected() {
    let env = TestEnv::start().await;

    let response = env
        .client
        .get(env.url("/vms"))
        .bearer_auth("not-a-token")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn login_with_unreachable_manager_is_unauthorized() {
    let env = TestEnv::start().await;

    let response = env
        .client
        .post(env.url("/auth/login"))
        .json(&serde_json::json!({"username": "admin", "password": "password"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn unknown_routes_return_json_404() {
    let env = TestEnv::start().await;

    let response = env.get("/no/such/route").send().await.unwrap();
    assert_eq!(response.status(), 404);
    let body: ApiErrorResponse = response.json().await.unwrap();
    assert_eq!(body.error, "Not Found");
}

#[tokio::test]
async fn list_vms_reports_inventory() {
    let env = TestEnv::start().await;

    let response = env.get("/vms").send().await.unwrap();
    assert_eq!(response.status(), 200);
    let mut vms: Vec<VirtualMachine> = response.json().await.unwrap();
    vms.sort_by(|a, b| a.name.cmp(&b.name));
    assert_eq!(vms.len(), 3);

    let vm1 = &vms[0];
    assert_eq!(vm1.name, VM1);
    assert_eq!(vm1.friendly_name, "test-vm-one");
    assert_eq!(vm1.disks.len(), 2);
    assert!(vm1.snapshot_compatible);
    assert!(vm1.snapshots.is_empty());

    // vm3's only disk is classified as an ISO in the repo metadata.
    let vm3 = &vms[2];
    assert_eq!(vm3.name, VM3);
    assert!(!vm3.snapshot_compatible);
    assert!(!vm3.disks[0].snapshot_compatible);
}

#[tokio::test]
async fn get_unknown_vm_is_404() {
    let env = TestEnv::start().await;
    let response = env.get("/vms/does-not-exist").send().await.unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn create_snapshot_persists_clones_and_metadata() {
    let env = TestEnv::start().await;

    let response = env.post(&format!("/vms/{VM1}/snapshots")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    let snapshot: VmSnapshot = response.json().await.unwrap();
    assert!(!snapshot.id.is_empty());
    assert_eq!(snapshot.vm_id, VM1);
    assert_eq!(snapshot.disks.len(), 2);

    for disk in &snapshot.disks {
        let clone = env.snapshot_dir(&snapshot.id).join(&disk.name);
        assert!(clone.is_file(), "missing clone {}", clone.display());
        assert_eq!(disk.path, clone.display().to_string());
        assert!(!disk.chunks.is_empty());
        assert!(!disk.parent_path.is_empty());
    }

    // The snapshot id shows up both in the snapshot list and on the VM.
    let listed: Vec<VmSnapshot> = env
        .get(&format!("/vms/{VM1}/snapshots"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, snapshot.id);

    let vm: VirtualMachine = env
        .get(&format!("/vms/{VM1}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(vm.snapshots, vec![snapshot.id]);
}

#[tokio::test]
async fn snapshots_list_in_creation_order() {
    let env = TestEnv::start().await;

    let first: VmSnapshot = env
        .post(&format!("/vms/{VM1}/snapshots"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let second: VmSnapshot = env
        .post(&format!("/vms/{VM1}/snapshots"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let listed: Vec<VmSnapshot> = env
        .get(&format!("/vms/{VM1}/snapshots"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let ids: Vec<&str> = listed.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, vec![first.id.as_str(), second.id.as_str()]);
}

#[tokio::test]
async fn thin_disk_snapshot_has_no_chunks() {
    let env = TestEnv::start().await;

    let snapshot: VmSnapshot = env
        .post(&format!("/vms/{VM2}/snapshots"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(snapshot.disks.len(), 1);
    assert!(snapshot.disks[0].chunks.is_empty());

    let fetched = env
        .get(&format!("/vms/{VM2}/snapshots/{}", snapshot.id))
        .send()
        .await
        .unwrap();
    assert_eq!(fetched.status(), 200);
    let fetched: VmSnapshot = fetched.json().await.unwrap();
    assert!(fetched.disks[0].chunks.is_empty());
}

#[tokio::test]
async fn create_snapshot_of_non_cloneable_vm_is_rejected() {
    let env = TestEnv::start().await;

    let response = env.post(&format!("/vms/{VM3}/snapshots")).send().await.unwrap();
    assert_eq!(response.status(), 400);
    assert!(!env.repo_root.join("CoriolisSnapshots").exists());
}

#[tokio::test]
async fn get_snapshot_squashes_chunks_by_default() {
    let env = TestEnv::start().await;

    let snapshot: VmSnapshot = env
        .post(&format!("/vms/{VM1}/snapshots"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    // root.img spans two contiguous blocks: squashed they become one.
    let squashed: VmSnapshot = env
        .get(&format!("/vms/{VM1}/snapshots/{}", snapshot.id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let root = squashed.disks.iter().find(|d| d.name == "root.img").unwrap();
    assert_eq!(root.chunks.len(), 1);
    assert_eq!(root.chunks[0].length, 8192);

    let raw: VmSnapshot = env
        .get(&format!(
            "/vms/{VM1}/snapshots/{}?squashChunks=false",
            snapshot.id
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let root = raw.disks.iter().find(|d| d.name == "root.img").unwrap();
    assert_eq!(root.chunks.len(), 2);
}

#[tokio::test]
async fn diff_returns_only_rewritten_chunks() {
    let env = TestEnv::start().await;

    let older: VmSnapshot = env
        .post(&format!("/vms/{VM1}/snapshots"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    // Rewrite the second block of root.img between snapshots.
    env.rewrite_block("root.img", 1, 0x5A);

    let newer: VmSnapshot = env
        .post(&format!("/vms/{VM1}/snapshots"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let diffed: VmSnapshot = env
        .get(&format!(
            "/vms/{VM1}/snapshots/{}?compareTo={}&squashChunks=false",
            newer.id, older.id
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let root = diffed.disks.iter().find(|d| d.name == "root.img").unwrap();
    assert_eq!(root.chunks.len(), 1);
    assert_eq!(root.chunks[0].start, 4096);

    // The untouched disk diffs to empty.
    let data = diffed.disks.iter().find(|d| d.name == "data.img").unwrap();
    assert!(data.chunks.is_empty());
}

#[tokio::test]
async fn diff_against_newer_snapshot_is_bad_request() {
    let env = TestEnv::start().await;

    let older: VmSnapshot = env
        .post(&format!("/vms/{VM1}/snapshots"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let newer: VmSnapshot = env
        .post(&format!("/vms/{VM1}/snapshots"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let response = env
        .get(&format!(
            "/vms/{VM1}/snapshots/{}?compareTo={}",
            older.id, newer.id
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn diff_against_missing_snapshot_is_404() {
    let env = TestEnv::start().await;

    let snapshot: VmSnapshot = env
        .post(&format!("/vms/{VM1}/snapshots"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let response = env
        .get(&format!(
            "/vms/{VM1}/snapshots/{}?compareTo=missing",
            snapshot.id
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn snapshot_of_another_vm_is_a_conflict() {
    let env = TestEnv::start().await;

    let snapshot: VmSnapshot = env
        .post(&format!("/vms/{VM1}/snapshots"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let response = env
        .get(&format!("/vms/{VM2}/snapshots/{}", snapshot.id))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 409);
    let body: ApiErrorResponse = response.json().await.unwrap();
    assert_eq!(body.error, "Conflict");

    // Deleting through the wrong VM is also a conflict, and leaves the
    // snapshot alone.
    let response = env
        .delete(&format!("/vms/{VM2}/snapshots/{}", snapshot.id))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 409);
    assert!(env.snapshot_dir(&snapshot.id).is_dir());
}

#[tokio::test]
async fn delete_snapshot_removes_state_and_is_idempotent() {
    let env = TestEnv::start().await;

    let snapshot: VmSnapshot = env
        .post(&format!("/vms/{VM1}/snapshots"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(env.snapshot_dir(&snapshot.id).is_dir());

    let response = env
        .delete(&format!("/vms/{VM1}/snapshots/{}", snapshot.id))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert!(!env.snapshot_dir(&snapshot.id).exists());

    let response = env
        .get(&format!("/vms/{VM1}/snapshots/{}", snapshot.id))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    // Deleting again succeeds and changes nothing.
    let response = env
        .delete(&format!("/vms/{VM1}/snapshots/{}", snapshot.id))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn purge_deletes_every_snapshot_of_the_vm() {
    let env = TestEnv::start().await;

    for _ in 0..2 {
        let response = env.post(&format!("/vms/{VM1}/snapshots")).send().await.unwrap();
        assert_eq!(response.status(), 200);
    }

    let response = env.delete(&format!("/vms/{VM1}/snapshots")).send().await.unwrap();
    assert_eq!(response.status(), 200);

    let listed: Vec<VmSnapshot> = env
        .get(&format!("/vms/{VM1}/snapshots"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(listed.is_empty());

    // Purging an already clean VM succeeds.
    let response = env.delete(&format!("/vms/{VM1}/snapshots")).send().await.unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn failed_create_rolls_back_all_clones() {
    let env = TestEnv::start_with_backend(Arc::new(FakeBackend::failing_after(1))).await;

    let response = env.post(&format!("/vms/{VM1}/snapshots")).send().await.unwrap();
    assert_eq!(response.status(), 500);

    // No snapshot directory survives and nothing is listed.
    assert!(!env.repo_root.join("CoriolisSnapshots").exists());
    let listed: Vec<VmSnapshot> = env
        .get(&format!("/vms/{VM1}/snapshots"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(listed.is_empty());
}

#[tokio::test]
async fn disk_reads_support_ranges_and_head() {
    let env = TestEnv::start().await;

    let snapshot: VmSnapshot = env
        .post(&format!("/vms/{VM1}/snapshots"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let disk_url = format!("/vms/{VM1}/snapshots/{}/disks/root.img", snapshot.id);

    // Full read returns the clone bytes.
    let response = env.get(&disk_url).send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("accept-ranges").unwrap(),
        "bytes"
    );
    let body = response.bytes().await.unwrap();
    assert_eq!(body.len(), 8192);
    assert!(body.iter().all(|&b| b == 0xAA));

    // Range read.
    let response = env
        .get(&disk_url)
        .header("Range", "bytes=4096-4099")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 206);
    assert_eq!(
        response.headers().get("content-range").unwrap(),
        "bytes 4096-4099/8192"
    );
    let body = response.bytes().await.unwrap();
    assert_eq!(body.as_ref(), &[0xAA, 0xAA, 0xAA, 0xAA]);

    // HEAD reports the on-disk size without a body.
    let response = env.head(&disk_url).send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response
            .headers()
            .get("content-length")
            .unwrap()
            .to_str()
            .unwrap(),
        "8192"
    );
}

#[tokio::test]
async fn unknown_disk_is_404() {
    let env = TestEnv::start().await;

    let snapshot: VmSnapshot = env
        .post(&format!("/vms/{VM1}/snapshots"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let response = env
        .get(&format!(
            "/vms/{VM1}/snapshots/{}/disks/nope.img",
            snapshot.id
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    let response = env
        .get(&format!("/vms/{VM1}/snapshots/missing/disks/root.img"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

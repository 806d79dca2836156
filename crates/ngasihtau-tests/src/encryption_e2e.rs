//! End-to-end protection flow: register, license, background-encrypt,
//! download, and client-side decrypt.

use chrono::Utc;

use ngasihtau_core::audit::RequestContext;
use ngasihtau_core::blob::BlobStore;
use ngasihtau_core::id::Id;
use ngasihtau_core::model::{JobPriority, JobStatus};
use ngasihtau_core::repo::{EncryptedMaterialRepository, EncryptionJobRepository};
use ngasihtau_crypto::codec::decrypt_file;
use ngasihtau_jobs::manager::JobOutcome;

use crate::harness::{TestStack, FINGERPRINT};

const MIB: usize = 1_048_576;

fn source_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test]
async fn test_full_flow_encrypt_download_decrypt() {
    let stack = TestStack::new();
    let user = Id::generate();
    let material = Id::generate();
    let device = stack.register_device(user).await;
    let license = stack.issue_license(user, material, device.id).await;

    // 2.5 MiB source: three chunks at the production chunk size.
    let plaintext = source_bytes(2 * MIB + 500);
    stack.seed_source(material, plaintext.clone()).await;

    let job = stack
        .jobs
        .create_job(material, user, device.id, license.id, JobPriority::High)
        .await
        .unwrap();
    assert_eq!(
        stack.jobs.run_job(job.id).await.unwrap(),
        JobOutcome::Completed
    );
    assert_eq!(
        stack.job_repo.get(job.id).await.unwrap().unwrap().status,
        JobStatus::Completed
    );

    let grant = stack
        .coordinator
        .prepare_download(
            &RequestContext::system(),
            user,
            material,
            device.id,
            license.id,
            FINGERPRINT,
            Utc::now(),
        )
        .await
        .unwrap();

    let manifest = &grant.manifest;
    manifest.validate().unwrap();
    assert_eq!(manifest.total_size, plaintext.len() as u64);
    assert_eq!(manifest.total_chunks, 3);
    assert_eq!(manifest.chunk_size, MIB as u64);
    assert_eq!(manifest.chunks[0].offset, 0);
    assert_eq!(manifest.chunks[1].offset, 1_048_604);
    assert_eq!(manifest.chunks[2].offset, 2_097_208);
    assert_eq!(manifest.file_type, "pdf");
    assert!(grant.url.contains("sig="));

    // Client side: fetch the encrypted stream, unwrap the CEK, decrypt.
    let stored = stack
        .material_repo
        .find_by_material(material)
        .await
        .unwrap()
        .unwrap();
    let encrypted = stack.blob.get(&stored.encrypted_file_key).await.unwrap();
    assert_eq!(
        ngasihtau_crypto::primitives::sha256_hex(&encrypted),
        manifest.encrypted_hash
    );

    let cek_record = stack
        .cek_repo_record(user, material, device.id)
        .await;
    let cek = stack.keys.unwrap_cek(&cek_record).unwrap();
    let decrypted = decrypt_file(&encrypted, &cek, &manifest.chunks).unwrap();
    assert_eq!(decrypted, plaintext);
    assert_eq!(
        ngasihtau_crypto::primitives::sha256_hex(&decrypted),
        manifest.original_hash
    );
}

#[tokio::test]
async fn test_transport_wrapped_cek_roundtrip() {
    let stack = TestStack::new();
    let user = Id::generate();
    let material = Id::generate();
    let device = stack.register_device(user).await;

    let record = stack
        .keys
        .get_or_create_cek(&RequestContext::system(), user, material, device.id)
        .await
        .unwrap();
    let cek = stack.keys.unwrap_cek(&record).unwrap();

    let wrapped = stack.keys.wrap_for_transport(&cek, device.id).unwrap();
    let unwrapped = stack
        .keys
        .unwrap_from_transport(&wrapped, device.id)
        .unwrap();
    assert_eq!(unwrapped.as_bytes(), cek.as_bytes());

    // A different device cannot open the transport envelope.
    assert!(stack
        .keys
        .unwrap_from_transport(&wrapped, Id::generate())
        .is_err());
}

#[tokio::test]
async fn test_tampered_download_fails_decryption() {
    let stack = TestStack::new();
    let user = Id::generate();
    let material = Id::generate();
    let device = stack.register_device(user).await;
    let license = stack.issue_license(user, material, device.id).await;
    stack.seed_source(material, source_bytes(4096)).await;

    let job = stack
        .jobs
        .create_job(material, user, device.id, license.id, JobPriority::Normal)
        .await
        .unwrap();
    stack.jobs.run_job(job.id).await.unwrap();

    let stored = stack
        .material_repo
        .find_by_material(material)
        .await
        .unwrap()
        .unwrap();
    let mut encrypted = stack.blob.get(&stored.encrypted_file_key).await.unwrap();
    let mid = encrypted.len() / 2;
    encrypted[mid] ^= 0x80;

    let cek_record = stack.cek_repo_record(user, material, device.id).await;
    let cek = stack.keys.unwrap_cek(&cek_record).unwrap();
    assert!(decrypt_file(&encrypted, &cek, &stored.manifest.chunks).is_err());
}

impl TestStack {
    async fn cek_repo_record(
        &self,
        user: Id,
        material: Id,
        device: Id,
    ) -> ngasihtau_core::model::CekRecord {
        use ngasihtau_core::repo::CekRepository;
        self.cek_repo
            .find(user, material, device)
            .await
            .unwrap()
            .expect("CEK record must exist after encryption")
    }
}

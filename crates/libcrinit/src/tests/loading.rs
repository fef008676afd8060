//! Task-set loading, including the signature gate.

use std::path::Path;

use rsa::RsaPrivateKey;
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::EncodePublicKey;
use rsa::signature::{SignatureEncoding, Signer};
use sha2::Sha256;

use crate::entrypoints::load_task_db;
use crate::global_opts::GlobalOpts;
use crate::sig::SigContext;

fn write(dir: &Path, name: &str, content: &[u8]) {
    std::fs::write(dir.join(name), content).unwrap();
}

#[test]
fn taskdir_scan_and_explicit_tasks_combine() {
    let dir = tempfile::tempdir().unwrap();
    let task_dir = dir.path().join("tasks");
    std::fs::create_dir(&task_dir).unwrap();
    write(
        &task_dir,
        "scanned.crinit",
        b"NAME = scanned\nCOMMAND = /bin/true\n",
    );
    // Wrong suffix: only reachable through the explicit TASKS list.
    write(
        &task_dir,
        "extra.task",
        b"NAME = extra\nCOMMAND = /bin/true\n",
    );

    let mut opts = GlobalOpts::default();
    opts.task_dir = task_dir;
    opts.tasks = vec!["extra.task".to_owned()];

    let db = load_task_db(&opts, None).unwrap();
    assert_eq!(db.len(), 2);
    assert!(db.lookup("scanned").is_some());
    assert!(db.lookup("extra").is_some());
}

#[test]
fn broken_task_file_is_skipped_but_others_load() {
    let dir = tempfile::tempdir().unwrap();
    let task_dir = dir.path().join("tasks");
    std::fs::create_dir(&task_dir).unwrap();
    write(&task_dir, "good.crinit", b"NAME = good\nCOMMAND = /bin/true\n");
    write(&task_dir, "broken.crinit", b"NAME = broken\n"); // no COMMAND

    let mut opts = GlobalOpts::default();
    opts.task_dir = task_dir;

    let db = load_task_db(&opts, None).unwrap();
    assert_eq!(db.len(), 1);
    assert!(db.lookup("good").is_some());
}

#[test]
fn dangling_dependency_fails_the_load() {
    let dir = tempfile::tempdir().unwrap();
    let task_dir = dir.path().join("tasks");
    std::fs::create_dir(&task_dir).unwrap();
    write(
        &task_dir,
        "app.crinit",
        b"NAME = app\nCOMMAND = /bin/true\nDEPENDS = ghost:wait\n",
    );

    let mut opts = GlobalOpts::default();
    opts.task_dir = task_dir;
    assert!(load_task_db(&opts, None).is_err());
}

#[test]
fn unsigned_task_files_are_refused_when_signatures_are_on() {
    let mut rng = rand::thread_rng();
    let root_private = RsaPrivateKey::new(&mut rng, 1024).unwrap();
    let signer_private = RsaPrivateKey::new(&mut rng, 1024).unwrap();
    let root_public = root_private
        .to_public_key()
        .to_public_key_der()
        .unwrap()
        .as_bytes()
        .to_vec();
    let signer_public = signer_private
        .to_public_key()
        .to_public_key_der()
        .unwrap()
        .as_bytes()
        .to_vec();
    let sign = |key: &RsaPrivateKey, payload: &[u8]| {
        SigningKey::<Sha256>::new(key.clone())
            .sign(payload)
            .to_bytes()
            .to_vec()
    };

    let dir = tempfile::tempdir().unwrap();
    let key_dir = dir.path().join("keys");
    std::fs::create_dir(&key_dir).unwrap();
    write(&key_dir, "signer.key", &signer_public);
    write(&key_dir, "signer.key.sig", &sign(&root_private, &signer_public));

    let ctx = SigContext::from_root_key_bytes(&root_public).unwrap();
    ctx.load_signed_keys(&key_dir).unwrap();

    let task_dir = dir.path().join("tasks");
    std::fs::create_dir(&task_dir).unwrap();

    let signed_body = b"NAME = signed\nCOMMAND = /bin/true\n";
    write(&task_dir, "signed.crinit", signed_body);
    write(
        &task_dir,
        "signed.crinit.sig",
        &sign(&signer_private, signed_body),
    );

    // No .sig sibling at all.
    write(&task_dir, "unsigned.crinit", b"NAME = unsigned\nCOMMAND = /bin/true\n");

    // Signature present but made over different content.
    let forged_body = b"NAME = forged\nCOMMAND = /bin/true\n";
    write(&task_dir, "forged.crinit", forged_body);
    write(
        &task_dir,
        "forged.crinit.sig",
        &sign(&signer_private, b"NAME = forged\nCOMMAND = /bin/evil\n"),
    );

    let mut opts = GlobalOpts::default();
    opts.task_dir = task_dir;

    let db = load_task_db(&opts, Some(&ctx)).unwrap();
    assert_eq!(db.len(), 1);
    assert!(db.lookup("signed").is_some());
    assert!(db.lookup("unsigned").is_none());
    assert!(db.lookup("forged").is_none());
}

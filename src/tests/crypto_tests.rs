use crate::crypto::*;
use crate::storage::ThreadMetadata;
use crate::tests::support::database;
use crate::thread_manager::ThreadManager;
use crate::Error;

#[test]
fn test_encrypt_decrypt_envelope() {
    let key = generate_key();
    let envelope = encrypt_message(&key, b"hello thread", b"aad").expect("Failed to encrypt");

    // Ciphertext carries the 16-byte tag
    assert_eq!(envelope.ciphertext.len(), b"hello thread".len() + 16);
    assert_ne!(&envelope.ciphertext[..12], b"hello thread");

    let plain = decrypt_message(&key, &envelope, b"aad").expect("Failed to decrypt");
    assert_eq!(plain, b"hello thread");
}

#[test]
fn test_decrypt_rejects_wrong_key_or_aad() {
    let key = generate_key();
    let envelope = encrypt_message(&key, b"secret", b"thread-a").expect("Failed to encrypt");

    let other_key = generate_key();
    assert!(matches!(
        decrypt_message(&other_key, &envelope, b"thread-a"),
        Err(Error::Crypto(_))
    ));
    assert!(matches!(
        decrypt_message(&key, &envelope, b"thread-b"),
        Err(Error::Crypto(_))
    ));
}

#[test]
fn test_decrypt_rejects_tampered_ciphertext() {
    let key = generate_key();
    let mut envelope = encrypt_message(&key, b"secret", b"").expect("Failed to encrypt");
    envelope.ciphertext[0] ^= 0xff;

    assert!(decrypt_message(&key, &envelope, b"").is_err());
}

#[test]
fn test_nonces_are_unique() {
    let key = generate_key();
    let a = encrypt_message(&key, b"same", b"").expect("Failed to encrypt");
    let b = encrypt_message(&key, b"same", b"").expect("Failed to encrypt");

    assert_ne!(a.nonce, b.nonce);
    assert_ne!(a.ciphertext, b.ciphertext);
}

#[test]
fn test_master_key_from_hex() {
    let hex_key = "11".repeat(32);
    assert!(MasterKey::from_hex(&hex_key).is_ok());

    assert!(matches!(MasterKey::from_hex("zz"), Err(Error::Crypto(_))));
    assert!(matches!(MasterKey::from_hex("abcd"), Err(Error::Crypto(_))));

    // Debug output never leaks key bytes
    let key = MasterKey::from_hex(&hex_key).expect("Valid key");
    assert_eq!(format!("{:?}", key), "MasterKey(..)");
}

#[test]
fn test_service_roundtrip_and_version() {
    let service = EncryptionService::new(database(), MasterKey::generate());

    assert_eq!(service.active_version("t1").expect("Failed to read version"), None);

    let sealed = service.encrypt("t1", "hi there").expect("Failed to encrypt");
    assert_eq!(sealed.key_version, 1);
    assert_eq!(service.active_version("t1").expect("Failed to read version"), Some(1));

    let plain = service.decrypt("t1", &sealed).expect("Failed to decrypt");
    assert_eq!(plain, "hi there");
}

#[test]
fn test_ensure_key_is_idempotent() {
    let service = EncryptionService::new(database(), MasterKey::generate());

    assert_eq!(service.ensure_key("t1").expect("Failed to ensure key"), 1);
    assert_eq!(service.ensure_key("t1").expect("Failed to ensure key"), 1);
}

#[test]
fn test_rotation_keeps_history_readable() {
    let db = database();
    let thread = ThreadManager::new(db.clone())
        .create_or_get_thread("alice", "bob", ThreadMetadata::default())
        .expect("Failed to create thread");
    let service = EncryptionService::new(db, MasterKey::generate());
    let t = thread.id.as_str();

    let old = service.encrypt(t, "before rotation").expect("Failed to encrypt");
    let version = service.rotate_key(t).expect("Failed to rotate");
    assert_eq!(version, 2);

    let new = service.encrypt(t, "after rotation").expect("Failed to encrypt");
    assert_eq!(new.key_version, 2);

    assert_eq!(service.decrypt(t, &old).expect("Old ciphertext"), "before rotation");
    assert_eq!(service.decrypt(t, &new).expect("New ciphertext"), "after rotation");
}

#[test]
fn test_rotating_unknown_thread_creates_no_key() {
    let service = EncryptionService::new(database(), MasterKey::generate());

    assert!(matches!(service.rotate_key("no-such-thread"), Err(Error::NotFound(_))));
    assert_eq!(
        service.active_version("no-such-thread").expect("Failed to read version"),
        None
    );
}

#[test]
fn test_keys_are_per_thread() {
    let service = EncryptionService::new(database(), MasterKey::generate());

    let sealed = service.encrypt("t1", "only for t1").expect("Failed to encrypt");
    service.ensure_key("t2").expect("Failed to ensure key");

    // Same version number, different thread: key and AAD both differ
    assert!(service.decrypt("t2", &sealed).is_err());
}

#[test]
fn test_wrong_master_key_cannot_unwrap() {
    let db = database();
    let writer = EncryptionService::new(db.clone(), MasterKey::generate());
    let sealed = writer.encrypt("t1", "wrapped").expect("Failed to encrypt");

    let reader = EncryptionService::new(db, MasterKey::generate());
    assert!(matches!(reader.decrypt("t1", &sealed), Err(Error::Crypto(_))));
}

#[test]
fn test_missing_key_version_is_crypto_error() {
    let service = EncryptionService::new(database(), MasterKey::generate());
    let mut sealed = service.encrypt("t1", "x").expect("Failed to encrypt");
    sealed.key_version = 9;

    assert!(matches!(service.decrypt("t1", &sealed), Err(Error::Crypto(_))));
}

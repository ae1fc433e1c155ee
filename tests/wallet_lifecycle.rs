use std::sync::Arc;
use tempfile::tempdir;
use wallet_keystore::mnemonic;
use wallet_keystore::{
    AlwaysAllow, FileKeystore, KeystoreBackend, MemoryKeystore, MnemonicStrength, PutOptions,
    SecureRecordStore, StorageError, ValidationError, VaultConfig, WalletError, WalletManager,
};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn memory_wallets() -> (WalletManager, Arc<SecureRecordStore>) {
    let config = VaultConfig::default();
    let backend: Arc<dyn KeystoreBackend> = Arc::new(MemoryKeystore::new());
    let store = Arc::new(SecureRecordStore::open(backend, Arc::new(AlwaysAllow), &config).unwrap());
    (WalletManager::new(store.clone(), &config).unwrap(), store)
}

#[test]
fn generated_phrase_validates_with_expected_word_count() {
    init_logger();
    let phrase = mnemonic::generate(MnemonicStrength::Words12).unwrap().phrase();
    assert_eq!(phrase.split(' ').count(), 12);

    let report = mnemonic::check(&phrase);
    assert!(report.is_valid);
    assert_eq!(report.word_count, 12);
}

#[test]
fn three_word_phrase_reports_word_count() {
    let report = mnemonic::check("abandon abandon abandon");
    assert!(!report.is_valid);
    assert_eq!(report.errors, vec![ValidationError::InvalidWordCount { count: 3 }]);
    assert_eq!(
        report.errors[0].to_string(),
        "word count must be 12/15/18/21/24 (got 3)"
    );
}

#[test]
fn deleting_the_record_clears_has_stored_wallet() {
    init_logger();
    let (wallets, store) = memory_wallets();
    let info = wallets.create_wallet(MnemonicStrength::Words12).unwrap();
    assert!(wallets.has_stored_wallet(&info.address).unwrap());

    store.delete(&format!("wallet_{}", info.address)).unwrap();
    assert!(!wallets.has_stored_wallet(&info.address).unwrap());
}

#[test]
fn altered_last_word_is_a_checksum_mismatch() {
    let (wallets, _) = memory_wallets();
    let phrase = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon";

    match wallets.recover_wallet(phrase) {
        Err(WalletError::Validation(errors)) => {
            assert_eq!(errors, vec![ValidationError::ChecksumMismatch]);
        }
        other => panic!("expected checksum mismatch, got {:?}", other),
    }
}

#[test]
fn recovered_wallet_signs_like_the_original() {
    init_logger();
    let (original, _) = memory_wallets();
    let created = original.create_wallet(MnemonicStrength::Words12).unwrap();
    let first = original.sign_message(&created.address, b"payload").unwrap();

    let (restored, _) = memory_wallets();
    let messy = format!("  {}  ", created.mnemonic.to_uppercase().replace(' ', "   "));
    let recovered = restored.recover_wallet(&messy).unwrap();
    assert_eq!(recovered.address, created.address);

    let second = restored.sign_message(&recovered.address, b"payload").unwrap();
    assert!(restored
        .verify_signature(&created.public_key, b"payload", &first)
        .unwrap());
    assert!(original
        .verify_signature(&recovered.public_key, b"payload", &second)
        .unwrap());
}

#[test]
fn file_keystore_keeps_wallets_across_reopen() {
    init_logger();
    let dir = tempdir().unwrap();
    let config = VaultConfig {
        storage_dir: dir.path().to_path_buf(),
        ..VaultConfig::default()
    };

    let address = {
        let backend = Arc::new(FileKeystore::new(&config.storage_dir).unwrap());
        let store = Arc::new(SecureRecordStore::open(backend, Arc::new(AlwaysAllow), &config).unwrap());
        let wallets = WalletManager::new(store, &config).unwrap();
        wallets.create_wallet(MnemonicStrength::Words15).unwrap().address
    };

    let backend = Arc::new(FileKeystore::new(&config.storage_dir).unwrap());
    let store = Arc::new(SecureRecordStore::open(backend, Arc::new(AlwaysAllow), &config).unwrap());
    let wallets = WalletManager::new(store, &config).unwrap();

    assert_eq!(wallets.list_wallets().unwrap(), vec![address.clone()]);
    let signature = wallets.sign_message(&address, b"after restart").unwrap();
    assert_eq!(signature.as_bytes().len(), 64);
}

#[test]
fn sessions_and_wallets_share_one_master_key() {
    let (wallets, store) = memory_wallets();
    store
        .put("session_profile", b"{\"user\":\"u1\"}", PutOptions::encrypted())
        .unwrap();
    let info = wallets.create_wallet(MnemonicStrength::Words12).unwrap();

    store.lock();
    assert!(store.get("session_profile").unwrap().is_some());
    assert!(wallets.sign_message(&info.address, b"m").is_ok());
}

#[test]
fn reserved_keys_stay_hidden_from_callers() {
    let (_, store) = memory_wallets();
    store.put("session_a", b"x", PutOptions::encrypted()).unwrap();
    assert!(matches!(
        store.get("__master_key"),
        Err(StorageError::ReservedKey(_))
    ));
    assert_eq!(store.keys("").unwrap(), vec!["session_a".to_string()]);
}

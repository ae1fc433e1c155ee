use std::io::{self, Write};
use std::sync::Arc;
use wallet_keystore::{
    AlwaysAllow, FileKeystore, MnemonicStrength, SecureRecordStore, SessionStore, VaultConfig,
    WalletManager,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    println!("Wallet Keystore Demo");
    println!("====================");

    let config = VaultConfig::load("./keystore.toml")?;
    let backend = Arc::new(FileKeystore::new(&config.storage_dir)?);
    let store = Arc::new(SecureRecordStore::open(backend, Arc::new(AlwaysAllow), &config)?);
    let wallets = WalletManager::new(store.clone(), &config)?;

    let existing = wallets.list_wallets()?;
    let address = match existing.first() {
        Some(address) => {
            println!("Loading existing wallet {}...", address);
            address.clone()
        }
        None => {
            println!("Creating new wallet...");
            let info = wallets.create_wallet(MnemonicStrength::Words12)?;
            if !info.persisted {
                println!("WARNING: wallet could not be saved and exists for this run only");
            }

            println!("\nIMPORTANT: Write down your mnemonic phrase and store it securely!");
            println!("Mnemonic: {}\n", info.mnemonic.as_str());
            print!("Press Enter to continue...");
            io::stdout().flush()?;
            let mut buffer = String::new();
            io::stdin().read_line(&mut buffer)?;

            info.address
        }
    };

    println!("\nState:     {:?}", wallets.state());
    println!("Path:      {}", config.derivation_path);
    println!("Address:   {}", address);

    let message = b"demo message";
    let signature = wallets.sign_message(&address, message)?;
    println!("Signature: {}", signature.to_hex());

    let phrase = wallets.reveal_mnemonic(&address, &Default::default())?;
    let recovered = wallets.recover_wallet(&phrase)?;
    println!("Recovered: {} (matches: {})", recovered.address, recovered.address == address);

    let sessions = SessionStore::new(store, config.encrypt_session_data);
    let protection = sessions.save("last_run", chrono::Utc::now().to_rfc3339().as_bytes())?;
    println!("Session saved with {:?} protection", protection);

    println!("\nStored wallets: {:?}", wallets.list_wallets()?);
    println!("Wallet operations completed successfully!");
    Ok(())
}

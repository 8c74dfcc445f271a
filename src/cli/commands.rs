// Credstore — CLI Command Handlers
//
// Each function handles one CLI subcommand. They load the configuration,
// open the database, map the configured keys onto its canaries, and then
// drive the store or the rotator.

use std::sync::Arc;

use crate::config::Config;
use crate::encryption::{EncryptionKey, Encryptor, KeyRing};
use crate::error::CredstoreError;
use crate::rotation::KeyRotator;
use crate::store::{
    CredentialValue, CredentialVersion, CredentialVersionStore, Database, NameRegistry,
    SqliteCanaryStore, SqliteCredentialVersionStore, VersionDraft,
};

use super::{Cli, Commands, SetKind};

/// Everything a command needs once configuration has been applied.
struct Session {
    config: Config,
    db: Database,
    encryptor: Encryptor,
}

impl Session {
    fn versions(&self) -> SqliteCredentialVersionStore<'_> {
        SqliteCredentialVersionStore::new(&self.db, &self.encryptor)
            .with_page_size(self.config.rotation_page_size)
    }
}

/// Execute the parsed CLI command.
pub fn execute(cli: Cli) -> Result<(), CredstoreError> {
    if let Commands::Keys { generate: true } = cli.command {
        return cmd_generate_key();
    }

    let session = open_session(&cli)?;
    match cli.command {
        Commands::Keys { .. } => cmd_keys(&session),
        Commands::Set {
            name,
            kind,
            value,
            no_overwrite,
        } => cmd_set(&session, name, kind, value, no_overwrite),
        Commands::Get { name, versions } => cmd_get(&session, name, versions),
        Commands::Find { path, name_like } => cmd_find(&session, path, name_like),
        Commands::Paths => cmd_paths(&session),
        Commands::Delete { name } => cmd_delete(&session, name),
        Commands::CaDependents { ca_name } => cmd_ca_dependents(&session, ca_name),
        Commands::Rotate => cmd_rotate(&session),
    }
}

// ─── Keys ────────────────────────────────────────────────────────────────────

fn cmd_generate_key() -> Result<(), CredstoreError> {
    let key = EncryptionKey::generate(false, "generated");
    println!("{}", key.to_hex().as_str());
    Ok(())
}

fn cmd_keys(session: &Session) -> Result<(), CredstoreError> {
    let key_ring = session.encryptor.key_ring();

    println!("Configured keys:\n");
    for key in key_ring.configured_keys() {
        println!(
            "  {:8} │ {:10} │ {}",
            key.label(),
            key.provider().to_string(),
            if key.is_active() { "active" } else { "inactive" }
        );
    }

    println!();
    println!("Active canary:    {}", key_ring.active_uuid());
    for uuid in key_ring.canary_uuids_with_known_and_inactive_keys() {
        println!("Inactive canary:  {}", uuid);
    }
    for uuid in key_ring.unreachable_canary_uuids() {
        println!("Unreachable:      {}", uuid);
    }

    let usage = session.versions().count_by_encryption_key()?;
    println!();
    println!("Versions under active key:      {}", usage.active);
    println!("Versions under inactive keys:   {}", usage.inactive);
    println!("Versions under unknown keys:    {}", usage.unknown);

    Ok(())
}

// ─── Set ─────────────────────────────────────────────────────────────────────

fn cmd_set(
    session: &Session,
    name: String,
    kind: SetKind,
    value: String,
    no_overwrite: bool,
) -> Result<(), CredstoreError> {
    let value = match kind {
        SetKind::Value => CredentialValue::Value(value),
        SetKind::Password => CredentialValue::Password {
            password: value,
            parameters: None,
        },
        SetKind::Json => CredentialValue::Json(
            serde_json::from_str(&value)
                .map_err(|e| CredstoreError::Other(format!("Value is not valid JSON: {}", e)))?,
        ),
    };

    let store = session.versions();
    let draft = VersionDraft::new(name, value);
    let version = if no_overwrite {
        store.save_if_absent(draft)?
    } else {
        store.save(draft)?
    };

    println!("✓ Credential stored");
    println!("  Name:    {}", version.name);
    println!("  Version: {}", version.uuid);

    Ok(())
}

// ─── Get ─────────────────────────────────────────────────────────────────────

fn cmd_get(session: &Session, name: String, versions: Option<i64>) -> Result<(), CredstoreError> {
    let store = session.versions();

    let found = match versions {
        Some(n) => store.find_n_by_name(&name, n)?,
        None => store.find_most_recent(&name)?.into_iter().collect(),
    };

    if found.is_empty() {
        println!("Credential not found: {}", name);
        return Ok(());
    }

    for version in &found {
        print_version(session, version)?;
    }
    Ok(())
}

fn print_version(session: &Session, version: &CredentialVersion) -> Result<(), CredstoreError> {
    println!("Name:    {}", version.name);
    println!("Version: {}", version.uuid);
    println!("Type:    {}", version.kind);
    println!("Created: {}", version.created_at.format("%Y-%m-%d %H:%M:%S UTC"));

    match version.value(&session.encryptor)? {
        CredentialValue::Password { password, .. } => println!("Value:   {}", password),
        CredentialValue::Value(value) => println!("Value:   {}", value),
        CredentialValue::Json(value) => println!(
            "Value:   {}",
            serde_json::to_string_pretty(&value).map_err(crate::store::StoreError::from)?
        ),
        CredentialValue::Ssh {
            public_key,
            private_key,
        }
        | CredentialValue::Rsa {
            public_key,
            private_key,
        } => {
            println!("Public key:\n{}", public_key);
            println!("Private key:\n{}", private_key);
        }
        CredentialValue::Certificate {
            ca_name,
            ca,
            certificate,
            private_key,
            transitional,
        } => {
            if let Some(ca_name) = ca_name {
                println!("CA name: {}", ca_name);
            }
            println!("Transitional: {}", transitional);
            if let Some(ca) = ca {
                println!("CA:\n{}", ca);
            }
            println!("Certificate:\n{}", certificate);
            println!("Private key:\n{}", private_key);
        }
        CredentialValue::User {
            username,
            password,
            salt,
            ..
        } => {
            println!("Username: {}", username.unwrap_or_default());
            println!("Password: {}", password);
            println!("Salt:     {}", salt);
        }
    }
    println!("{:-<80}", "");
    Ok(())
}

// ─── Find / Paths ────────────────────────────────────────────────────────────

fn cmd_find(
    session: &Session,
    path: Option<String>,
    name_like: Option<String>,
) -> Result<(), CredstoreError> {
    let names = NameRegistry::new(&session.db);
    let found = match (path, name_like) {
        (Some(path), _) => names.find_starting_with_path(&path)?,
        (None, Some(fragment)) => names.find_containing_name(&fragment)?,
        (None, None) => {
            return Err(CredstoreError::Other(
                "Pass either --path or --name-like".to_string(),
            ))
        }
    };

    if found.is_empty() {
        println!("No credentials found.");
        return Ok(());
    }

    println!("Credentials ({}):\n", found.len());
    for version in &found {
        println!(
            "  {} │ {:11} │ {}",
            version.created_at.format("%Y-%m-%d %H:%M:%S"),
            version.kind,
            version.name
        );
    }
    Ok(())
}

fn cmd_paths(session: &Session) -> Result<(), CredstoreError> {
    for path in NameRegistry::new(&session.db).find_all_paths()? {
        println!("{}", path);
    }
    Ok(())
}

// ─── Delete ──────────────────────────────────────────────────────────────────

fn cmd_delete(session: &Session, name: String) -> Result<(), CredstoreError> {
    if session.versions().delete(&name)? {
        println!("✓ Credential {} deleted", name);
    } else {
        println!("Credential not found: {}", name);
    }
    Ok(())
}

// ─── CA dependents ───────────────────────────────────────────────────────────

fn cmd_ca_dependents(session: &Session, ca_name: String) -> Result<(), CredstoreError> {
    let names = session
        .versions()
        .find_all_certificate_credentials_by_ca_name(&ca_name)?;

    if names.is_empty() {
        println!("No certificates are signed by {}", ca_name);
    }
    for name in names {
        println!("{}", name);
    }
    Ok(())
}

// ─── Rotate ──────────────────────────────────────────────────────────────────

fn cmd_rotate(session: &Session) -> Result<(), CredstoreError> {
    let versions = session.versions();
    let canaries = SqliteCanaryStore::new(&session.db);
    let summary = KeyRotator::new(&session.encryptor, &versions, &canaries).rotate()?;

    println!("✓ Rotation finished");
    println!("  Versions rotated:     {}", summary.versions_rotated);
    println!("  Versions superseded:  {}", summary.versions_superseded);
    println!("  Versions failed:      {}", summary.versions_failed);
    println!("  Canaries rotated:     {}", summary.canaries_rotated);
    println!("  Skipped (unreachable): {}", summary.skipped_unreachable);

    if summary.versions_failed > 0 {
        return Err(CredstoreError::Other(format!(
            "{} versions could not be rotated; see the log for details",
            summary.versions_failed
        )));
    }
    Ok(())
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Load configuration, open the database and map keys onto its canaries.
fn open_session(cli: &Cli) -> Result<Session, CredstoreError> {
    let config_path = cli.config.as_ref().ok_or_else(|| {
        CredstoreError::Other(
            "No configuration given. Pass --config or set CREDSTORE_CONFIG.".to_string(),
        )
    })?;
    let config = Config::load(config_path)?;

    let db_path = config.database_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = Database::open(&db_path)?;

    let keys = config.build_keys()?;
    let key_ring = KeyRing::load(keys, &SqliteCanaryStore::new(&db))?;

    Ok(Session {
        config,
        db,
        encryptor: Encryptor::new(Arc::new(key_ring)),
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

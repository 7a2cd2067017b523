use crate::Result;
use alloy::signers::local::PrivateKeySigner;
use anyhow::{
    Context,
    anyhow,
};
use eth_keystore::decrypt_key;
use rpassword::prompt_password;
use std::path::{
    Path,
    PathBuf,
};

/// Raw hex signing key, used when no keystore is given.
pub const PRIVATE_KEY_ENV: &str = "SWEEPER_PRIVATE_KEY";

pub fn resolve_keystore_path(raw: &str) -> PathBuf {
    let expanded = shellexpand::tilde(raw);
    PathBuf::from(expanded.into_owned())
}

pub fn signer_from_hex(raw: &str) -> Result<PrivateKeySigner> {
    let trimmed = raw.trim();
    let bytes = hex::decode(trimmed.strip_prefix("0x").unwrap_or(trimmed))
        .context("signing key is not valid hex")?;
    PrivateKeySigner::from_slice(&bytes).map_err(|e| anyhow!("invalid signing key: {e}"))
}

pub fn unlock_keystore(path: &Path) -> Result<PrivateKeySigner> {
    let prompt = format!("Enter password for keystore '{}': ", path.display());
    let password = prompt_password(prompt).context("Failed to read keystore password")?;
    let secret = decrypt_key(path, password.as_bytes())
        .map_err(|_| anyhow!("Invalid password for keystore '{}'", path.display()))?;
    PrivateKeySigner::from_slice(&secret).map_err(|e| {
        anyhow!(
            "Keystore '{}' contained unsupported key material: {e}",
            path.display()
        )
    })
}

/// Keystore if one was named, else the key in [`PRIVATE_KEY_ENV`], else none.
pub fn load_signer(keystore: Option<&str>) -> Result<Option<PrivateKeySigner>> {
    if let Some(raw) = keystore {
        return unlock_keystore(&resolve_keystore_path(raw)).map(Some);
    }
    match std::env::var(PRIVATE_KEY_ENV) {
        Ok(raw) if !raw.trim().is_empty() => signer_from_hex(&raw)
            .with_context(|| format!("reading {PRIVATE_KEY_ENV}"))
            .map(Some),
        _ => Ok(None),
    }
}

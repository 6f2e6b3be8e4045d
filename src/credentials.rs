//! InfluxDB token storage in the OS keyring.
//!
//! Tokens live under the `ta612c-bridge` service, one entry per
//! `<profile>:<field>` account, where the profile names the org/bucket pair
//! from bridge.toml (see `InfluxSettings::credential_profile`). The backend is
//! the platform store: Keychain on macOS, Credential Manager on Windows and
//! Secret Service on Linux.

use keyring::Entry;

const SERVICE_NAME: &str = "ta612c-bridge";

fn entry(profile: &str, field: &str) -> Result<Entry, String> {
    Entry::new(SERVICE_NAME, &format!("{}:{}", profile, field))
        .map_err(|e| format!("Keyring unavailable for {}:{}: {e}", profile, field))
}

/// Save `value`, replacing any stored one.
pub fn store_credential(profile: &str, field: &str, value: &str) -> Result<(), String> {
    entry(profile, field)?
        .set_password(value)
        .map_err(|e| format!("Failed to store {} for {}: {e}", field, profile))
}

/// Look up a stored value. `Ok(None)` when nothing was saved.
pub fn get_credential(profile: &str, field: &str) -> Result<Option<String>, String> {
    match entry(profile, field)?.get_password() {
        Ok(value) => Ok(Some(value)),
        Err(keyring::Error::NoEntry) => Ok(None),
        Err(e) => Err(format!("Failed to read {} for {}: {e}", field, profile)),
    }
}

/// Remove a stored value. Removing something never stored is not an error.
pub fn delete_credential(profile: &str, field: &str) -> Result<(), String> {
    match entry(profile, field)?.delete_credential() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(format!("Failed to remove {} for {}: {e}", field, profile)),
    }
}

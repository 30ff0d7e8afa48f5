//! API key storage in the system keyring.
//!
//! Keys live in the OS secret store (libsecret, Keychain, Credential
//! Manager), one entry per provider. They are never written to
//! settings.json and never logged.

use keyring::Entry;

use crate::settings::Provider;

const SERVICE_NAME: &str = "steadycoach";

fn entry_for(provider: Provider) -> Result<Entry, keyring::Error> {
    Entry::new(SERVICE_NAME, &format!("{}-api-key", provider.id()))
}

/// Stored key for `provider`, if any. Keyring failures are logged.
pub fn get_api_key(provider: Provider) -> Option<String> {
    let entry = match entry_for(provider) {
        Ok(e) => e,
        Err(e) => {
            log::warn!("Credentials: failed to open keyring entry: {}", e);
            return None;
        }
    };

    match entry.get_password() {
        Ok(key) if !key.is_empty() => Some(key),
        Ok(_) | Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            log::warn!("Credentials: failed to read {} key: {}", provider.id(), e);
            None
        }
    }
}

/// Store the key for `provider`. `None` or an empty key deletes it.
pub fn set_api_key(provider: Provider, key: Option<&str>) -> Result<(), keyring::Error> {
    let entry = entry_for(provider)?;

    match key {
        Some(k) if !k.is_empty() => {
            entry.set_password(k)?;
            log::info!("Credentials: stored {} API key", provider.id());
        }
        _ => match entry.delete_credential() {
            Ok(()) => log::info!("Credentials: deleted {} API key", provider.id()),
            Err(keyring::Error::NoEntry) => {}
            Err(e) => return Err(e),
        },
    }

    Ok(())
}

/// Show only the last four characters
pub fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}{}", "*".repeat(chars.len() - 4), tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_key() {
        assert_eq!(mask_key(""), "");
        assert_eq!(mask_key("short"), "*****");
        assert_eq!(mask_key("sk-1234567890"), "*********7890");
    }
}

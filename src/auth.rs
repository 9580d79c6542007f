//! Gateway authentication tokens and the key/credentials files they're
//! derived from.
//!
//! The wire-level scheme matches the original implementation exactly: a
//! gateway's first frame on `/gw` is a Fernet token that encrypts a shared
//! secret under a private key; the broker accepts the gateway once
//! decrypting the token with its own private key reproduces the secret.

use std::fs;
use std::path::{Path, PathBuf};

use fernet::Fernet;
use rand::Rng;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("key file not found: {0}")]
    KeyFileMissing(PathBuf),
    #[error("key file {0} is missing the [keys] secret or private entry")]
    KeyFileMalformed(PathBuf),
    #[error("credentials file not found: {0}")]
    CredentialsFileMissing(PathBuf),
    #[error("credentials file {0} is missing the username or password entry")]
    CredentialsFileMalformed(PathBuf),
    #[error("invalid private key material")]
    InvalidPrivateKey,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Ini(#[from] ini::Error),
}

/// Broker/gateway shared authentication material.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Keys {
    pub private: String,
    pub secret: String,
}

/// Credentials for protocol-level auth (e.g. MQTT broker username/password).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

pub fn default_key_path() -> PathBuf {
    dirs_home().join(".iot-bridge").join("keys")
}

pub fn default_credentials_path() -> PathBuf {
    dirs_home().join(".iot-bridge").join("credentials")
}

fn dirs_home() -> PathBuf {
    std::env::var_os("HOME").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."))
}

/// Generates a fresh 32-character alphanumeric secret key.
pub fn generate_secret_key() -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..32)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Generates a fresh base64-encoded Fernet private key.
pub fn generate_private_key() -> String {
    Fernet::generate_key()
}

/// Writes `keys` to `path` as an INI file under the `[keys]` section,
/// creating the parent directory with restrictive permissions if needed.
pub fn write_keys_to_file(path: &Path, keys: &Keys) -> Result<(), AuthError> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent)?;
            set_private_dir_permissions(parent)?;
        }
    }

    let mut conf = ini::Ini::new();
    conf.with_section(Some("keys"))
        .set("secret", &keys.secret)
        .set("private", &keys.private);
    conf.write_to_file(path)?;
    Ok(())
}

#[cfg(unix)]
fn set_private_dir_permissions(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(dir, fs::Permissions::from_mode(0o700))
}

#[cfg(not(unix))]
fn set_private_dir_permissions(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Verifies that `path` exists and is a correctly-formatted key file,
/// returning the parsed keys.
pub fn check_key_file(path: &Path) -> Result<Keys, AuthError> {
    if !path.is_file() {
        return Err(AuthError::KeyFileMissing(path.to_path_buf()));
    }

    let conf = ini::Ini::load_from_file(path)?;
    let section = conf.section(Some("keys"));
    let secret = section.and_then(|s| s.get("secret"));
    let private = section.and_then(|s| s.get("private"));

    match (secret, private) {
        (Some(secret), Some(private)) => Ok(Keys {
            secret: secret.to_string(),
            private: private.to_string(),
        }),
        _ => Err(AuthError::KeyFileMalformed(path.to_path_buf())),
    }
}

/// Verifies that `path` exists and is a correctly-formatted credentials
/// file, returning the parsed credentials.
pub fn check_credentials_file(path: &Path) -> Result<Credentials, AuthError> {
    if !path.is_file() {
        return Err(AuthError::CredentialsFileMissing(path.to_path_buf()));
    }

    let conf = ini::Ini::load_from_file(path)?;
    let section = conf.section(Some("credentials"));
    let username = section.and_then(|s| s.get("username"));
    let password = section.and_then(|s| s.get("password"));

    match (username, password) {
        (Some(username), Some(password)) => Ok(Credentials {
            username: username.to_string(),
            password: password.to_string(),
        }),
        _ => Err(AuthError::CredentialsFileMalformed(path.to_path_buf())),
    }
}

/// Generates the auth token a gateway sends as its first `/gw` frame.
pub fn auth_token(keys: &Keys) -> Result<String, AuthError> {
    let fernet = Fernet::new(&keys.private).ok_or(AuthError::InvalidPrivateKey)?;
    Ok(fernet.encrypt(keys.secret.as_bytes()))
}

/// Verifies a token received as the first `/gw` frame.
pub fn verify_auth_token(token: &str, keys: &Keys) -> bool {
    let Some(fernet) = Fernet::new(&keys.private) else {
        return false;
    };
    match fernet.decrypt(token) {
        Ok(plaintext) => plaintext == keys.secret.as_bytes(),
        Err(_) => false,
    }
}

/// Convenience used by tests and first-run bootstrapping.
pub fn generate_keys() -> Keys {
    Keys {
        secret: generate_secret_key(),
        private: generate_private_key(),
    }
}

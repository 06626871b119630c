//! Private key sources for the Diffie-Hellman exchange

use super::{random_bytes, PRIVATE_KEY_LEN};
use crate::{Error, Result};
use async_trait::async_trait;
use std::fmt;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::debug;

/// Produces one hex private key string per call
#[async_trait]
pub trait KeySource: Send + Sync + fmt::Debug {
    async fn generate_key(&self) -> Result<String>;
}

/// Fresh private key from the system CSPRNG, as lowercase hex
pub fn generate_private_key() -> Result<String> {
    let mut key = [0u8; PRIVATE_KEY_LEN];
    random_bytes(&mut key)?;
    Ok(hex::encode(key))
}

/// Key source backed by the system CSPRNG
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomKeySource;

#[async_trait]
impl KeySource for RandomKeySource {
    async fn generate_key(&self) -> Result<String> {
        generate_private_key()
    }
}

/// Key source that runs an external command and reads the first line of
/// its standard output
#[derive(Clone)]
pub struct CommandKeySource {
    command: String,
}

impl CommandKeySource {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

impl fmt::Debug for CommandKeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandKeySource")
            .field("command", &self.command)
            .finish()
    }
}

#[async_trait]
impl KeySource for CommandKeySource {
    async fn generate_key(&self) -> Result<String> {
        let mut parts = self.command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| Error::Parse("empty key generation command".to_string()))?;

        let mut child = Command::new(program)
            .args(parts)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Network(format!("can't run '{}': {}", self.command, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Network("key generator has no output".to_string()))?;

        let mut line = String::new();
        BufReader::new(stdout).read_line(&mut line).await?;

        // The rest of the output is not needed
        match child.wait().await {
            Ok(status) if !status.success() => {
                debug!("Key generator '{}' exited with {}", self.command, status);
            }
            Ok(_) => {}
            Err(e) => debug!("Can't reap key generator '{}': {}", self.command, e),
        }

        let key = line.trim().to_string();
        if key.is_empty() {
            return Err(Error::Network(format!(
                "key generator '{}' produced no key",
                self.command
            )));
        }

        tracing::trace!("Generated private key using '{}'", self.command);
        Ok(key)
    }
}

//! Access-token acquisition for the Gmail client.
//!
//! The OAuth dance and token refresh live outside this tool; a sync run only
//! needs a ready bearer token at startup. Sources, in priority order: the
//! GOTMUCH_ACCESS_TOKEN environment variable, the configured token command,
//! a token file next to the config.

use anyhow::{bail, Context, Result};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::process::Command;

const ENV_TOKEN: &str = "GOTMUCH_ACCESS_TOKEN";

pub struct CredentialStore {
    token_command: Option<String>,
    token_file: PathBuf,
}

impl CredentialStore {
    pub fn new(email: &str, token_command: Option<String>) -> Self {
        // Email-specific token file to support multi-account setups.
        let safe_email = email.replace(['@', '.', '/', '\\', ':'], "_");
        let token_file = crate::config::Config::config_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(format!(".access_token_{safe_email}"));

        Self {
            token_command,
            token_file,
        }
    }

    fn env_token() -> Option<String> {
        env::var(ENV_TOKEN).ok().filter(|t| !t.is_empty())
    }

    /// Run the configured token command and take its trimmed stdout.
    fn command_token(&self) -> Result<Option<String>> {
        let Some(cmd) = &self.token_command else {
            return Ok(None);
        };
        let output = Command::new("sh")
            .args(["-c", cmd])
            .output()
            .with_context(|| format!("Failed to run token command {cmd:?}"))?;
        if !output.status.success() {
            bail!("token command {cmd:?} exited with {}", output.status);
        }
        let token = String::from_utf8(output.stdout)
            .context("token command output is not UTF-8")?
            .trim()
            .to_string();
        if token.is_empty() {
            bail!("token command {cmd:?} produced no output");
        }
        Ok(Some(token))
    }

    fn file_token(&self) -> Option<String> {
        fs::read_to_string(&self.token_file)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    /// The access token to use for this run.
    pub fn access_token(&self) -> Result<String> {
        if let Some(token) = Self::env_token() {
            return Ok(token);
        }
        if let Some(token) = self.command_token()? {
            return Ok(token);
        }
        if let Some(token) = self.file_token() {
            return Ok(token);
        }
        bail!(
            "No access token found. Set {ENV_TOKEN}, configure account.token_command, \
             or write the token to {}.",
            self.token_file.display()
        )
    }
}

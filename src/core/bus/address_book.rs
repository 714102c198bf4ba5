//! Claimed-address persistence.
//!
//! The gateway's bus address is the only state that survives restarts. It
//! lives in `<state_dir>/paired_address` as a single ASCII decimal line and
//! is written exactly once per successful auto-claim, atomically (tempfile
//! then rename). There is deliberately no lock file: the serial task is the
//! single writer.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::core::protocol::constants::is_reserved_address;
use crate::utils::error::{GatewayError, Result};

const PAIRED_ADDRESS_FILE: &str = "paired_address";

/// Loads and persists the gateway's claimed bus address.
#[derive(Debug)]
pub struct AddressBook {
    state_dir: PathBuf,
    claimed: Option<u16>,
}

impl AddressBook {
    /// Load the persisted address, if any. Unreadable or malformed content
    /// is treated as "not claimed yet" (the arbiter will re-claim) rather
    /// than a fatal error.
    pub fn load(state_dir: &Path) -> Self {
        let path = state_dir.join(PAIRED_ADDRESS_FILE);
        let claimed = match std::fs::read_to_string(&path) {
            Ok(content) => match content.trim().parse::<u16>() {
                Ok(address) if !is_reserved_address(address) => {
                    info!("Loaded claimed bus address {} from {:?}", address, path);
                    Some(address)
                }
                Ok(address) => {
                    warn!(
                        "Persisted address {} in {:?} is reserved, ignoring it",
                        address, path
                    );
                    None
                }
                Err(e) => {
                    warn!("Unparsable address in {:?} ({e}), will re-claim", path);
                    None
                }
            },
            Err(_) => None,
        };

        Self {
            state_dir: state_dir.to_path_buf(),
            claimed,
        }
    }

    pub fn claimed(&self) -> Option<u16> {
        self.claimed
    }

    pub fn file_path(&self) -> PathBuf {
        self.state_dir.join(PAIRED_ADDRESS_FILE)
    }

    /// Persist a freshly claimed address. Reserved addresses are rejected;
    /// re-persisting the already-claimed address is a no-op.
    pub async fn persist(&mut self, address: u16) -> Result<()> {
        if is_reserved_address(address) {
            return Err(GatewayError::ClaimFailed(format!(
                "address {address} is reserved"
            )));
        }

        if self.claimed == Some(address) {
            return Ok(());
        }

        tokio::fs::create_dir_all(&self.state_dir)
            .await
            .map_err(|e| {
                GatewayError::Io(format!(
                    "cannot create state dir {:?}: {e}",
                    self.state_dir
                ))
            })?;

        let path = self.file_path();
        let tmp = self.state_dir.join(format!("{PAIRED_ADDRESS_FILE}.tmp"));

        tokio::fs::write(&tmp, format!("{address}\n"))
            .await
            .map_err(|e| GatewayError::Io(format!("cannot write {tmp:?}: {e}")))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| GatewayError::Io(format!("cannot rename {tmp:?} to {path:?}: {e}")))?;

        info!("Persisted claimed bus address {} to {:?}", address, path);
        self.claimed = Some(address);
        Ok(())
    }
}

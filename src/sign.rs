//! detached commit signatures

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::debug;

use crate::checksum::Checksum;
use crate::error::{Error, Result};
use crate::store;
use crate::txn::Transaction;
use crate::types::DetachedMetadata;

/// detached metadata key holding the CBOR list of signatures
pub const GPG_SIGNATURES_KEY: &str = "otree.gpgsigs";

/// produces a detached signature over serialized commit bytes
pub trait CommitSigner {
    fn sign(
        &self,
        commit: &Checksum,
        data: &[u8],
        key_id: &str,
        homedir: Option<&Path>,
    ) -> Result<Vec<u8>>;
}

/// signs by running `gpg --detach-sign`
#[derive(Debug, Clone)]
pub struct GpgSigner {
    program: PathBuf,
}

impl Default for GpgSigner {
    fn default() -> Self {
        Self {
            program: PathBuf::from("gpg"),
        }
    }
}

impl GpgSigner {
    pub fn new() -> Self {
        Self::default()
    }

    /// use a different gpg binary
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl CommitSigner for GpgSigner {
    fn sign(
        &self,
        commit: &Checksum,
        data: &[u8],
        key_id: &str,
        homedir: Option<&Path>,
    ) -> Result<Vec<u8>> {
        let failed = |message: String| Error::Signing {
            key: key_id.to_string(),
            message,
        };

        let mut cmd = Command::new(&self.program);
        cmd.arg("--batch").arg("--no-tty");
        if let Some(home) = homedir {
            cmd.arg("--homedir").arg(home);
        }
        cmd.arg("--local-user")
            .arg(key_id)
            .arg("--detach-sign")
            .arg("--output")
            .arg("-")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| failed(format!("failed to run {}: {}", self.program.display(), e)))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(data)
                .map_err(|e| failed(format!("failed to feed gpg: {}", e)))?;
        }
        let output = child
            .wait_with_output()
            .map_err(|e| failed(format!("failed to wait for gpg: {}", e)))?;

        if !output.status.success() {
            return Err(failed(String::from_utf8_lossy(&output.stderr).trim().to_string()));
        }
        debug!(%commit, key = key_id, bytes = output.stdout.len(), "signed commit");
        Ok(output.stdout)
    }
}

/// signatures recorded in a commit's detached metadata
pub fn signatures(metadata: &DetachedMetadata) -> Result<Vec<Vec<u8>>> {
    match metadata.get(GPG_SIGNATURES_KEY) {
        Some(bytes) => Ok(ciborium::from_reader(&bytes[..])?),
        None => Ok(Vec::new()),
    }
}

/// sign a commit staged in (or visible to) `txn` and append the
/// signature to its detached metadata
pub fn sign_commit(
    txn: &mut Transaction<'_>,
    commit: &Checksum,
    key_id: &str,
    homedir: Option<&Path>,
    signer: &dyn CommitSigner,
) -> Result<()> {
    let data = store::encode(&txn.load_commit(commit)?)?;
    let signature = signer.sign(commit, &data, key_id, homedir)?;

    let mut metadata = txn.read_detached_metadata(commit)?.unwrap_or_default();
    let mut sigs = signatures(&metadata)?;
    sigs.push(signature);
    metadata.insert(GPG_SIGNATURES_KEY.to_string(), store::encode(&sigs)?);
    txn.write_detached_metadata(commit, &metadata)
}

//! Private key and certificate checks through `openssl`.

use std::path::Path;

use opta_runner::{CommandRunner, CommandSpec};

use crate::error::OptaResult;
use crate::shell;

async fn public_key_of_private_key(runner: &dyn CommandRunner, key: &Path) -> OptaResult<String> {
    shell::run(
        runner,
        CommandSpec::new("openssl")
            .args(["pkey", "-pubout", "-in"])
            .arg(key.display().to_string()),
        "Reading private key",
    )
    .await
}

async fn public_key_of_certificate(runner: &dyn CommandRunner, cert: &Path) -> OptaResult<String> {
    shell::run(
        runner,
        CommandSpec::new("openssl")
            .args(["x509", "-pubkey", "-noout", "-in"])
            .arg(cert.display().to_string()),
        "Reading certificate",
    )
    .await
}

/// Whether the certificate was issued for the private key.
pub(super) async fn key_matches_certificate(
    runner: &dyn CommandRunner,
    key: &Path,
    cert: &Path,
) -> OptaResult<bool> {
    let from_key = public_key_of_private_key(runner, key).await?;
    let from_cert = public_key_of_certificate(runner, cert).await?;
    Ok(from_key.trim() == from_cert.trim())
}

//! `agent-action-pushAppWithInstaller`: install an application bundle.
//!
//! The bundle is a tar archive, optionally gzip-compressed, with `install.sh` at
//! its root. It is unpacked into a fresh `apps/<millis>` directory and the
//! installer runs there with the script timeout.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use flate2::read::GzDecoder;
use serde_json::{Map, Value};
use tracing::{info, warn};

use super::{HandlerContext, HandlerOutcome};
use crate::process::run_shell;

/// Parameter holding the bundle URL.
pub const INSTALLATION_FILE: &str = "Installation File";

/// Installer script expected at the bundle root.
pub const INSTALLER: &str = "install.sh";

/// Download deadline.
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Download, unpack and install.
pub async fn run(ctx: &HandlerContext, parameter_values: &Map<String, Value>) -> HandlerOutcome {
    let Some(url) = parameter_values
        .get(INSTALLATION_FILE)
        .and_then(Value::as_str)
        .filter(|url| !url.trim().is_empty())
    else {
        warn!("Installation file parameter missing");
        return HandlerOutcome::failed("Installation File missing");
    };

    info!(url, "Downloading application bundle");
    let bundle = match download(&ctx.http, url).await {
        Ok(bundle) => bundle,
        Err(e) => {
            warn!(url, error = %e, "Application download failed");
            return HandlerOutcome::failed(format!("Failed to download application {url}: {e}"));
        }
    };

    let target = bundle_dir(&ctx.apps_dir, ctx.clock.now_millis());
    let unpack_target = target.clone();
    let unpacked = tokio::task::spawn_blocking(move || unpack(&bundle, &unpack_target)).await;
    match unpacked {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return HandlerOutcome::failed(format!("Failed to unpack application: {e}")),
        Err(e) => return HandlerOutcome::failed(format!("Unpack task failed: {e}")),
    }

    if !target.join(INSTALLER).is_file() {
        return HandlerOutcome::failed(format!("{INSTALLER} not found in application bundle"));
    }

    info!(dir = %target.display(), "Running application installer");
    match run_shell(&format!("bash ./{INSTALLER}"), &target, ctx.script_timeout).await {
        Ok(output) => {
            info!(exit_code = ?output.exit_code, "Installer finished");
            HandlerOutcome::from_command(output)
        }
        Err(e) => HandlerOutcome::failed(format!("Could not start installer: {e}")),
    }
}

async fn download(client: &reqwest::Client, url: &str) -> reqwest::Result<Vec<u8>> {
    let response = client
        .get(url)
        .timeout(DOWNLOAD_TIMEOUT)
        .send()
        .await?
        .error_for_status()?;
    Ok(response.bytes().await?.to_vec())
}

/// Unpack a tar or tar.gz archive into `target`, creating it.
///
/// # Errors
///
/// Returns an error if the directory cannot be created or the archive is invalid.
pub fn unpack(bundle: &[u8], target: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(target)?;
    let reader: Box<dyn Read + '_> = if bundle.starts_with(&GZIP_MAGIC) {
        Box::new(GzDecoder::new(bundle))
    } else {
        Box::new(bundle)
    };
    tar::Archive::new(reader).unpack(target)
}

/// Directory a bundle unpacked at `millis` lands in.
#[must_use]
pub fn bundle_dir(apps_dir: &Path, millis: i64) -> PathBuf {
    apps_dir.join(millis.to_string())
}

//! Code-signing setup for the on-device bridge.
//!
//! Before WebDriverAgent can be built for a physical device, two things must
//! hold:
//!
//! - the signing identities must be in a dedicated keychain, and that
//!   keychain must be unlocked;
//! - the runner's bundle identifier in the Xcode project must be rewritten to
//!   one the provisioning profile covers.
//!
//! Both files are shared by every bridge on the host. The project patch
//! happens at most once per project file. The `.old` backup next to it acts
//! as the sentinel, and it is created with an exclusive-create open, so two
//! bridges constructed concurrently cannot both apply the patch.
//!
//! Within one process the whole patch runs under a lock, so a caller told
//! [`PatchOutcome::AlreadyApplied`] always sees the rewritten project. Separate
//! processes only share the sentinel: a second process can observe
//! `AlreadyApplied` while the first is still writing the project file.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors from signing setup steps.
#[derive(Error, Debug)]
pub enum SigningError {
    /// A helper command could not be executed.
    #[error("failed to run {command}: {source}")]
    Launch {
        command: String,
        #[source]
        source: io::Error,
    },

    /// A helper command ran and reported failure.
    #[error("{command} failed: {output}")]
    CommandFailed { command: String, output: String },

    /// The identity glob pattern is malformed.
    #[error("invalid identity pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    /// Reading or writing the project file failed.
    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Keychain and identity material for signing the bridge runner.
///
/// The password has no default. It must come from configuration or the
/// environment.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningConfig {
    /// Absolute path of the dedicated keychain file.
    pub keychain: PathBuf,
    pub keychain_password: String,
    /// Script that creates the keychain and imports identities into it.
    /// Invoked as `<script> -f <keychain> <identity>...` with `KEYPASS` set.
    pub import_script: PathBuf,
    /// Directory holding the certificates and keys to import (`*.*`).
    pub identities_dir: PathBuf,
}

impl fmt::Debug for SigningConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningConfig")
            .field("keychain", &self.keychain)
            .field("keychain_password", &"<redacted>")
            .field("import_script", &self.import_script)
            .field("identities_dir", &self.identities_dir)
            .finish()
    }
}

/// Bundle identifier rewrite applied to the Xcode project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleIdPatch {
    pub from: String,
    pub to: String,
}

impl Default for BundleIdPatch {
    fn default() -> Self {
        Self {
            from: "com.facebook.WebDriverAgentRunner".to_string(),
            to: "com.miw.WebDriverAgentRunner".to_string(),
        }
    }
}

/// What [`patch_bundle_id`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    /// The backup was written and the project rewritten.
    Applied { replacements: usize },
    /// A backup already exists; the project was left untouched.
    AlreadyApplied,
}

/// Identity files to import, sorted for a stable command line.
pub fn identity_files(dir: &Path) -> Result<Vec<PathBuf>, SigningError> {
    let pattern = dir.join("*.*");
    let mut files: Vec<PathBuf> = glob::glob(&pattern.to_string_lossy())?
        .filter_map(Result::ok)
        .filter(|p| p.is_file())
        .collect();
    files.sort();
    Ok(files)
}

fn run(command: &mut Command, display: String) -> Result<String, SigningError> {
    let output = command.output().map_err(|source| SigningError::Launch {
        command: display.clone(),
        source,
    })?;
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    if !output.status.success() {
        return Err(SigningError::CommandFailed {
            command: display,
            output: text.trim().to_string(),
        });
    }
    Ok(text)
}

/// Create the keychain (if needed) and import every identity into it.
pub fn import_identities(config: &SigningConfig) -> Result<(), SigningError> {
    let identities = identity_files(&config.identities_dir)?;
    debug!(count = identities.len(), "Importing signing identities");

    let mut command = Command::new(&config.import_script);
    command
        .arg("-f")
        .arg(&config.keychain)
        .args(&identities)
        .env("KEYPASS", &config.keychain_password);

    run(&mut command, config.import_script.display().to_string())?;
    info!(keychain = %config.keychain.display(), "Keychain created");
    Ok(())
}

/// `security -v unlock-keychain -p <password> <keychain>`
pub fn unlock_keychain(config: &SigningConfig) -> Result<(), SigningError> {
    let mut command = Command::new("security");
    command
        .args(["-v", "unlock-keychain", "-p"])
        .arg(&config.keychain_password)
        .arg(&config.keychain);

    // Display string omits the password.
    run(&mut command, "security unlock-keychain".to_string())?;
    info!(keychain = %config.keychain.display(), "Keychain unlocked");
    Ok(())
}

/// Path of the sentinel backup for `project_file`.
pub fn backup_path(project_file: &Path) -> PathBuf {
    let mut name = project_file.as_os_str().to_owned();
    name.push(".old");
    PathBuf::from(name)
}

/// Serializes in-process patching so the sentinel and the rewrite land together.
static PATCH_LOCK: Mutex<()> = Mutex::new(());

/// Back up `project_file` and replace every occurrence of `patch.from`.
///
/// The backup is created with `create_new`, so only the first caller ever
/// gets to patch. If patching fails after the backup was created, the backup
/// is removed again so a later call can retry.
///
/// Callers in the same process wait for an in-flight patch to finish before
/// checking the sentinel. Another process may still see `AlreadyApplied`
/// before the rewrite has reached disk.
pub fn patch_bundle_id(
    project_file: &Path,
    patch: &BundleIdPatch,
) -> Result<PatchOutcome, SigningError> {
    let _guard = PATCH_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
    let backup = backup_path(project_file);

    let mut sentinel = match OpenOptions::new().write(true).create_new(true).open(&backup) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            debug!(backup = %backup.display(), "Project already patched");
            return Ok(PatchOutcome::AlreadyApplied);
        }
        Err(source) => {
            return Err(SigningError::Io {
                path: backup,
                source,
            })
        }
    };

    let result = apply_patch(project_file, &mut sentinel, patch, &backup);
    if result.is_err() {
        drop(sentinel);
        if let Err(e) = fs::remove_file(&backup) {
            warn!(
                backup = %backup.display(),
                error = %e,
                "Failed to remove backup after failed patch"
            );
        }
    }
    result
}

fn apply_patch(
    project_file: &Path,
    sentinel: &mut File,
    patch: &BundleIdPatch,
    backup: &Path,
) -> Result<PatchOutcome, SigningError> {
    let original = fs::read_to_string(project_file).map_err(|source| SigningError::Io {
        path: project_file.to_path_buf(),
        source,
    })?;

    sentinel
        .write_all(original.as_bytes())
        .and_then(|()| sentinel.sync_all())
        .map_err(|source| SigningError::Io {
            path: backup.to_path_buf(),
            source,
        })?;
    debug!(backup = %backup.display(), "Backed up project file");

    let replacements = original.matches(patch.from.as_str()).count();
    let patched = original.replace(&patch.from, &patch.to);
    fs::write(project_file, patched).map_err(|source| SigningError::Io {
        path: project_file.to_path_buf(),
        source,
    })?;

    info!(bundle_id = %patch.to, replacements, "Replaced runner bundle id");
    Ok(PatchOutcome::Applied { replacements })
}

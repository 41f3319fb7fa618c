use std::path::Path;

use rand_core::OsRng;
use ssh_key::{Algorithm, LineEnding, PrivateKey};

use crate::error::LabError;

/// Generate an Ed25519 keypair for one VM, write both halves under the
/// keys directory, and return the public key line for embedding into
/// the VM record.
pub fn generate_keypair(
    private_path: &Path,
    public_path: &Path,
    comment: &str,
) -> Result<String, LabError> {
    let mut key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).map_err(|e| {
        LabError::Validation {
            message: format!("ssh key generation failed: {e}"),
        }
    })?;
    key.set_comment(comment);

    let private = key.to_openssh(LineEnding::LF).map_err(|e| LabError::Validation {
        message: format!("ssh key encoding failed: {e}"),
    })?;
    let public = key.public_key().to_openssh().map_err(|e| LabError::Validation {
        message: format!("ssh key encoding failed: {e}"),
    })?;

    if let Some(parent) = private_path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| LabError::Io {
            context: format!("creating {}", parent.display()),
            source,
        })?;
    }

    std::fs::write(private_path, private.as_bytes()).map_err(|source| LabError::Io {
        context: format!("writing {}", private_path.display()),
        source,
    })?;

    // ssh refuses keys readable by others.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(private_path, std::fs::Permissions::from_mode(0o600));
    }

    std::fs::write(public_path, &public).map_err(|source| LabError::Io {
        context: format!("writing {}", public_path.display()),
        source,
    })?;

    Ok(public)
}

//! Bubblewrap sandbox argv construction.
//!
//! When the sandbox is enabled, every tool invocation is wrapped in a minimal
//! Linux namespace sandbox: read-only system bind mounts, `--unshare-net`
//! unless loopback access was opted into, a tmpfs `/tmp` as the only writable
//! path, and `--die-with-parent` so a broker crash takes the child with it.

use std::path::Path;
use std::process::Command;

pub const BWRAP_BIN: &str = "bwrap";

/// System directories bound read-only into the sandbox root, parent before
/// child where the mounts overlap.
const RO_MOUNTS: &[&str] = &["/usr", "/bin", "/lib", "/lib64", "/etc"];

/// Check whether bubblewrap is on PATH and answers `--help`. Used once at
/// startup so a misconfigured deployment fails loudly instead of silently
/// running tools unconfined.
pub fn bwrap_available() -> bool {
    match Command::new(BWRAP_BIN).arg("--help").output() {
        Ok(out) => {
            let text = [out.stdout.as_slice(), out.stderr.as_slice()].concat();
            out.status.success()
                || text.windows(5).any(|w| w == b"bwrap")
                || text.windows(5).any(|w| w == b"usage")
        }
        Err(_) => false,
    }
}

/// Build the bwrap argument vector that precedes `-- <tool argv>`.
pub fn bwrap_args(allow_network: bool, workdir: Option<&Path>) -> Vec<String> {
    let mut args: Vec<String> = vec!["--die-with-parent".into(), "--new-session".into()];

    let mut bound_any = false;
    for mount in RO_MOUNTS {
        if Path::new(mount).exists() {
            args.extend(["--ro-bind".into(), (*mount).into(), (*mount).into()]);
            bound_any = true;
        }
    }
    if !bound_any {
        args.extend(["--ro-bind".into(), "/usr".into(), "/usr".into()]);
    }

    args.extend([
        "--dev".into(),
        "/dev".into(),
        "--proc".into(),
        "/proc".into(),
        "--tmpfs".into(),
        "/tmp".into(),
        "--dir".into(),
        "/run".into(),
    ]);

    if allow_network {
        args.extend(["--unshare-all".into(), "--share-net".into()]);
    } else {
        args.push("--unshare-net".into());
    }

    // Bind the working directory read-only so the tool can read inputs from it.
    if let Some(dir) = workdir {
        if dir.is_absolute() && dir.exists() {
            let d = dir.to_string_lossy().into_owned();
            args.extend(["--ro-bind".into(), d.clone(), d]);
        }
    }

    args
}

/// Working directory to hand the sandboxed child. Falls back to the tmpfs when
/// the requested directory cannot be bound.
pub fn sandbox_cwd(workdir: Option<&Path>) -> &Path {
    match workdir {
        Some(dir) if dir.is_absolute() && dir.exists() => dir,
        _ => Path::new("/tmp"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_is_unshared_by_default() {
        let args = bwrap_args(false, None);
        assert!(args.contains(&"--unshare-net".to_string()));
        assert!(!args.contains(&"--share-net".to_string()));
    }

    #[test]
    fn network_opt_in_still_unshares_everything_else() {
        let args = bwrap_args(true, None);
        assert!(args.contains(&"--unshare-all".to_string()));
        assert!(args.contains(&"--share-net".to_string()));
    }

    #[test]
    fn tmp_is_the_only_writable_mount() {
        let args = bwrap_args(false, None);
        let tmpfs_at = args.iter().position(|a| a == "--tmpfs").unwrap();
        assert_eq!(args[tmpfs_at + 1], "/tmp");
        // Every bind is read-only.
        assert!(!args.iter().any(|a| a == "--bind"));
    }

    #[test]
    fn workdir_is_bound_read_only_when_it_exists() {
        let dir = tempfile::tempdir().unwrap();
        let args = bwrap_args(false, Some(dir.path()));
        let want = dir.path().to_string_lossy().into_owned();
        assert!(args.iter().any(|a| *a == want));
        assert_eq!(sandbox_cwd(Some(dir.path())), dir.path());
    }

    #[test]
    fn missing_workdir_falls_back_to_tmp() {
        assert_eq!(
            sandbox_cwd(Some(Path::new("/no/such/place"))),
            Path::new("/tmp")
        );
        assert_eq!(sandbox_cwd(None), Path::new("/tmp"));
    }
}

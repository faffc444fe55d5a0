//! Stand-in `cloudflared` and `xray` executables
//!
//! Both are shell scripts that print their arguments and then sleep, so the
//! console can start, observe and stop them. The fake cloudflared prints a
//! quick tunnel URL when started with `tunnel --url`.
//!
//! The scripts are written once per test process, before any test spawns a
//! child, so no child can inherit an open write handle to them.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// URL the fake cloudflared announces for quick tunnels
pub const QUICK_TUNNEL_URL: &str = "https://quick-test-tunnel.trycloudflare.com";

const FAKE_CLOUDFLARED: &str = r#"#!/bin/sh
echo "fake cloudflared $*"
if [ "$1" = "tunnel" ] && [ "$2" = "--url" ]; then
  echo "INF Requesting new quick Tunnel on trycloudflare.com..."
  echo "INF +----------------------------------------------------+"
  echo "INF |  https://quick-test-tunnel.trycloudflare.com        |"
  echo "INF +----------------------------------------------------+"
fi
exec sleep 60
"#;

const FAKE_XRAY: &str = r#"#!/bin/sh
echo "fake xray $*"
exec sleep 60
"#;

pub struct FakeBinaries {
    pub cloudflared: PathBuf,
    pub xray: PathBuf,
}

impl FakeBinaries {
    /// The process-wide fake binaries, created on first use
    pub fn get() -> &'static FakeBinaries {
        static BINARIES: OnceLock<FakeBinaries> = OnceLock::new();
        BINARIES.get_or_init(|| {
            let dir = std::env::temp_dir().join(format!("burrow-e2e-bins-{}", std::process::id()));
            std::fs::create_dir_all(&dir).expect("Failed to create fake binary dir");

            let cloudflared = dir.join("cloudflared");
            let xray = dir.join("xray");
            write_script(&cloudflared, FAKE_CLOUDFLARED);
            write_script(&xray, FAKE_XRAY);

            FakeBinaries { cloudflared, xray }
        })
    }
}

fn write_script(path: &Path, content: &str) {
    use std::os::unix::fs::PermissionsExt;

    std::fs::write(path, content).expect("Failed to write fake binary");
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .expect("Failed to make fake binary executable");
}

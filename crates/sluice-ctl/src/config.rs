use std::path::{Path, PathBuf};

use serde::Deserialize;

/// On-disk configuration; command-line flags override whatever is set
/// here.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Control socket port.
    pub port: Option<u16>,
    /// Directory whose `disk<number>` entries are the storage mountpoints.
    pub rootdir: Option<PathBuf>,
    /// Explicit mountpoint list, used instead of `rootdir` scanning.
    #[serde(default)]
    pub mounts: Vec<PathBuf>,
    /// 0 = warnings only, 1 = info, 2 = debug, 3 = trace.
    pub debug: Option<u8>,
    /// Upper bound on each transfer's blockpool, in MiB.
    pub pool_cap_mib: Option<usize>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("{}: {e}", path.display()))?;
        serde_json::from_str(&text).map_err(|e| format!("{}: {e}", path.display()))
    }
}

// Site-wide configuration: an optional per-user TOML file carrying cluster-wide defaults
// that augment every grid submission. Every field is optional on disk and falls back to a
// built-in default, so a missing file (or a missing key within one) is never an error.

use log::trace;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::Error;

const DEFAULT_PARALLEL: u32 = 4;
const DEFAULT_NICE: i32 = 0;

/// Site-wide configuration, merged from an optional TOML file and built-in defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct Site {
    pub default_parallel: u32,
    pub default_nice: i32,
    pub extra_qsub_args: Vec<String>,
}

impl Default for Site {
    fn default() -> Site {
        Site {
            default_parallel: DEFAULT_PARALLEL,
            default_nice: DEFAULT_NICE,
            extra_qsub_args: Vec::new(),
        }
    }
}

/// On-disk representation: every field optional, absent keys fall back to built-in defaults.
#[derive(Debug, Deserialize, Default)]
struct RawSite {
    default_parallel: Option<u32>,
    default_nice: Option<i32>,
    extra_qsub_args: Option<Vec<String>>,
}

impl Site {
    /// Locate and open the site configuration file.
    ///
    /// Resolution order: `override_path`, then `$JOBCTL_HOME/.config/jobctl/site.toml`
    /// (falling back to `$HOME` when `JOBCTL_HOME` is unset). A missing file yields
    /// `Site::default()`.
    ///
    /// # Errors
    /// Returns `Err(Error)` when the file exists but cannot be read or parsed.
    pub fn open(override_path: Option<&Path>) -> Result<Site, Error> {
        let path = match override_path {
            Some(path) => Some(path.to_path_buf()),
            None => default_site_path()?,
        };

        let Some(path) = path else {
            trace!("No home directory available, using default site configuration.");
            return Ok(Site::default());
        };

        Site::open_from_path(&path)
    }

    /// Open a specific site configuration file, merging it with built-in defaults. A
    /// missing file yields `Site::default()`.
    ///
    /// # Errors
    /// Returns `Err(Error)` when the file exists but cannot be read or parsed.
    pub fn open_from_path(path: &Path) -> Result<Site, Error> {
        if !path.exists() {
            trace!("No site configuration at '{}', using defaults.", path.display());
            return Ok(Site::default());
        }

        trace!("Reading site configuration from '{}'.", path.display());
        let contents = std::fs::read_to_string(path).map_err(|e| Error::FileRead(path.to_path_buf(), e))?;
        let raw: RawSite =
            toml::from_str(&contents).map_err(|e| Error::TOMLParse(path.to_path_buf(), e))?;

        let defaults = Site::default();
        Ok(Site {
            default_parallel: raw.default_parallel.unwrap_or(defaults.default_parallel),
            default_nice: raw.default_nice.unwrap_or(defaults.default_nice),
            extra_qsub_args: raw.extra_qsub_args.unwrap_or(defaults.extra_qsub_args),
        })
    }
}

fn default_site_path() -> Result<Option<PathBuf>, Error> {
    let home = match std::env::var_os("JOBCTL_HOME") {
        Some(value) => PathBuf::from(value),
        None => match home::home_dir() {
            Some(home) => home,
            None => return Ok(None),
        },
    };

    Ok(Some(home.join(".config").join("jobctl").join("site.toml")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let site = Site::open_from_path(&dir.path().join("site.toml")).unwrap();
        assert_eq!(site, Site::default());
    }

    #[test]
    fn partial_file_merges_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("site.toml");
        std::fs::write(&path, "default_parallel = 16\n").unwrap();

        let site = Site::open_from_path(&path).unwrap();
        assert_eq!(site.default_parallel, 16);
        assert_eq!(site.default_nice, DEFAULT_NICE);
        assert!(site.extra_qsub_args.is_empty());
    }

    #[test]
    fn full_file_overrides_all_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("site.toml");
        std::fs::write(
            &path,
            "default_parallel = 8\ndefault_nice = 5\nextra_qsub_args = [\"-P\", \"myproject\"]\n",
        )
        .unwrap();

        let site = Site::open_from_path(&path).unwrap();
        assert_eq!(site.default_parallel, 8);
        assert_eq!(site.default_nice, 5);
        assert_eq!(site.extra_qsub_args, vec!["-P".to_string(), "myproject".to_string()]);
    }
}

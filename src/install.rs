//! Installation descriptor — the flat key=value file describing a worker
//! installation.
//!
//! Blank lines, `#` comments and `export` lines are skipped. Read failures
//! always propagate; a descriptor that cannot be read is a configuration
//! error, not something to paper over.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// File name of the descriptor inside an installation home.
pub const DESCRIPTOR_FILE: &str = "install.conf";

/// Parsed installation descriptor with typed lookups.
#[derive(Debug, Clone)]
pub struct Installation {
    home: PathBuf,
    options: HashMap<String, String>,
}

impl Installation {
    /// Load the descriptor from `home/install.conf`.
    pub fn load(home: &Path) -> Result<Self, ConfigError> {
        let path = home.join(DESCRIPTOR_FILE);
        let file = std::fs::File::open(&path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_reader(home, file)
    }

    /// Parse a descriptor from an arbitrary reader.
    pub fn from_reader(home: &Path, reader: impl Read) -> Result<Self, ConfigError> {
        let mut options = HashMap::new();

        for line in BufReader::new(reader).lines() {
            let line = line.map_err(|source| ConfigError::Io {
                path: home.join(DESCRIPTOR_FILE).display().to_string(),
                source,
            })?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with("export") {
                continue;
            }
            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::Parse { line });
            };
            options.insert(key.trim().to_string(), value.trim().to_string());
        }

        Ok(Self {
            home: home.to_path_buf(),
            options,
        })
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    /// Raw lookup; unknown keys are an error.
    pub fn option(&self, name: &str) -> Result<&str, ConfigError> {
        self.options
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| ConfigError::OptionNotFound {
                name: name.to_string(),
            })
    }

    /// Feature flag: enabled when the option is the literal `yes`.
    pub fn flag(&self, name: &str) -> Result<bool, ConfigError> {
        Ok(self.option(name)? == "yes")
    }

    pub fn mpiexec_enabled(&self) -> Result<bool, ConfigError> {
        self.flag("MPIEXEC_ENABLED")
    }

    pub fn mpiexec(&self) -> Result<&str, ConfigError> {
        self.option("MPIEXEC")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const DESCRIPTOR: &str = "\
# generated by the installer
export SOME_SHELL_THING

MPIEXEC_ENABLED = yes
MPIEXEC = /usr/bin/mpiexec
CODE_DIR=src/codes
";

    #[test]
    fn parses_options_and_skips_noise() {
        let install = Installation::from_reader(Path::new("/opt/sim"), DESCRIPTOR.as_bytes())
            .expect("descriptor should parse");
        assert!(install.mpiexec_enabled().unwrap());
        assert_eq!(install.mpiexec().unwrap(), "/usr/bin/mpiexec");
        assert_eq!(install.option("CODE_DIR").unwrap(), "src/codes");
        assert_eq!(install.home(), Path::new("/opt/sim"));
    }

    #[test]
    fn unknown_option_is_an_error() {
        let install =
            Installation::from_reader(Path::new("/opt/sim"), DESCRIPTOR.as_bytes()).unwrap();
        assert!(matches!(
            install.option("JAVA"),
            Err(ConfigError::OptionNotFound { .. })
        ));
    }

    #[test]
    fn line_without_separator_is_an_error() {
        let result = Installation::from_reader(Path::new("/opt/sim"), "NOT A PAIR\n".as_bytes());
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn missing_descriptor_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Installation::load(dir.path()),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn loads_descriptor_from_home() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join(DESCRIPTOR_FILE)).unwrap();
        file.write_all(b"MPIEXEC_ENABLED=no\n").unwrap();

        let install = Installation::load(dir.path()).unwrap();
        assert!(!install.mpiexec_enabled().unwrap());
    }
}

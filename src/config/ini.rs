// src/config/ini.rs: INI-style configuration files

use std::fs;
use std::path::Path;

use crate::config::defs::PipelineError;

pub const DEFAULT_SECTION: &str = "DEFAULT";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IniSection {
    pub name: String,
    pub entries: Vec<(String, String)>,
}

impl IniSection {
    fn new(name: &str) -> Self {
        IniSection { name: name.to_string(), entries: Vec::new() }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    fn set(&mut self, key: String, value: String) {
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }
}

/// An accumulated configuration. Reading several files into the same
/// `IniConfig` lets later files override earlier ones key by key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IniConfig {
    defaults: IniSection,
    sections: Vec<IniSection>,
}

impl IniConfig {
    pub fn new() -> Self {
        IniConfig { defaults: IniSection::new(DEFAULT_SECTION), sections: Vec::new() }
    }

    pub fn defaults(&self) -> &[(String, String)] {
        &self.defaults.entries
    }

    /// Named sections in the order they were first seen, excluding `DEFAULT`.
    pub fn sections(&self) -> &[IniSection] {
        &self.sections
    }

    /// The entries of a section with `DEFAULT` values filled in where the
    /// section does not set the key itself.
    pub fn items(&self, section: &IniSection) -> Vec<(String, String)> {
        let mut items = section.entries.clone();
        for (key, value) in &self.defaults.entries {
            if section.get(key).is_none() {
                items.push((key.clone(), value.clone()));
            }
        }
        items
    }

    fn section_mut(&mut self, name: &str) -> &mut IniSection {
        if name == DEFAULT_SECTION {
            return &mut self.defaults;
        }
        let idx = match self.sections.iter().position(|s| s.name == name) {
            Some(idx) => idx,
            None => {
                self.sections.push(IniSection::new(name));
                self.sections.len() - 1
            }
        };
        &mut self.sections[idx]
    }

    /// Reads `path` into the configuration.
    ///
    /// # Arguments
    ///
    /// * `path` - INI file to read.
    ///
    /// # Returns
    ///
    /// false if the file does not exist, which is not an error.
    pub fn read(&mut self, path: &Path) -> Result<bool, PipelineError> {
        if !path.exists() {
            return Ok(false);
        }
        let text = fs::read_to_string(path)
            .map_err(|e| PipelineError::IOError(format!("Failed to read {}: {}", path.display(), e)))?;
        self.read_str(&text)
            .map_err(|e| PipelineError::Configuration(format!("{}: {}", path.display(), e)))?;
        Ok(true)
    }

    /// Parses INI text into the configuration.
    /// `=` and `:` separate keys from values, `#` and `;` start comment lines,
    /// indented lines continue the previous value. Keys are lower-cased.
    pub fn read_str(&mut self, text: &str) -> Result<(), String> {
        let mut current = DEFAULT_SECTION.to_string();
        let mut last_key: Option<String> = None;

        for (lineno, raw) in text.lines().enumerate() {
            let trimmed = raw.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with(';') {
                if trimmed.is_empty() {
                    last_key = None;
                }
                continue;
            }

            if raw.starts_with(char::is_whitespace) {
                if let Some(key) = &last_key {
                    let section = self.section_mut(&current);
                    let previous = section.get(key).unwrap_or_default().to_string();
                    let joined = if previous.is_empty() {
                        trimmed.to_string()
                    } else {
                        format!("{}\n{}", previous, trimmed)
                    };
                    section.set(key.clone(), joined);
                    continue;
                }
            }

            if let Some(rest) = trimmed.strip_prefix('[') {
                let name = rest
                    .strip_suffix(']')
                    .ok_or_else(|| format!("line {}: unterminated section header '{}'", lineno + 1, trimmed))?
                    .trim();
                if name.is_empty() {
                    return Err(format!("line {}: empty section name", lineno + 1));
                }
                current = name.to_string();
                self.section_mut(&current);
                last_key = None;
                continue;
            }

            let split = trimmed
                .find(|c: char| c == '=' || c == ':')
                .ok_or_else(|| format!("line {}: expected 'key = value', got '{}'", lineno + 1, trimmed))?;
            let key = trimmed[..split].trim().to_lowercase();
            if key.is_empty() {
                return Err(format!("line {}: missing key", lineno + 1));
            }
            let value = trimmed[split + 1..].trim().to_string();
            self.section_mut(&current).set(key.clone(), value);
            last_key = Some(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_sections_and_defaults() -> Result<()> {
        let mut config = IniConfig::new();
        config
            .read_str("top=1\n[general]\nGenome = hg19\n; comment\n[sample]\nname: 12\n")
            .map_err(anyhow::Error::msg)?;

        assert_eq!(config.defaults(), &[("top".to_string(), "1".to_string())]);
        assert_eq!(config.sections().len(), 2);
        let general = &config.sections()[0];
        assert_eq!(general.get("genome"), Some("hg19"));

        let items = config.items(&config.sections()[1]);
        assert!(items.contains(&("name".to_string(), "12".to_string())));
        assert!(items.contains(&("top".to_string(), "1".to_string())));
        Ok(())
    }

    #[test]
    fn test_continuation_lines() -> Result<()> {
        let mut config = IniConfig::new();
        config
            .read_str("[tool]\noptions = -a\n    -b\n")
            .map_err(anyhow::Error::msg)?;
        assert_eq!(config.sections()[0].get("options"), Some("-a\n-b"));
        Ok(())
    }

    #[test]
    fn test_later_file_overrides() -> Result<()> {
        let mut first = NamedTempFile::new()?;
        writeln!(first, "[general]\ngenome=hg19\nthreads=2")?;
        let mut second = NamedTempFile::new()?;
        writeln!(second, "[general]\ngenome=hg38")?;

        let mut config = IniConfig::new();
        assert!(config.read(first.path())?);
        assert!(config.read(second.path())?);
        assert!(!config.read(Path::new("/nonexistent/pipeline.ini"))?);

        let general = &config.sections()[0];
        assert_eq!(general.get("genome"), Some("hg38"));
        assert_eq!(general.get("threads"), Some("2"));
        Ok(())
    }

    #[test]
    fn test_malformed_line() {
        let mut config = IniConfig::new();
        let err = config.read_str("[general]\njust words\n").unwrap_err();
        assert!(err.contains("line 2"));
    }
}

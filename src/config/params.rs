// src/config/params.rs: layered pipeline parameters

use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};

use log::debug;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::config::defs::{PipelineError, HARDCODED_PARAMS, INTERPOLATE_PARAMS, USER_CONFIG};
use crate::config::ini::IniConfig;
use crate::utils::file::absolute_path;
use crate::utils::statement::interpolate;

/// A configuration value. Strings that look like numbers become `Int` or
/// `Float` when read from a configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<ParamValue>),
}

impl ParamValue {
    /// Converts a configuration string, trying integer then float.
    pub fn from_config_str(value: &str) -> ParamValue {
        let v = value.trim();
        if let Ok(i) = v.parse::<i64>() {
            return ParamValue::Int(i);
        }
        // Rust also parses "inf" and "NaN", which stay strings here
        if v.chars().any(|c| c.is_ascii_digit()) {
            if let Ok(f) = v.parse::<f64>() {
                return ParamValue::Float(f);
            }
        }
        ParamValue::Str(v.to_string())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParamValue::Int(i) => Some(*i),
            ParamValue::Float(f) => Some(f.trunc() as i64),
            ParamValue::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Int(i) => Some(*i as f64),
            ParamValue::Float(f) => Some(*f),
            ParamValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    /// `false`, `0`, `0.0`, `""`, `"false"` and `"False"` are falsy.
    /// Anything else is truthy, including the string `"0.0"`.
    pub fn is_truthy(&self) -> bool {
        match self {
            ParamValue::Bool(b) => *b,
            ParamValue::Int(i) => *i != 0,
            ParamValue::Float(f) => *f != 0.0,
            ParamValue::Str(s) => !matches!(s.as_str(), "" | "false" | "False"),
            ParamValue::List(_) => true,
        }
    }

    /// Splits a comma separated string into trimmed, non-empty items. Lists
    /// are returned as they are and any other scalar becomes a one element list.
    pub fn as_list(&self) -> Vec<ParamValue> {
        match self {
            ParamValue::List(items) => items.clone(),
            ParamValue::Str(s) => s
                .split(',')
                .map(str::trim)
                .filter(|x| !x.is_empty())
                .map(|x| ParamValue::Str(x.to_string()))
                .collect(),
            other => vec![other.clone()],
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            ParamValue::Bool(b) => JsonValue::Bool(*b),
            ParamValue::Int(i) => JsonValue::from(*i),
            ParamValue::Float(f) => JsonValue::from(*f),
            ParamValue::Str(s) => JsonValue::String(s.clone()),
            ParamValue::List(items) => JsonValue::Array(items.iter().map(|x| x.to_json()).collect()),
        }
    }

    pub fn from_json(value: &JsonValue) -> Result<ParamValue, PipelineError> {
        match value {
            JsonValue::Bool(b) => Ok(ParamValue::Bool(*b)),
            JsonValue::Number(n) => n
                .as_i64()
                .map(ParamValue::Int)
                .or_else(|| n.as_f64().map(ParamValue::Float))
                .ok_or_else(|| PipelineError::Configuration(format!("Unsupported number {}", n))),
            JsonValue::String(s) => Ok(ParamValue::Str(s.clone())),
            JsonValue::Array(items) => Ok(ParamValue::List(
                items.iter().map(ParamValue::from_json).collect::<Result<_, _>>()?,
            )),
            JsonValue::Null => Ok(ParamValue::Str(String::new())),
            JsonValue::Object(_) => Err(PipelineError::Configuration(
                "Nested objects are not valid parameter values".to_string(),
            )),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(b) => write!(f, "{}", b),
            ParamValue::Int(i) => write!(f, "{}", i),
            ParamValue::Float(x) if x.is_finite() && x.fract() == 0.0 => write!(f, "{:.1}", x),
            ParamValue::Float(x) => write!(f, "{}", x),
            ParamValue::Str(s) => write!(f, "{}", s),
            ParamValue::List(items) => {
                let joined: Vec<String> = items.iter().map(|x| x.to_string()).collect();
                write!(f, "{}", joined.join(","))
            }
        }
    }
}

impl From<&str> for ParamValue {
    fn from(s: &str) -> Self {
        ParamValue::Str(s.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(s: String) -> Self {
        ParamValue::Str(s)
    }
}

impl From<&Path> for ParamValue {
    fn from(p: &Path) -> Self {
        ParamValue::Str(p.to_string_lossy().into_owned())
    }
}

impl From<PathBuf> for ParamValue {
    fn from(p: PathBuf) -> Self {
        ParamValue::from(p.as_path())
    }
}

impl From<bool> for ParamValue {
    fn from(b: bool) -> Self {
        ParamValue::Bool(b)
    }
}

impl From<i64> for ParamValue {
    fn from(i: i64) -> Self {
        ParamValue::Int(i)
    }
}

impl From<i32> for ParamValue {
    fn from(i: i32) -> Self {
        ParamValue::Int(i as i64)
    }
}

impl From<usize> for ParamValue {
    fn from(i: usize) -> Self {
        ParamValue::Int(i as i64)
    }
}

impl From<f64> for ParamValue {
    fn from(x: f64) -> Self {
        ParamValue::Float(x)
    }
}

impl<T: Into<ParamValue>> From<Vec<T>> for ParamValue {
    fn from(items: Vec<T>) -> Self {
        ParamValue::List(items.into_iter().map(Into::into).collect())
    }
}

pub type ParamMap = BTreeMap<String, ParamValue>;

/// Treats an absent key as false, otherwise defers to `ParamValue::is_truthy`.
pub fn is_true(key: &str, options: &ParamMap) -> bool {
    options.get(key).map(ParamValue::is_truthy).unwrap_or(false)
}

/// Flattens a configuration into `section_key` entries. `general` also gives
/// the unprefixed key, as do `DEFAULT` entries.
pub fn config_to_map(config: &IniConfig) -> ParamMap {
    let mut map = ParamMap::new();
    for (key, value) in config.defaults() {
        map.insert(key.clone(), ParamValue::from_config_str(value));
    }
    for section in config.sections() {
        for (key, value) in config.items(section) {
            let v = ParamValue::from_config_str(&value);
            if section.name == "general" {
                map.insert(key.clone(), v.clone());
            }
            map.insert(format!("{}_{}", section.name, key), v);
        }
    }
    map
}

/// The merged, read-only parameter map shared by every task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Parameters {
    map: ParamMap,
}

impl Parameters {
    pub fn from_map(map: ParamMap) -> Self {
        Parameters { map }
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.map.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.to_string())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamValue)> {
        self.map.iter()
    }

    pub fn as_map(&self) -> &ParamMap {
        &self.map
    }

    pub fn is_true(&self, key: &str) -> bool {
        is_true(key, &self.map)
    }

    pub fn check_parameter(&self, key: &str) -> Result<(), PipelineError> {
        if self.map.contains_key(key) {
            Ok(())
        } else {
            Err(PipelineError::Configuration(format!("need `{}` to be set", key)))
        }
    }

    /// Finds the key to use for `name`: the exact key if present, else the
    /// first key containing `%` whose pattern matches somewhere in `name`.
    pub fn match_parameter(&self, name: &str) -> Result<&str, PipelineError> {
        if let Some((key, _)) = self.map.get_key_value(name) {
            return Ok(key.as_str());
        }
        for key in self.map.keys().filter(|k| k.contains('%')) {
            let pattern = key.split('%').map(regex::escape).collect::<Vec<_>>().join(".*");
            let rx = Regex::new(&pattern)
                .map_err(|e| PipelineError::Configuration(format!("Bad parameter pattern {}: {}", key, e)))?;
            if rx.is_match(name) {
                return Ok(key.as_str());
            }
        }
        Err(PipelineError::Configuration(format!(
            "parameter '{}' can not be matched in dictionary",
            name
        )))
    }

    /// Builds per-task options: parameters < `locals` < `overrides`.
    /// When a non-empty `outfile` is set, keys of the form
    /// `<outfile><sep><param>` replace `param`, which must already exist.
    pub fn substitute(&self, locals: &ParamMap, overrides: &ParamMap) -> Result<TaskOptions, PipelineError> {
        let mut options = self.map.clone();
        options.extend(locals.iter().map(|(k, v)| (k.clone(), v.clone())));
        options.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));

        let outfile = match options.get("outfile") {
            Some(v) => v.to_string(),
            None => return Ok(TaskOptions { map: options }),
        };
        if outfile.is_empty() {
            return Ok(TaskOptions { map: options });
        }

        let specific: Vec<(String, ParamValue)> = options
            .iter()
            .filter(|(k, _)| k.len() > outfile.len() + 1 && k.starts_with(&outfile) && k.as_str() != "outfile")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        for (key, value) in specific {
            let param = match key[outfile.len()..].char_indices().nth(1) {
                Some((idx, _)) => key[outfile.len() + idx..].to_string(),
                None => continue,
            };
            if !options.contains_key(&param) {
                return Err(PipelineError::Configuration(format!(
                    "task specific parameter '{}' does not exist for '{}'",
                    param, key
                )));
            }
            debug!("substituting task specific parameter for {}: {} = {}", outfile, param, value);
            options.insert(param, value);
        }
        Ok(TaskOptions { map: options })
    }

    /// Serialises the parameters as a JSON object.
    pub fn dump(&self) -> Result<String, PipelineError> {
        let object: serde_json::Map<String, JsonValue> =
            self.map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect();
        serde_json::to_string(&JsonValue::Object(object))
            .map_err(|e| PipelineError::IOError(format!("Failed to serialise parameters: {}", e)))
    }
}

/// The options of one `run`/`execute` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskOptions {
    map: ParamMap,
}

impl TaskOptions {
    pub fn from_map(map: ParamMap) -> Self {
        TaskOptions { map }
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.map.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.to_string())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    pub fn insert(&mut self, key: &str, value: impl Into<ParamValue>) {
        self.map.insert(key.to_string(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<ParamValue> {
        self.map.remove(key)
    }

    pub fn is_true(&self, key: &str) -> bool {
        is_true(key, &self.map)
    }

    pub fn as_map(&self) -> &ParamMap {
        &self.map
    }
}

/// Builds `Parameters` from the configuration layers, lowest priority first:
/// hard-coded values, caller defaults, the installation default file, the
/// user's `~/.cgat` and the caller's files. `set` overrides come last.
#[derive(Debug, Clone)]
pub struct ParameterLoader {
    cwd: PathBuf,
    defaults: ParamMap,
    default_ini: Option<PathBuf>,
    user_config: bool,
    home: Option<PathBuf>,
    overrides: Vec<(String, String)>,
}

impl ParameterLoader {
    pub fn new(cwd: &Path) -> Self {
        ParameterLoader {
            cwd: cwd.to_path_buf(),
            defaults: ParamMap::new(),
            default_ini: None,
            user_config: true,
            home: env::var_os("HOME").map(PathBuf::from),
            overrides: Vec::new(),
        }
    }

    pub fn with_default(mut self, key: &str, value: impl Into<ParamValue>) -> Self {
        self.defaults.insert(key.to_string(), value.into());
        self
    }

    pub fn defaults(mut self, defaults: ParamMap) -> Self {
        self.defaults.extend(defaults);
        self
    }

    /// Installation default file. Unlike the other files it must exist.
    pub fn default_ini(mut self, path: &Path) -> Self {
        self.default_ini = Some(path.to_path_buf());
        self
    }

    pub fn user_config(mut self, enabled: bool) -> Self {
        self.user_config = enabled;
        self
    }

    pub fn home_dir(mut self, home: &Path) -> Self {
        self.home = Some(home.to_path_buf());
        self
    }

    /// Command-line style `key=value` override.
    pub fn set(mut self, assignment: &str) -> Result<Self, PipelineError> {
        let (key, value) = assignment
            .split_once('=')
            .ok_or_else(|| PipelineError::Configuration(format!("Expected key=value, got '{}'", assignment)))?;
        self.overrides.push((key.trim().to_string(), value.trim().to_string()));
        Ok(self)
    }

    fn builtin_params(&self) -> ParamMap {
        let mut map: ParamMap = HARDCODED_PARAMS
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();

        let pipeline_bin = env::current_exe()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|_| env!("CARGO_PKG_NAME").to_string());
        map.insert("pipeline_bin".to_string(), ParamValue::Str(pipeline_bin));

        let tmpdir = env::var("TMPDIR").unwrap_or_else(|_| env::temp_dir().to_string_lossy().into_owned());
        map.insert("tmpdir".to_string(), ParamValue::Str(tmpdir));
        let shared = env::var("SHARED_TMPDIR").unwrap_or_else(|_| self.cwd.to_string_lossy().into_owned());
        map.insert("shared_tmpdir".to_string(), ParamValue::Str(shared));
        map
    }

    /// Reads and merges every layer.
    ///
    /// # Arguments
    ///
    /// * `filenames` - Configuration files, later files win. Missing files are skipped.
    ///
    /// # Returns
    ///
    /// The frozen parameter map.
    pub fn load<P: AsRef<Path>>(&self, filenames: &[P]) -> Result<Parameters, PipelineError> {
        let mut config = IniConfig::new();

        if let Some(default_ini) = &self.default_ini {
            if !config.read(default_ini)? {
                return Err(PipelineError::Configuration(format!(
                    "Default configuration {} does not exist",
                    default_ini.display()
                )));
            }
        }
        if self.user_config {
            if let Some(home) = &self.home {
                let user_ini = home.join(USER_CONFIG);
                if config.read(&user_ini)? {
                    debug!("Read user configuration from {}", user_ini.display());
                }
            }
        }
        for filename in filenames {
            let path = absolute_path(&self.cwd, filename.as_ref());
            if config.read(&path)? {
                debug!("Read configuration from {}", path.display());
            } else {
                debug!("Configuration file {} not found, skipping", path.display());
            }
        }

        let mut map = self.builtin_params();
        map.extend(self.defaults.iter().map(|(k, v)| (k.clone(), v.clone())));
        map.extend(config_to_map(&config));
        for (key, value) in &self.overrides {
            map.insert(key.clone(), ParamValue::from_config_str(value));
        }

        for param in INTERPOLATE_PARAMS {
            let template = match map.get(*param) {
                Some(ParamValue::Str(s)) => s.clone(),
                _ => continue,
            };
            let value = interpolate(&template, |k| map.get(k)).map_err(|e| {
                PipelineError::Configuration(format!("could not interpolate {}: {}", template, e))
            })?;
            map.insert(param.to_string(), ParamValue::Str(value));
        }

        for (key, value) in map.iter_mut() {
            if !key.ends_with("dir") {
                continue;
            }
            if let ParamValue::Str(s) = value {
                if s.starts_with('.') {
                    let expanded = absolute_path(&self.cwd, Path::new(s.as_str()));
                    *s = expanded.to_string_lossy().into_owned();
                }
            }
        }

        Ok(Parameters { map })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::fs;
    use tempfile::tempdir;

    fn loader(dir: &Path) -> ParameterLoader {
        ParameterLoader::new(dir).user_config(false)
    }

    #[test]
    fn test_str2val_coercion() {
        assert_eq!(ParamValue::from_config_str("12"), ParamValue::Int(12));
        assert_eq!(ParamValue::from_config_str("-3.5"), ParamValue::Float(-3.5));
        assert_eq!(ParamValue::from_config_str("1e3"), ParamValue::Float(1000.0));
        assert_eq!(ParamValue::from_config_str("inf"), ParamValue::from("inf"));
        assert_eq!(ParamValue::from_config_str("hg19"), ParamValue::from("hg19"));
    }

    #[test]
    fn test_general_and_plain_sections() -> Result<()> {
        let dir = tempdir()?;
        fs::write(dir.path().join("pipeline.ini"), "[general]\ngenome=hg19\n[sample]\nname=12\n")?;
        let params = loader(dir.path()).load(&["pipeline.ini"])?;

        assert_eq!(params.get("general_genome"), Some(&ParamValue::from("hg19")));
        assert_eq!(params.get("genome"), Some(&ParamValue::from("hg19")));
        assert_eq!(params.get("sample_name"), Some(&ParamValue::Int(12)));
        assert!(!params.contains_key("name"));
        Ok(())
    }

    #[test]
    fn test_layer_order() -> Result<()> {
        let dir = tempdir()?;
        let default_ini = dir.path().join("default.ini");
        fs::write(&default_ini, "[general]\ngenome=hg18\nonly_default=yes\n")?;
        fs::create_dir(dir.path().join("home"))?;
        fs::write(dir.path().join("home").join(".cgat"), "[general]\ngenome=hg19\n")?;
        fs::write(dir.path().join("a.ini"), "[general]\ngenome=hg38\n[cluster]\nqueue=fast.q\n")?;
        fs::write(dir.path().join("b.ini"), "[cluster]\nqueue=slow.q\n")?;

        let params = ParameterLoader::new(dir.path())
            .home_dir(&dir.path().join("home"))
            .default_ini(&default_ini)
            .with_default("cluster_queue", "default.q")
            .with_default("genome", "mm10")
            .load(&["a.ini", "b.ini", "missing.ini"])?;

        assert_eq!(params.get_str("genome").as_deref(), Some("hg38"));
        assert_eq!(params.get_str("only_default").as_deref(), Some("yes"));
        assert_eq!(params.get_str("cluster_queue").as_deref(), Some("slow.q"));
        assert_eq!(params.get("cluster_priority"), Some(&ParamValue::Int(-10)));
        Ok(())
    }

    #[test]
    fn test_missing_default_ini_is_error() -> Result<()> {
        let dir = tempdir()?;
        let result = loader(dir.path()).default_ini(&dir.path().join("nope.ini")).load::<&str>(&[]);
        assert!(matches!(result, Err(PipelineError::Configuration(_))));
        Ok(())
    }

    #[test]
    fn test_set_overrides_and_interpolation() -> Result<()> {
        let dir = tempdir()?;
        fs::write(dir.path().join("pipeline.ini"), "[general]\nthreads=4\n")?;
        let params = loader(dir.path())
            .with_default("pipeline_bin", "/opt/bin/pd")
            .set("threads=8")?
            .load(&["pipeline.ini"])?;

        assert_eq!(params.get("threads"), Some(&ParamValue::Int(8)));
        assert_eq!(params.get_str("cmd-run-function").as_deref(), Some("/opt/bin/pd run-function"));
        Ok(())
    }

    #[test]
    fn test_relative_dirs_made_absolute() -> Result<()> {
        let dir = tempdir()?;
        fs::write(dir.path().join("pipeline.ini"), "[general]\nannotations_dir=./annotations\nname=./x\n")?;
        let params = loader(dir.path()).load(&["pipeline.ini"])?;

        let expected = dir.path().join("annotations").to_string_lossy().into_owned();
        assert_eq!(params.get_str("annotations_dir"), Some(expected));
        assert_eq!(params.get_str("name").as_deref(), Some("./x"));
        Ok(())
    }

    #[test]
    fn test_match_parameter() -> Result<()> {
        let mut map = ParamMap::new();
        map.insert("bowtie_threads".to_string(), ParamValue::Int(4));
        map.insert("sample%.bam_threads".to_string(), ParamValue::Int(2));
        let params = Parameters::from_map(map);

        assert_eq!(params.match_parameter("bowtie_threads")?, "bowtie_threads");
        assert_eq!(params.match_parameter("sample12.bam_threads")?, "sample%.bam_threads");
        // '.' is literal, not a regex wildcard
        assert!(params.match_parameter("sample12xbam_threads").is_err());
        assert!(matches!(params.match_parameter("unknown"), Err(PipelineError::Configuration(_))));
        Ok(())
    }

    #[test]
    fn test_substitute_task_specific() -> Result<()> {
        let mut map = ParamMap::new();
        map.insert("threads".to_string(), ParamValue::Int(4));
        map.insert("sample1.bam.gz_threads".to_string(), ParamValue::Int(6));
        let params = Parameters::from_map(map);

        let mut locals = ParamMap::new();
        locals.insert("outfile".to_string(), ParamValue::from("sample1.bam.gz"));
        let options = params.substitute(&locals, &ParamMap::new())?;
        assert_eq!(options.get("threads"), Some(&ParamValue::Int(6)));

        let mut other = ParamMap::new();
        other.insert("outfile".to_string(), ParamValue::from("sample2.bam.gz"));
        let options = params.substitute(&other, &ParamMap::new())?;
        assert_eq!(options.get("threads"), Some(&ParamValue::Int(4)));
        Ok(())
    }

    #[test]
    fn test_substitute_unknown_task_parameter() {
        let mut map = ParamMap::new();
        map.insert("out.txt_nothing".to_string(), ParamValue::Int(1));
        let params = Parameters::from_map(map);

        let mut overrides = ParamMap::new();
        overrides.insert("outfile".to_string(), ParamValue::from("out.txt"));
        let result = params.substitute(&ParamMap::new(), &overrides);
        assert!(matches!(result, Err(PipelineError::Configuration(msg)) if msg.contains("nothing")));
    }

    #[test]
    fn test_substitute_precedence() -> Result<()> {
        let mut map = ParamMap::new();
        map.insert("x".to_string(), ParamValue::Int(1));
        let params = Parameters::from_map(map);

        let mut locals = ParamMap::new();
        locals.insert("x".to_string(), ParamValue::Int(2));
        let mut overrides = ParamMap::new();
        overrides.insert("x".to_string(), ParamValue::Int(3));

        assert_eq!(params.substitute(&locals, &ParamMap::new())?.get("x"), Some(&ParamValue::Int(2)));
        assert_eq!(params.substitute(&locals, &overrides)?.get("x"), Some(&ParamValue::Int(3)));
        Ok(())
    }

    #[test]
    fn test_as_list() {
        assert_eq!(
            ParamValue::from("a, b ,c").as_list(),
            vec![ParamValue::from("a"), ParamValue::from("b"), ParamValue::from("c")]
        );
        assert!(ParamValue::from("").as_list().is_empty());
        assert!(ParamValue::from(" ").as_list().is_empty());
        assert_eq!(ParamValue::from("a,,b,").as_list(), vec![ParamValue::from("a"), ParamValue::from("b")]);
        assert_eq!(ParamValue::Int(5).as_list(), vec![ParamValue::Int(5)]);
    }

    #[test]
    fn test_is_true() {
        let mut map = ParamMap::new();
        for (k, v) in [
            ("zero", ParamValue::Int(0)),
            ("empty", ParamValue::from("")),
            ("lower", ParamValue::from("false")),
            ("upper", ParamValue::from("False")),
            ("float_str", ParamValue::from("0.0")),
            ("one", ParamValue::Int(1)),
        ] {
            map.insert(k.to_string(), v);
        }
        assert!(!is_true("zero", &map));
        assert!(!is_true("empty", &map));
        assert!(!is_true("lower", &map));
        assert!(!is_true("upper", &map));
        assert!(!is_true("absent", &map));
        assert!(is_true("float_str", &map));
        assert!(is_true("one", &map));
    }

    #[test]
    fn test_check_parameter_and_dump() -> Result<()> {
        let mut map = ParamMap::new();
        map.insert("genome".to_string(), ParamValue::from("hg19"));
        map.insert("port".to_string(), ParamValue::Int(3306));
        let params = Parameters::from_map(map);

        assert!(params.check_parameter("genome").is_ok());
        assert!(params.check_parameter("annotations").is_err());

        let dumped: JsonValue = serde_json::from_str(&params.dump()?)?;
        assert_eq!(dumped["genome"], JsonValue::from("hg19"));
        assert_eq!(dumped["port"], JsonValue::from(3306));
        Ok(())
    }
}

// src/utils/statement.rs: building shell statements from templates

use std::path::Path;

use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

use crate::config::defs::{PipelineError, EXEC_PREFIX, EXEC_SUFFIX};
use crate::config::params::{ParamValue, TaskOptions};
use crate::utils::file::temp_filename;

lazy_static! {
    static ref TAB_RUNS: Regex = Regex::new(r"\t+").unwrap();
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum InterpolationError {
    #[error("could not find {0} in dictionaries")]
    MissingKey(String),

    #[error("malformed placeholder at position {position}: {reason}")]
    Malformed { position: usize, reason: String },
}

impl From<InterpolationError> for PipelineError {
    fn from(e: InterpolationError) -> Self {
        PipelineError::Statement(e.to_string())
    }
}

/// Substitutes `%(key)s`, `%(key)i`, `%(key)d` and `%(key)f` placeholders.
/// `%%` is a literal percent sign; any other use of `%` is malformed.
///
/// # Arguments
///
/// * `template` - Text containing placeholders.
/// * `lookup` - Resolves a placeholder key to its value.
///
/// # Returns
///
/// The substituted text.
pub fn interpolate<'a, F>(template: &str, lookup: F) -> Result<String, InterpolationError>
where
    F: Fn(&str) -> Option<&'a ParamValue>,
{
    let mut out = String::with_capacity(template.len());
    let mut chars = template.char_indices();

    while let Some((position, c)) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some((_, '%')) => out.push('%'),
            Some((_, '(')) => {
                let mut key = String::new();
                let mut closed = false;
                for (_, k) in chars.by_ref() {
                    if k == ')' {
                        closed = true;
                        break;
                    }
                    key.push(k);
                }
                if !closed {
                    return Err(InterpolationError::Malformed {
                        position,
                        reason: format!("unterminated key '{}'", key),
                    });
                }
                let conversion = chars.next().map(|(_, c)| c).ok_or_else(|| InterpolationError::Malformed {
                    position,
                    reason: format!("missing conversion after %({})", key),
                })?;
                let value = lookup(&key).ok_or_else(|| InterpolationError::MissingKey(key.clone()))?;
                let rendered = match conversion {
                    's' => value.to_string(),
                    'i' | 'd' => value
                        .as_i64()
                        .ok_or_else(|| InterpolationError::Malformed {
                            position,
                            reason: format!("%({}){} needs a number, got '{}'", key, conversion, value),
                        })?
                        .to_string(),
                    'f' => {
                        let x = value.as_f64().ok_or_else(|| InterpolationError::Malformed {
                            position,
                            reason: format!("%({})f needs a number, got '{}'", key, value),
                        })?;
                        format!("{:.6}", x)
                    }
                    other => {
                        return Err(InterpolationError::Malformed {
                            position,
                            reason: format!("unsupported conversion '{}' for key {}", other, key),
                        });
                    }
                };
                out.push_str(&rendered);
            }
            Some((_, other)) => {
                return Err(InterpolationError::Malformed {
                    position,
                    reason: format!("unsupported format character '{}'", other),
                });
            }
            None => {
                return Err(InterpolationError::Malformed {
                    position,
                    reason: "incomplete format".to_string(),
                });
            }
        }
    }
    Ok(out)
}

/// Doubles every `%` so the text passes through `interpolate` unchanged.
pub fn escape_percent(text: &str) -> String {
    text.replace('%', "%%")
}

/// Builds the statement held under `statement` in `options`, substituting
/// placeholders from the same options and normalising whitespace.
pub fn build_statement(options: &TaskOptions) -> Result<String, PipelineError> {
    let template = options
        .get("statement")
        .ok_or_else(|| PipelineError::Statement("no statement found".to_string()))?
        .to_string();

    let statement = interpolate(&template, |k| options.get(k))?;
    Ok(normalise_whitespace(&statement))
}

/// Collapses tab runs, joins lines and drops one trailing `;`.
pub fn normalise_whitespace(statement: &str) -> String {
    let joined = TAB_RUNS.replace_all(statement, " ").split('\n').collect::<Vec<_>>().join(" ");
    let trimmed = joined.trim();
    trimmed.strip_suffix(';').unwrap_or(trimmed).to_string()
}

/// Wraps `statement` with the pipe-error detection functions, unless
/// `ignore_pipe_errors` is set.
pub fn expand_statement(statement: &str, ignore_pipe_errors: bool) -> String {
    if ignore_pipe_errors {
        statement.to_string()
    } else {
        [EXEC_PREFIX, statement, EXEC_SUFFIX].join(" ")
    }
}

/// Chains statements through temporary files. `@IN@` of the first statement is
/// `first_input`, `@OUT@` of statement x and `@IN@` of statement x+1 are the same
/// temporary file. Steps are separated by `checkpoint` and the temporaries are
/// removed at the end.
///
/// # Arguments
///
/// * `statements` - Templates using `@IN@` and `@OUT@`.
/// * `first_input` - Input of the first statement.
/// * `tmpdir` - Where the temporary prefix is created.
///
/// # Returns
///
/// A single statement.
pub fn join_statements<S: AsRef<str>>(
    statements: &[S],
    first_input: &str,
    tmpdir: &Path,
) -> Result<String, PipelineError> {
    let prefix = temp_filename(tmpdir)?;
    let prefix = prefix.to_string_lossy();
    if prefix.is_empty() {
        return Err(PipelineError::IOError("Empty temporary file prefix".to_string()));
    }

    let mut result = Vec::with_capacity(statements.len() + 1);
    for (x, statement) in statements.iter().enumerate() {
        let input = if x == 0 {
            first_input.to_string()
        } else {
            format!("{}_{}", prefix, x)
        };
        let s = statement
            .as_ref()
            .replace("@IN@", &input)
            .replace("@OUT@", &format!("{}_{}", prefix, x + 1));
        let s = s.trim();
        result.push(s.strip_suffix(';').unwrap_or(s).to_string());
    }
    result.push(format!("rm -f {}*", prefix));
    Ok(result.join("; checkpoint ; "))
}

/// Quotes `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars().all(|c| c.is_ascii_alphanumeric() || "@%+=:,./-_".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r#"'"'"'"#))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::params::ParamMap;
    use anyhow::Result;
    use tempfile::tempdir;

    fn options(pairs: &[(&str, ParamValue)]) -> TaskOptions {
        let map: ParamMap = pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
        TaskOptions::from_map(map)
    }

    #[test]
    fn test_build_simple() -> Result<()> {
        let opts = options(&[("statement", "echo %(x)s".into()), ("x", "hi".into())]);
        assert_eq!(build_statement(&opts)?, "echo hi");
        Ok(())
    }

    #[test]
    fn test_build_missing_key() {
        let opts = options(&[("statement", "echo %(nothere)s".into())]);
        let err = build_statement(&opts).unwrap_err();
        assert!(matches!(&err, PipelineError::Statement(msg) if msg.contains("could not find nothere")));
    }

    #[test]
    fn test_build_missing_statement() {
        let opts = options(&[("x", "hi".into())]);
        assert!(matches!(build_statement(&opts), Err(PipelineError::Statement(_))));
    }

    #[test]
    fn test_malformed_placeholders() {
        let values = options(&[("x", "hi".into()), ("n", 3.into())]);
        let lookup = |k: &str| values.get(k);

        assert!(matches!(interpolate("echo %(x", lookup), Err(InterpolationError::Malformed { .. })));
        assert!(matches!(interpolate("echo %(x)q", lookup), Err(InterpolationError::Malformed { .. })));
        assert!(matches!(interpolate("date +%Y", lookup), Err(InterpolationError::Malformed { .. })));
        assert!(matches!(interpolate("echo 100%", lookup), Err(InterpolationError::Malformed { .. })));
        assert!(matches!(interpolate("head -n %(x)i", lookup), Err(InterpolationError::Malformed { .. })));
        assert_eq!(interpolate("head -n %(n)i; echo 100%%", lookup).unwrap(), "head -n 3; echo 100%");
        assert_eq!(interpolate("%(n)f", lookup).unwrap(), "3.000000");
    }

    #[test]
    fn test_whitespace_normalised() -> Result<()> {
        let opts = options(&[("statement", "cat %(infile)s\t\t|\n  gzip > out.gz;".into()), ("infile", "in.txt".into())]);
        assert_eq!(build_statement(&opts)?, "cat in.txt |   gzip > out.gz");
        Ok(())
    }

    #[test]
    fn test_expand_statement() {
        let expanded = expand_statement("false | true", false);
        assert!(expanded.starts_with("detect_pipe_error_helper()"));
        assert!(expanded.ends_with("false | true ; detect_pipe_error"));
        assert_eq!(expand_statement("false | true", true), "false | true");
    }

    #[test]
    fn test_join_statements() -> Result<()> {
        let dir = tempdir()?;
        let joined = join_statements(&["step1 @OUT@", "step2 @IN@ @OUT@"], "in.txt", dir.path())?;
        let parts: Vec<&str> = joined.split("; checkpoint ; ").collect();
        assert_eq!(parts.len(), 3);

        let first_out = parts[0].strip_prefix("step1 ").unwrap();
        let mut second = parts[1].strip_prefix("step2 ").unwrap().split(' ');
        assert_eq!(second.next(), Some(first_out));
        assert!(first_out.ends_with("_1"));
        assert!(second.next().unwrap().ends_with("_2"));

        let prefix = first_out.strip_suffix("_1").unwrap();
        assert_eq!(parts[2], format!("rm -f {}*", prefix));
        assert!(prefix.starts_with(dir.path().to_string_lossy().as_ref()));
        Ok(())
    }

    #[test]
    fn test_join_first_input() -> Result<()> {
        let dir = tempdir()?;
        let joined = join_statements(&["zcat @IN@ > @OUT@;"], "reads.fq.gz", dir.path())?;
        assert!(joined.starts_with("zcat reads.fq.gz > "));
        assert!(!joined.contains(";;"));
        Ok(())
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain/path.txt"), "plain/path.txt");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r#"'it'"'"'s'"#);
        assert_eq!(shell_quote(""), "''");
    }
}

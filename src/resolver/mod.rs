// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 petflow contributors

//! Path template resolution
//!
//! Templates such as `sub-{subject_id}/ses-{session_id}/anat/*_T1w.nii`
//! are bound to a [`RunInstance`] by substituting placeholders and then
//! matching the remaining glob against the dataset root.

use regex::{Captures, Regex};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::errors::{FlowError, FlowResult};
use crate::params::RunInstance;
use crate::pipeline::{PortKind, PortValue};

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)(?:\.(stem|file|dir))?\}")
            .expect("placeholder regex is valid")
    })
}

/// Placeholder names referenced by a template, in order of appearance
pub fn placeholders(template: &str) -> Vec<String> {
    placeholder_regex()
        .captures_iter(template)
        .map(|c| c[1].to_string())
        .collect()
}

/// Render `{name}` placeholders using `lookup`
///
/// Supported modifiers on a placeholder: `.stem` (file name up to the
/// first dot, so `x_pet.nii.gz` becomes `x_pet`), `.file` (file name) and
/// `.dir` (parent directory). Returns the first placeholder name that
/// `lookup` could not answer.
pub fn render_template<F>(template: &str, lookup: F) -> Result<String, String>
where
    F: Fn(&str) -> Option<String>,
{
    render_with(template, |name| lookup(name).map(|v| vec![v]), false)
}

/// Render a command line; every substituted word is shell-quoted
///
/// A placeholder may expand to several words (a list of files), each
/// quoted separately and joined by spaces.
pub fn render_shell<F>(template: &str, lookup: F) -> Result<String, String>
where
    F: Fn(&str) -> Option<Vec<String>>,
{
    render_with(template, lookup, true)
}

fn render_with<F>(template: &str, lookup: F, quote: bool) -> Result<String, String>
where
    F: Fn(&str) -> Option<Vec<String>>,
{
    let mut missing = None;

    let rendered = placeholder_regex().replace_all(template, |caps: &Captures| {
        let name = &caps[1];
        let modifier = caps.get(2).map(|m| m.as_str());
        match lookup(name) {
            Some(values) => values
                .iter()
                .map(|v| {
                    let v = apply_modifier(v, modifier);
                    if quote {
                        shell_quote(&v)
                    } else {
                        v
                    }
                })
                .collect::<Vec<_>>()
                .join(" "),
            None => {
                missing.get_or_insert_with(|| name.to_string());
                String::new()
            }
        }
    });

    match missing {
        Some(name) => Err(name),
        None => Ok(rendered.into_owned()),
    }
}

/// Quote a word for POSIX shells unless it is plainly safe
pub fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_./:=@%+,-".contains(c));

    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', "'\\''"))
    }
}

fn apply_modifier(value: &str, modifier: Option<&str>) -> String {
    let path = Path::new(value);
    match modifier {
        Some("stem") => {
            let file = path.file_name().and_then(|f| f.to_str()).unwrap_or(value);
            file.split('.').next().unwrap_or(file).to_string()
        }
        Some("file") => path
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or(value)
            .to_string(),
        Some("dir") => path
            .parent()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_default(),
        _ => value.to_string(),
    }
}

/// Binds path templates against a dataset root for one run instance
#[derive(Debug, Clone)]
pub struct Resolver {
    base_dir: PathBuf,
}

impl Resolver {
    /// Create a resolver rooted at `base_dir` (made absolute)
    pub fn new(base_dir: impl Into<PathBuf>) -> FlowResult<Self> {
        let base_dir = base_dir.into();
        let base_dir = if base_dir.is_absolute() {
            base_dir
        } else {
            std::env::current_dir()?.join(base_dir)
        };
        Ok(Self { base_dir })
    }

    /// Dataset root
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Substitute instance values into a template without touching the filesystem
    pub fn substitute(&self, template: &str, instance: &RunInstance) -> FlowResult<String> {
        render_template(template, |name| instance.get(name).map(str::to_string)).map_err(
            |placeholder| FlowError::UnresolvedPlaceholder {
                template: template.to_string(),
                placeholder,
            },
        )
    }

    /// Resolve a template to exactly one existing file
    pub fn bind(&self, template: &str, instance: &RunInstance) -> FlowResult<PathBuf> {
        let (pattern, mut matches) = self.matches(template, instance)?;

        match matches.len() {
            0 => Err(FlowError::NoMatch { pattern }),
            1 => Ok(matches.remove(0)),
            _ => Err(FlowError::AmbiguousMatch { pattern, matches }),
        }
    }

    /// Resolve a template to one or more existing files, sorted
    pub fn bind_all(&self, template: &str, instance: &RunInstance) -> FlowResult<Vec<PathBuf>> {
        let (pattern, matches) = self.matches(template, instance)?;
        if matches.is_empty() {
            return Err(FlowError::NoMatch { pattern });
        }
        Ok(matches)
    }

    /// Resolve a template into a value of the given port kind
    ///
    /// Scalars are substituted only; file kinds are matched on disk.
    pub fn resolve(
        &self,
        template: &str,
        kind: PortKind,
        instance: &RunInstance,
    ) -> FlowResult<PortValue> {
        let value = match kind {
            PortKind::Scalar => PortValue::Scalar(self.substitute(template, instance)?),
            PortKind::FilePath => PortValue::FilePath(self.bind(template, instance)?),
            PortKind::ListOfFilePath => {
                PortValue::ListOfFilePath(self.bind_all(template, instance)?)
            }
        };

        tracing::debug!(template, instance = %instance, value = %value, "Resolved template");
        Ok(value)
    }

    fn matches(&self, template: &str, instance: &RunInstance) -> FlowResult<(String, Vec<PathBuf>)> {
        // Instance values are literal text, never glob syntax
        let relative = render_template(template, |name| {
            instance.get(name).map(glob::Pattern::escape)
        })
        .map_err(|placeholder| FlowError::UnresolvedPlaceholder {
            template: template.to_string(),
            placeholder,
        })?;

        let pattern = if Path::new(&relative).is_absolute() {
            relative
        } else {
            format!(
                "{}/{}",
                glob::Pattern::escape(&self.base_dir.to_string_lossy()),
                relative
            )
        };

        let mut matches: Vec<PathBuf> = glob::glob(&pattern)?.filter_map(Result::ok).collect();
        matches.sort();

        Ok((pattern, matches))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn instance() -> RunInstance {
        RunInstance::from_pairs([("subject_id", "01"), ("session_id", "A")])
    }

    fn touch(root: &Path, rel: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"x").unwrap();
    }

    #[test]
    fn test_render_modifiers() {
        let rendered = render_template("{in_file.stem}_mcf.nii.gz in {in_file.dir}", |name| {
            (name == "in_file").then(|| "/data/sub-01_pet.nii.gz".to_string())
        })
        .unwrap();
        assert_eq!(rendered, "sub-01_pet_mcf.nii.gz in /data");
    }

    #[test]
    fn test_render_reports_missing() {
        let err = render_template("{a}/{b}", |name| (name == "a").then(|| "x".to_string()));
        assert_eq!(err, Err("b".to_string()));
    }

    #[test]
    fn test_render_shell_quotes_words() {
        let rendered = render_shell("cat {files} > {out.file}", |name| match name {
            "files" => Some(vec!["/d/a b.txt".into(), "/d/c.txt".into()]),
            "out" => Some(vec!["/w/it's.txt".into()]),
            _ => None,
        })
        .unwrap();
        assert_eq!(rendered, r#"cat '/d/a b.txt' /d/c.txt > 'it'\''s.txt'"#);
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(
            placeholders("sub-{subject_id}/ses-{session_id}/{x.stem}"),
            vec!["subject_id", "session_id", "x"]
        );
    }

    #[test]
    fn test_bind_single_match() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "sub-01/sub-01_T1w.nii");
        touch(dir.path(), "sub-02/sub-02_T1w.nii");

        let resolver = Resolver::new(dir.path()).unwrap();
        let path = resolver.bind("sub-{subject_id}/*_T1w.nii", &instance()).unwrap();

        assert!(path.is_absolute());
        assert_eq!(path, dir.path().join("sub-01/sub-01_T1w.nii"));
    }

    #[test]
    fn test_bind_no_match() {
        let dir = TempDir::new().unwrap();
        let resolver = Resolver::new(dir.path()).unwrap();

        let result = resolver.bind("sub-{subject_id}/*_T1w.nii", &instance());
        assert!(matches!(result, Err(FlowError::NoMatch { .. })));
    }

    #[test]
    fn test_bind_ambiguous_match() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "sub-01/run-1_T1w.nii");
        touch(dir.path(), "sub-01/run-2_T1w.nii");

        let resolver = Resolver::new(dir.path()).unwrap();
        match resolver.bind("sub-{subject_id}/*_T1w.nii", &instance()) {
            Err(FlowError::AmbiguousMatch { matches, .. }) => assert_eq!(matches.len(), 2),
            other => panic!("expected ambiguous match, got {other:?}"),
        }

        let all = resolver.bind_all("sub-{subject_id}/*_T1w.nii", &instance()).unwrap();
        assert!(all[0].ends_with("run-1_T1w.nii"));
    }

    #[test]
    fn test_bind_unresolved_placeholder() {
        let dir = TempDir::new().unwrap();
        let resolver = Resolver::new(dir.path()).unwrap();

        let result = resolver.bind("sub-{participant}/*.nii", &instance());
        assert!(matches!(
            result,
            Err(FlowError::UnresolvedPlaceholder { ref placeholder, .. }) if placeholder == "participant"
        ));
    }

    #[test]
    fn test_instance_values_are_not_globbed() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "sub-x/file.nii");

        let resolver = Resolver::new(dir.path()).unwrap();
        let starred = RunInstance::from_pairs([("subject_id", "*")]);
        let result = resolver.bind("sub-{subject_id}/file.nii", &starred);
        assert!(matches!(result, Err(FlowError::NoMatch { .. })));
    }

    #[test]
    fn test_resolve_scalar() {
        let resolver = Resolver::new("/tmp").unwrap();
        let value = resolver
            .resolve("{session_id}_{subject_id}", PortKind::Scalar, &instance())
            .unwrap();
        assert_eq!(value, PortValue::Scalar("A_01".into()));
    }
}

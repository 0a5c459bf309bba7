//! Argument building shared by the recovery and merge stages.

use std::path::Path;

use crate::config::EncoderSection;

/// Leading arguments for every encoder invocation: quiet console, progress on stdout.
pub fn base_args(encoder: &EncoderSection) -> Vec<String> {
    vec![
        "-hide_banner".to_string(),
        "-nostdin".to_string(),
        "-loglevel".to_string(),
        encoder.log_level.clone(),
        "-nostats".to_string(),
        "-progress".to_string(),
        "pipe:1".to_string(),
        "-y".to_string(),
    ]
}

/// Body of a concat-demuxer list file.
pub fn concat_manifest<'a, I>(paths: I) -> String
where
    I: IntoIterator<Item = &'a Path>,
{
    let mut manifest = String::from("ffconcat version 1.0\n");
    for path in paths {
        manifest.push_str("file '");
        manifest.push_str(&escape_manifest_path(path));
        manifest.push_str("'\n");
    }
    manifest
}

fn escape_manifest_path(path: &Path) -> String {
    path.to_string_lossy().replace('\'', "'\\''")
}

pub fn path_arg(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

/// Extends `args` with string slices.
pub fn push_all(args: &mut Vec<String>, values: &[&str]) {
    args.extend(values.iter().map(|value| value.to_string()));
}

//! Configuration loaders: dotenv preload, config files, environment
//! variables and CLI switches.
//!
//! Loader precedence is decided by the order the manager runs them in
//! (file → env → CLI, later overriding earlier); this module only knows how
//! to discover and decode each source.
//!
//! Name matching for env/CLI follows two tiers per `(module, key)`:
//! an exact match on `<module>_<key>` or bare `<key>`, then a
//! case-insensitive match where `_` and `-` are interchangeable. The first
//! match wins.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::Value as JsonValue;

/// Filesystem roots the file loader searches under. Injectable so tests can
/// point the loader at a scratch directory instead of the real `/etc`.
#[derive(Debug, Clone)]
pub struct SearchPaths {
    pub etc_dir: PathBuf,
    pub cwd: PathBuf,
    pub home: PathBuf,
}

impl Default for SearchPaths {
    fn default() -> Self {
        Self {
            etc_dir: PathBuf::from("/etc"),
            cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            home: dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")),
        }
    }
}

/// Which sources run and where they read from.
#[derive(Debug, Clone)]
pub struct LoaderOptions {
    /// Run the config-file loader.
    pub file: bool,
    /// Run the environment loader.
    pub env: bool,
    /// Run the CLI switch loader.
    pub cli: bool,
    /// Argument vector consumed by the CLI loader and the `--config` /
    /// `--env-file` switches. `None` reads the process arguments.
    pub argv: Option<Vec<String>>,
    /// dotenv path override; beaten by an `--env-file` switch.
    pub env_file: Option<PathBuf>,
    pub search_paths: SearchPaths,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            file: true,
            env: true,
            cli: true,
            argv: None,
            env_file: None,
            search_paths: SearchPaths::default(),
        }
    }
}

impl LoaderOptions {
    pub(crate) fn argv(&self) -> Vec<String> {
        self.argv
            .clone()
            .unwrap_or_else(|| std::env::args().skip(1).collect())
    }
}

/// Raw values keyed by canonical module and key names.
pub(crate) type RawPartial = HashMap<String, HashMap<String, JsonValue>>;

/// Declared `(module, keys)` pairs, used to canonicalize loader input.
pub(crate) type SchemaIndex = Vec<(String, Vec<String>)>;

/// Case-insensitive name comparison where `_` and `-` are interchangeable.
pub(crate) fn names_match(a: &str, b: &str) -> bool {
    let sep = |c: u8| c == b'_' || c == b'-';
    a.len() == b.len()
        && a.bytes()
            .zip(b.bytes())
            .all(|(x, y)| (sep(x) && sep(y)) || x.eq_ignore_ascii_case(&y))
}

fn find_canonical<'a>(declared: &'a [String], candidate: &str) -> Option<&'a str> {
    declared
        .iter()
        .find(|d| names_match(d, candidate))
        .map(String::as_str)
}

// ---------------- CLI parsing ----------------

/// Parse `--KEY value` and `--KEY=value` switches. A switch with no value
/// reads as `"true"`.
fn parse_flags(argv: &[String]) -> Vec<(String, String)> {
    let mut flags = Vec::new();
    let mut i = 0;
    while i < argv.len() {
        if let Some(name) = argv[i].strip_prefix("--") {
            if let Some((n, v)) = name.split_once('=') {
                flags.push((n.to_owned(), v.to_owned()));
            } else if i + 1 < argv.len() && !argv[i + 1].starts_with("--") {
                flags.push((name.to_owned(), argv[i + 1].clone()));
                i += 1;
            } else {
                flags.push((name.to_owned(), "true".to_owned()));
            }
        }
        i += 1;
    }
    flags
}

/// Value of a single well-known switch (`--config`, `--env-file`), matched
/// with the same relaxed rules as config keys.
pub(crate) fn flag_value(argv: &[String], name: &str) -> Option<String> {
    parse_flags(argv)
        .into_iter()
        .find(|(n, _)| names_match(n, name))
        .map(|(_, v)| v)
}

// ---------------- dotenv preload ----------------

/// Load a dotenv file into the process environment before the environment
/// loader runs. Resolution: `--env-file` switch → options → `./.env`.
pub(crate) fn preload_env_file(options: &LoaderOptions, argv: &[String]) {
    let path = flag_value(argv, "env-file")
        .map(PathBuf::from)
        .or_else(|| options.env_file.clone())
        .unwrap_or_else(|| options.search_paths.cwd.join(".env"));

    if !path.is_file() {
        tracing::warn!(path = %path.display(), "env file not found, continuing without it");
        return;
    }
    match dotenvy::from_path(&path) {
        Ok(()) => tracing::debug!(path = %path.display(), "loaded env file"),
        Err(error) => {
            tracing::warn!(path = %path.display(), error = %error, "failed to load env file");
        }
    }
}

// ---------------- file loader ----------------

const FILE_EXTENSIONS: &[&str] = &["", "ini", "json", "yaml", "yml"];

fn with_extension(base: &Path, ext: &str) -> PathBuf {
    if ext.is_empty() {
        return base.to_path_buf();
    }
    let mut os = base.as_os_str().to_owned();
    os.push(format!(".{ext}"));
    PathBuf::from(os)
}

/// Candidate config files in precedence order (earlier entries are loaded
/// first; later files override them per key).
pub(crate) fn candidate_paths(app: &str, paths: &SearchPaths) -> Vec<PathBuf> {
    let bases = [
        paths.etc_dir.join(app).join("config"),
        paths.etc_dir.join(app),
        paths.cwd.join(format!(".{app}")),
        paths.home.join(".config").join(app),
        paths.home.join(".config").join(app).join("config"),
    ];
    let mut candidates = Vec::with_capacity(bases.len() * FILE_EXTENSIONS.len());
    for base in &bases {
        for ext in FILE_EXTENSIONS {
            candidates.push(with_extension(base, ext));
        }
    }
    candidates
}

/// Decode one config file into `module → key → raw value`. Section-less INI
/// keys and top-level scalars in JSON/YAML belong to the application module.
fn read_config_file(path: &Path, app: &str) -> Option<RawPartial> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    match ext.as_str() {
        "json" => {
            let raw = std::fs::read_to_string(path).ok()?;
            match serde_json::from_str::<JsonValue>(&raw) {
                Ok(value) => Some(modules_from_value(&value, app)),
                Err(error) => {
                    tracing::warn!(path = %path.display(), error = %error, "skipping unparsable JSON config file");
                    None
                }
            }
        }
        "yaml" | "yml" => {
            let raw = std::fs::read_to_string(path).ok()?;
            match serde_saphyr::from_str::<JsonValue>(&raw) {
                Ok(value) => Some(modules_from_value(&value, app)),
                Err(error) => {
                    tracing::warn!(path = %path.display(), error = %error, "skipping unparsable YAML config file");
                    None
                }
            }
        }
        // `.ini` and extension-less candidates decode as INI.
        _ => match ini::Ini::load_from_file(path) {
            Ok(file) => {
                let mut out = RawPartial::new();
                for (section, properties) in file.iter() {
                    let module = section.unwrap_or(app).to_owned();
                    let entry = out.entry(module).or_default();
                    for (key, value) in properties.iter() {
                        entry.insert(key.to_owned(), JsonValue::String(value.to_owned()));
                    }
                }
                Some(out)
            }
            Err(error) => {
                tracing::warn!(path = %path.display(), error = %error, "skipping unparsable INI config file");
                None
            }
        },
    }
}

fn modules_from_value(value: &JsonValue, app: &str) -> RawPartial {
    let mut out = RawPartial::new();
    let Some(top) = value.as_object() else {
        tracing::warn!("config file root is not a mapping, ignoring");
        return out;
    };
    for (name, entry) in top {
        match entry.as_object() {
            Some(keys) => {
                let module = out.entry(name.clone()).or_default();
                for (key, raw) in keys {
                    module.insert(key.clone(), raw.clone());
                }
            }
            // Top-level scalars configure the application module itself.
            None => {
                out.entry(app.to_owned())
                    .or_default()
                    .insert(name.clone(), entry.clone());
            }
        }
    }
    out
}

/// Run the file loader: either the single `--config` file or every existing
/// candidate, merged in candidate order with later files winning per key.
pub(crate) fn load_files(
    app: &str,
    index: &SchemaIndex,
    options: &LoaderOptions,
    argv: &[String],
) -> RawPartial {
    let files: Vec<PathBuf> = match flag_value(argv, "config") {
        Some(single) => vec![PathBuf::from(single)],
        None => candidate_paths(app, &options.search_paths)
            .into_iter()
            .filter(|p| p.is_file())
            .collect(),
    };

    let mut merged = RawPartial::new();
    for path in files {
        if !path.is_file() {
            tracing::warn!(path = %path.display(), "config file does not exist");
            continue;
        }
        let Some(decoded) = read_config_file(&path, app) else {
            continue;
        };
        tracing::debug!(path = %path.display(), "loaded config file");
        canonicalize_into(&mut merged, decoded, index);
    }
    merged
}

fn canonicalize_into(target: &mut RawPartial, source: RawPartial, index: &SchemaIndex) {
    for (module_name, entries) in source {
        let Some((module, keys)) = index
            .iter()
            .find(|(declared, _)| names_match(declared, &module_name))
        else {
            tracing::debug!(module = %module_name, "ignoring config for undeclared module");
            continue;
        };
        let target_module = target.entry(module.clone()).or_default();
        for (key_name, raw) in entries {
            match find_canonical(keys, &key_name) {
                Some(key) => {
                    target_module.insert(key.to_owned(), raw);
                }
                None => {
                    tracing::debug!(module = %module, key = %key_name, "ignoring undeclared config key");
                }
            }
        }
    }
}

// ---------------- environment loader ----------------

fn lookup<'a>(
    pairs: &'a [(String, String)],
    module: &str,
    key: &str,
) -> Option<&'a str> {
    let qualified = format!("{module}_{key}");
    pairs
        .iter()
        .find(|(name, _)| name == &qualified)
        .or_else(|| pairs.iter().find(|(name, _)| name == key))
        .or_else(|| pairs.iter().find(|(name, _)| names_match(name, &qualified)))
        .or_else(|| pairs.iter().find(|(name, _)| names_match(name, key)))
        .map(|(_, value)| value.as_str())
}

pub(crate) fn load_env(index: &SchemaIndex) -> RawPartial {
    let mut pairs: Vec<(String, String)> = std::env::vars().collect();
    pairs.sort_by(|a, b| a.0.cmp(&b.0));
    load_from_pairs(index, &pairs)
}

// ---------------- CLI loader ----------------

pub(crate) fn load_cli(index: &SchemaIndex, argv: &[String]) -> RawPartial {
    let flags = parse_flags(argv);
    load_from_pairs(index, &flags)
}

fn load_from_pairs(index: &SchemaIndex, pairs: &[(String, String)]) -> RawPartial {
    let mut out = RawPartial::new();
    for (module, keys) in index {
        for key in keys {
            if let Some(value) = lookup(pairs, module, key) {
                out.entry(module.clone())
                    .or_default()
                    .insert(key.clone(), JsonValue::String(value.to_owned()));
            }
        }
    }
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn index() -> SchemaIndex {
        vec![(
            "testing".to_owned(),
            vec!["CURRENT_WEATHER".to_owned(), "STRING".to_owned()],
        )]
    }

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn names_match_is_case_and_separator_insensitive() {
        assert!(names_match("current_weather", "CURRENT_WEATHER"));
        assert!(names_match("current-weather", "CURRENT_WEATHER"));
        assert!(names_match("Testing_Current-Weather", "testing_CURRENT_WEATHER"));
        assert!(!names_match("current_weather", "CURRENT_WEATHE"));
        assert!(!names_match("currentweather", "CURRENT_WEATHER"));
    }

    #[test]
    fn parse_flags_handles_both_forms() {
        let flags = parse_flags(&args(&["--A=1", "--B", "2", "--C", "--D=x=y"]));
        assert_eq!(
            flags,
            vec![
                ("A".to_owned(), "1".to_owned()),
                ("B".to_owned(), "2".to_owned()),
                ("C".to_owned(), "true".to_owned()),
                ("D".to_owned(), "x=y".to_owned()),
            ]
        );
    }

    #[test]
    fn cli_loader_matches_relaxed_names() {
        let partial = load_cli(&index(), &args(&["--current_WEATHER=hail"]));
        assert_eq!(
            partial["testing"]["CURRENT_WEATHER"],
            JsonValue::String("hail".to_owned())
        );
    }

    #[test]
    fn qualified_name_wins_over_bare() {
        let pairs = vec![
            ("CURRENT_WEATHER".to_owned(), "bare".to_owned()),
            ("testing_CURRENT_WEATHER".to_owned(), "qualified".to_owned()),
        ];
        assert_eq!(lookup(&pairs, "testing", "CURRENT_WEATHER"), Some("qualified"));
    }

    #[test]
    fn candidate_paths_follow_documented_order() {
        let paths = SearchPaths {
            etc_dir: PathBuf::from("/etc"),
            cwd: PathBuf::from("/work"),
            home: PathBuf::from("/home/me"),
        };
        let candidates = candidate_paths("demo", &paths);
        assert_eq!(candidates[0], PathBuf::from("/etc/demo/config"));
        // Second base, bare extension-less form.
        assert_eq!(
            candidates[FILE_EXTENSIONS.len()],
            PathBuf::from("/etc/demo")
        );
        assert_eq!(
            candidates[2 * FILE_EXTENSIONS.len()],
            PathBuf::from("/work/.demo")
        );
        assert!(candidates.contains(&PathBuf::from("/home/me/.config/demo.yaml")));
        assert!(candidates.contains(&PathBuf::from("/home/me/.config/demo/config.json")));
    }

    #[test]
    fn later_candidate_overrides_earlier() {
        let tmp = tempdir().unwrap();
        let etc = tmp.path().join("etc");
        let cwd = tmp.path().join("work");
        fs::create_dir_all(&etc).unwrap();
        fs::create_dir_all(&cwd).unwrap();

        fs::write(etc.join("demo.ini"), "string=A\n").unwrap();
        fs::write(cwd.join(".demo.yaml"), "STRING: B\n").unwrap();

        let options = LoaderOptions {
            search_paths: SearchPaths {
                etc_dir: etc.clone(),
                cwd: cwd.clone(),
                home: tmp.path().join("nohome"),
            },
            ..Default::default()
        };
        let idx = vec![("demo".to_owned(), vec!["STRING".to_owned()])];

        let merged = load_files("demo", &idx, &options, &[]);
        assert_eq!(merged["demo"]["STRING"], JsonValue::String("B".to_owned()));

        // Removing the cwd file falls back to /etc.
        fs::remove_file(cwd.join(".demo.yaml")).unwrap();
        let merged = load_files("demo", &idx, &options, &[]);
        assert_eq!(merged["demo"]["STRING"], JsonValue::String("A".to_owned()));
    }

    #[test]
    fn config_switch_replaces_search() {
        let tmp = tempdir().unwrap();
        let cwd = tmp.path().join("work");
        fs::create_dir_all(&cwd).unwrap();
        fs::write(cwd.join(".demo.ini"), "STRING=searched\n").unwrap();

        let single = tmp.path().join("explicit.json");
        fs::write(&single, r#"{"STRING": "explicit"}"#).unwrap();

        let options = LoaderOptions {
            search_paths: SearchPaths {
                etc_dir: tmp.path().join("noetc"),
                cwd,
                home: tmp.path().join("nohome"),
            },
            ..Default::default()
        };
        let idx = vec![("demo".to_owned(), vec!["STRING".to_owned()])];
        let argv = args(&["--CONFIG", single.to_str().unwrap()]);

        let merged = load_files("demo", &idx, &options, &argv);
        assert_eq!(
            merged["demo"]["STRING"],
            JsonValue::String("explicit".to_owned())
        );
    }

    #[test]
    fn ini_sections_map_to_modules() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("cfg.ini");
        fs::write(&path, "top=1\n[testing]\nCURRENT_WEATHER=sleet\n").unwrap();

        let decoded = read_config_file(&path, "demo").unwrap();
        assert_eq!(
            decoded["testing"]["CURRENT_WEATHER"],
            JsonValue::String("sleet".to_owned())
        );
        assert_eq!(decoded["demo"]["top"], JsonValue::String("1".to_owned()));
    }

    #[test]
    fn json_top_level_scalars_belong_to_the_app() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("cfg.json");
        fs::write(&path, r#"{"STRING": "top", "testing": {"CURRENT_WEATHER": "snow"}}"#)
            .unwrap();

        let decoded = read_config_file(&path, "demo").unwrap();
        assert_eq!(decoded["demo"]["STRING"], JsonValue::String("top".to_owned()));
        assert_eq!(
            decoded["testing"]["CURRENT_WEATHER"],
            JsonValue::String("snow".to_owned())
        );
    }
}

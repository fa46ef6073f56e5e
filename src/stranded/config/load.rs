use std::borrow::Cow;
use std::env;
use std::path::{Path, PathBuf};

use regex::{Captures, Regex};
use tracing::{debug, info, info_span};

use crate::stranded::common::{Error, Result};
use crate::stranded::config::config::{self, Settings};

/// Loads configuration settings from a YAML file, searching in order:
/// 1) the path given as the first command line argument
/// 2) the current directory
/// 3) any parent directory of the current directory, up to root
/// 4) `~/.config/<config_name>/`
/// 5) `~/.<config_name>`
/// 6) `/etc/<config_name>/`
///
/// `${VAR}` and `${VAR:default}` placeholders in the file are substituted
/// from the process environment before parsing. A default beginning with
/// `?` is instead treated as a required-variable error message.
pub fn load_config(config_name: &str) -> Result<&'static Settings> {
    let _span = info_span!("loading config file").entered();
    let config_path = find_config_file(config_name)?;
    info!(config_path = %config_path.to_string_lossy(), "found config file");
    let raw_yaml = std::fs::read_to_string(&config_path)?;
    let yaml_text = replace_env_vars(&raw_yaml)?;

    // Safety: this runs once, before the runtime starts, and nothing else
    // touches SETTINGS until `config()` is called from within the runtime.
    let settings = unsafe { config::settings_slot() };
    *settings = serde_yaml::from_str(&yaml_text)?;
    settings.finish_loading(config_path)?;
    Ok(&*settings)
}

fn find_config_file(config_name: &str) -> Result<PathBuf> {
    if let Some(path) = env::args().nth(1) {
        debug!("using config_path passed on command line");
        return Ok(PathBuf::from(path));
    }

    if let Ok(start) = env::current_dir() {
        let mut dir = start.as_path();
        while !dir.as_os_str().is_empty() {
            debug!("checking for config file in {}", dir.to_string_lossy());
            let fp = Path::join(dir, config_name);
            if fp.exists() {
                return Ok(fp);
            }
            match dir.parent() {
                Some(parent) => dir = parent,
                None => break,
            }
        }
    }

    let app = config_name.split('.').next().unwrap_or(config_name);
    let home = env::var("HOME").unwrap_or_else(|_| "~/".to_string());

    let mut conf_path = Path::join(Path::new(&home), Path::join(Path::new(".config").join(app), config_name));
    debug!("checking for config file in {}", conf_path.to_string_lossy());
    if conf_path.exists() {
        return Ok(conf_path);
    }

    conf_path = Path::join(Path::new(&home), ".".to_string() + config_name);
    debug!("checking for config file in {}", conf_path.to_string_lossy());
    if conf_path.exists() {
        return Ok(conf_path);
    }

    conf_path = Path::join(Path::new("/etc").join(app), config_name);
    debug!("checking for config file in {}", conf_path.to_string_lossy());
    if conf_path.exists() {
        return Ok(conf_path);
    }

    Err(Error::new(format!("config file {} not found", config_name)))
}

fn replace_env_vars(raw_yaml: &str) -> Result<Cow<str>> {
    // We only call this once per process, so there's no point caching the regex.
    let re_var = Regex::new(r"\$\{([a-zA-Z_][0-9a-zA-Z_]*)(?::([^}]+?))?\}").unwrap();

    let mut errors = Vec::<String>::new();

    let replaced = re_var.replace_all(raw_yaml, |caps: &Captures| match env::var(&caps[1]) {
        Ok(val) => val,
        Err(_) => {
            if let Some(default) = caps.get(2) {
                let s = default.as_str();
                if let Some(msg) = s.strip_prefix('?') {
                    errors.push(msg.to_string());
                    String::new()
                } else {
                    s.to_string()
                }
            } else {
                errors.push(format!("environment variable {} is required but not defined", &caps[1]));
                String::new()
            }
        }
    });

    if errors.is_empty() {
        Ok(Cow::Owned(replaced.into_owned()))
    } else {
        Err(Error::new(errors.join("\n")))
    }
}

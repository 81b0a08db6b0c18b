use std::{env, path::PathBuf};

use anyhow::{Result, anyhow};

const DEFAULT_CONFIG_FILE: &str = "autolink-router.jsonc";

pub fn config_path_from_args() -> Result<PathBuf> {
    config_path_from(env::args().skip(1))
}

fn config_path_from(args: impl IntoIterator<Item = String>) -> Result<PathBuf> {
    let mut args = args.into_iter();
    let path = match args.next().as_deref() {
        None => None,
        Some("--config") => Some(
            args.next()
                .ok_or_else(|| anyhow!("--config expects a path"))?,
        ),
        Some(other) => {
            return Err(anyhow!(
                "unexpected argument '{other}'. Usage: autolink-router [--config <path>]"
            ));
        }
    };

    if args.next().is_some() {
        return Err(anyhow!(
            "expected at most one option. Usage: autolink-router [--config <path>]"
        ));
    }

    match path {
        Some(path) => Ok(PathBuf::from(path)),
        None => {
            let mut path = env::current_dir()?;
            path.push(DEFAULT_CONFIG_FILE);
            Ok(path)
        }
    }
}

/* This file is part of Retro
 *
 * Copyright (C) 2023-2026 Dyne.org foundation
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as
 * published by the Free Software Foundation, either version 3 of the
 * License, or (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use std::{
    env, fs,
    path::{Path, PathBuf},
};

use crate::{Error, Result};

/// Returns the user's home directory.
pub fn home_dir() -> Result<PathBuf> {
    match env::var("HOME") {
        Ok(home) if !home.is_empty() => Ok(PathBuf::from(home)),
        _ => Err(Error::OperationFailed("HOME is not set".to_string())),
    }
}

/// Expand a leading `~` or `~/` to the user's home directory.
pub fn expand_path(path: &str) -> Result<PathBuf> {
    if path == "~" {
        return home_dir()
    }

    if let Some(stripped) = path.strip_prefix("~/") {
        return Ok(home_dir()?.join(stripped))
    }

    Ok(PathBuf::from(path))
}

/// Create a directory and any missing parents, if it does not exist yet.
pub fn ensure_dir(path: &Path) -> Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)?;
    }
    Ok(())
}

/// Resolve the directory used for downloaded files.
///
/// Prefers `~/Downloads` (or `~/downloads`) when present, otherwise
/// `<base_dir>/downloads` is created and used.
pub fn download_dir(base_dir: &Path) -> Result<PathBuf> {
    if let Ok(home) = home_dir() {
        for name in ["Downloads", "downloads"] {
            let path = home.join(name);
            if path.is_dir() {
                return Ok(path)
            }
        }
    }

    let path = base_dir.join("downloads");
    ensure_dir(&path)?;
    Ok(path)
}

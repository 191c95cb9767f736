use crate::errors::AppResult;
use crate::store::write_atomic;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::Path;

const CLIENT_TYPES: &str = include_str!("../resources/autocomplete/client.d.ts.txt");
const SERVER_TYPES: &str = include_str!("../resources/autocomplete/server.d.ts.txt");
const PROJECT_CONFIG: &str = include_str!("../resources/autocomplete/jsconfig.json.txt");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupportFilesReport {
    pub type_hints_written: usize,
    pub project_config_written: bool,
}

/// Refreshes the type-hint files and seeds `jsconfig.json` when absent.
pub fn install(root: &Path) -> AppResult<SupportFilesReport> {
    let hints = root.join("autocomplete");
    write_atomic(&hints.join("client.d.ts"), CLIENT_TYPES.as_bytes())?;
    write_atomic(&hints.join("server.d.ts"), SERVER_TYPES.as_bytes())?;

    let project_config_written = write_if_absent(&root.join("jsconfig.json"), PROJECT_CONFIG)?;
    Ok(SupportFilesReport {
        type_hints_written: 2,
        project_config_written,
    })
}

fn write_if_absent(path: &Path, content: &str) -> AppResult<bool> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(mut file) => {
            file.write_all(content.as_bytes())?;
            Ok(true)
        }
        Err(error) if error.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(error) => Err(error.into()),
    }
}

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use uuid::Uuid;

static ARTIFACT_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,254}$").unwrap());

/// A file name inside the artifact store.
///
/// Only names the store itself could have generated are accepted, so a name
/// can never carry a path separator or climb out of the store root.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactName(String);

impl ArtifactName {
    pub fn parse(name: &str) -> Option<Self> {
        if ARTIFACT_NAME_RE.is_match(name) && !name.contains("..") {
            Some(ArtifactName(name.to_owned()))
        } else {
            None
        }
    }

    /// `<prefix>_<unix millis>_<random hex>.<ext>`, unique across concurrent jobs.
    pub fn generate(prefix: &str, ext: &str) -> Self {
        ArtifactName(format!(
            "{prefix}_{}_{}.{ext}",
            unix_millis(),
            Uuid::new_v4().simple()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn extension(&self) -> Option<&str> {
        Path::new(&self.0).extension().and_then(|ext| ext.to_str())
    }

    pub fn stem(&self) -> &str {
        Path::new(&self.0)
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or(&self.0)
    }
}

impl fmt::Display for ArtifactName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or_default()
}

/// A file accepted by upload intake and written into the store.
#[derive(Debug, Clone)]
pub struct UploadedInput {
    pub path: PathBuf,
    pub name: ArtifactName,
    pub original_name: String,
    pub content_type: String,
    pub size: u64,
}

/// What the converter is asked to do, and where it should write.
#[derive(Debug, Clone, PartialEq)]
pub enum Invocation {
    FlattenPdf { output: PathBuf },
    ListClients,
    ConvertClient { output_dir: PathBuf, client_index: u64 },
    ConvertAllToZip { output_dir: PathBuf, zip_path: PathBuf },
    GenerateEmptyFdf { output_dir: PathBuf },
}

impl Invocation {
    pub fn name(&self) -> &'static str {
        match self {
            Invocation::FlattenPdf { .. } => "flatten_pdf",
            Invocation::ListClients => "list_clients",
            Invocation::ConvertClient { .. } => "convert_client",
            Invocation::ConvertAllToZip { .. } => "convert_all_to_zip",
            Invocation::GenerateEmptyFdf { .. } => "generate_empty_fdf",
        }
    }

    /// Positional arguments following the converter's leading arguments.
    pub fn arguments(&self, input: &Path) -> Vec<OsString> {
        let mut arguments = vec![input.as_os_str().to_owned()];

        match self {
            Invocation::FlattenPdf { output } => arguments.push(output.clone().into()),
            Invocation::ListClients => arguments.push(self.name().into()),
            Invocation::ConvertClient {
                output_dir,
                client_index,
            } => {
                arguments.push(self.name().into());
                arguments.push(output_dir.clone().into());
                arguments.push(client_index.to_string().into());
            }
            Invocation::ConvertAllToZip {
                output_dir,
                zip_path,
            } => {
                arguments.push(self.name().into());
                arguments.push(output_dir.clone().into());
                arguments.push(zip_path.clone().into());
            }
            Invocation::GenerateEmptyFdf { output_dir } => {
                arguments.push(self.name().into());
                arguments.push(output_dir.clone().into());
            }
        }

        arguments
    }

    /// The path the converter promised to write, when the caller chose it.
    pub fn declared_output(&self) -> Option<&Path> {
        match self {
            Invocation::FlattenPdf { output } => Some(output),
            Invocation::ConvertAllToZip { zip_path, .. } => Some(zip_path),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// One input-to-output attempt, tied to exactly one converter process.
#[derive(Debug, Clone)]
pub struct ConversionJob {
    pub id: Uuid,
    pub input: PathBuf,
    pub invocation: Invocation,
    pub state: State,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl ConversionJob {
    pub fn new(input: PathBuf, invocation: Invocation) -> Self {
        ConversionJob {
            id: Uuid::new_v4(),
            input,
            invocation,
            state: State::Pending,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ManifestEntry {
    pub original_name: String,
    pub artifact_name: String,
    pub download_link: String,
}

/// A single-mode result: the flattened PDF waiting to be streamed back.
#[derive(Debug)]
pub struct ConvertedPdf {
    pub original_name: String,
    pub artifact: ArtifactName,
    pub path: PathBuf,
}

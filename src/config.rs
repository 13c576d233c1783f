use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use crate::error::ConfigError;
use crate::extract::IdentifierPattern;

/// One letter, three digits, two letters, one digit (e.g. `A060JR7`).
pub const DEFAULT_IDENTIFIER_PATTERN: &str = r"\b[A-Z][0-9]{3}[A-Z]{2}[0-9]\b";
pub const DEFAULT_OCR_DPI: u32 = 300;

/// How pages are ordered inside each driver's output document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingMode {
    /// Route sheets: ascending delivery sequence number.
    #[default]
    Route,
    /// Picking dockets: reverse of the order pages arrived in.
    Picking,
}

impl fmt::Display for ProcessingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessingMode::Route => f.write_str("route"),
            ProcessingMode::Picking => f.write_str("picking"),
        }
    }
}

impl std::str::FromStr for ProcessingMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "route" => Ok(ProcessingMode::Route),
            "picking" => Ok(ProcessingMode::Picking),
            other => Err(ConfigError::Mode(other.to_string())),
        }
    }
}

#[derive(Deserialize, Default)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default)]
    pub sorter: SorterSection,
    #[serde(default)]
    pub ocr: OcrSection,
}

fn default_db_path() -> String {
    "dispatch/dispatch.db".to_string()
}

/// Raw `[sorter]` table as written in the config file.
#[derive(Debug, Clone, Deserialize)]
pub struct SorterSection {
    #[serde(default = "default_pattern")]
    pub identifier_pattern: String,
    #[serde(default = "default_dpi")]
    pub ocr_dpi: u32,
    #[serde(default)]
    pub mode: ProcessingMode,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Write pages without a resolvable order to `Unmatched_Pages.pdf`.
    #[serde(default)]
    pub keep_unmatched: bool,
}

fn default_pattern() -> String {
    DEFAULT_IDENTIFIER_PATTERN.to_string()
}

fn default_dpi() -> u32 {
    DEFAULT_OCR_DPI
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

fn default_workers() -> usize {
    1
}

impl Default for SorterSection {
    fn default() -> Self {
        Self {
            identifier_pattern: default_pattern(),
            ocr_dpi: default_dpi(),
            mode: ProcessingMode::default(),
            output_dir: default_output_dir(),
            workers: default_workers(),
            keep_unmatched: false,
        }
    }
}

/// `[ocr]` table: external binaries used for the OCR fallback.
#[derive(Debug, Clone, Deserialize)]
pub struct OcrSection {
    #[serde(default = "default_pdftoppm")]
    pub pdftoppm: String,
    #[serde(default = "default_tesseract")]
    pub tesseract: String,
    #[serde(default = "default_language")]
    pub language: String,
}

fn default_pdftoppm() -> String {
    "pdftoppm".to_string()
}

fn default_tesseract() -> String {
    "tesseract".to_string()
}

fn default_language() -> String {
    "eng".to_string()
}

impl Default for OcrSection {
    fn default() -> Self {
        Self {
            pdftoppm: default_pdftoppm(),
            tesseract: default_tesseract(),
            language: default_language(),
        }
    }
}

/// Validated sorter settings handed to the pipeline.
#[derive(Debug, Clone)]
pub struct SorterConfig {
    pub pattern: IdentifierPattern,
    pub ocr_dpi: u32,
    pub mode: ProcessingMode,
    pub output_dir: PathBuf,
    pub workers: usize,
    pub keep_unmatched: bool,
}

impl SorterSection {
    pub fn validate(&self) -> Result<SorterConfig, ConfigError> {
        let pattern = IdentifierPattern::new(&self.identifier_pattern)?;
        if !(72..=1200).contains(&self.ocr_dpi) {
            return Err(ConfigError::Dpi(self.ocr_dpi));
        }
        if self.workers == 0 {
            return Err(ConfigError::Workers);
        }
        Ok(SorterConfig {
            pattern,
            ocr_dpi: self.ocr_dpi,
            mode: self.mode,
            output_dir: self.output_dir.clone(),
            workers: self.workers,
            keep_unmatched: self.keep_unmatched,
        })
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Box<dyn std::error::Error>> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Load `path` if it exists, otherwise fall back to built-in defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, Box<dyn std::error::Error>> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            Ok(Self {
                db_path: default_db_path(),
                ..Self::default()
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_gets_defaults() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.db_path, "dispatch/dispatch.db");
        assert_eq!(cfg.sorter.ocr_dpi, 300);
        assert_eq!(cfg.sorter.mode, ProcessingMode::Route);
        assert_eq!(cfg.ocr.tesseract, "tesseract");
        assert!(cfg.sorter.validate().is_ok());
    }

    #[test]
    fn test_sorter_table_overrides() {
        let cfg: Config = toml::from_str(
            r#"
            db_path = "x.db"
            [sorter]
            mode = "picking"
            ocr_dpi = 200
            workers = 4
            keep_unmatched = true
            identifier_pattern = "ORD-[0-9]+"
            "#,
        )
        .unwrap();
        let sorter = cfg.sorter.validate().unwrap();
        assert_eq!(sorter.mode, ProcessingMode::Picking);
        assert_eq!(sorter.ocr_dpi, 200);
        assert_eq!(sorter.workers, 4);
        assert!(sorter.keep_unmatched);
        assert_eq!(sorter.pattern.as_str(), "ORD-[0-9]+");
    }

    #[test]
    fn test_validation_is_eager() {
        let bad_pattern = SorterSection {
            identifier_pattern: "([A-Z".into(),
            ..SorterSection::default()
        };
        assert!(matches!(bad_pattern.validate(), Err(ConfigError::Pattern { .. })));

        let bad_dpi = SorterSection {
            ocr_dpi: 10,
            ..SorterSection::default()
        };
        assert!(matches!(bad_dpi.validate(), Err(ConfigError::Dpi(10))));

        let no_workers = SorterSection {
            workers: 0,
            ..SorterSection::default()
        };
        assert!(matches!(no_workers.validate(), Err(ConfigError::Workers)));
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("Picking".parse::<ProcessingMode>().unwrap(), ProcessingMode::Picking);
        assert!("sideways".parse::<ProcessingMode>().is_err());
    }
}

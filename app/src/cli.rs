//! ABOUTME: Command-line interface for the motrack binary
//! ABOUTME: Chooses the frame source and overrides recording settings

use clap::{Args, Parser};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "motrack", version, about = "Real-time motion object tracker")]
pub struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub source: SourceArgs,

    /// Enable recording regardless of configuration
    #[arg(long)]
    pub record: bool,

    /// Directory that receives recording sessions
    #[arg(long, value_name = "DIR")]
    pub save_path: Option<PathBuf>,

    /// Override the capture frame rate
    #[arg(long)]
    pub fps: Option<u32>,
}

#[derive(Debug, Args)]
#[group(required = true, multiple = false)]
pub struct SourceArgs {
    /// Directory of image files, analyzed in file-name order
    #[arg(long, value_name = "DIR")]
    pub input: Option<PathBuf>,

    /// Generate this many frames of a synthetic moving object
    #[arg(long, value_name = "FRAMES")]
    pub synthetic: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_directory_source() {
        let cli = Cli::try_parse_from(["motrack", "--input", "/frames", "--record"]).unwrap();
        assert_eq!(cli.source.input, Some(PathBuf::from("/frames")));
        assert!(cli.record);
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_parse_synthetic_with_overrides() {
        let cli = Cli::try_parse_from([
            "motrack",
            "--synthetic",
            "120",
            "--fps",
            "15",
            "--save-path",
            "/tmp/rec",
        ])
        .unwrap();
        assert_eq!(cli.source.synthetic, Some(120));
        assert_eq!(cli.fps, Some(15));
        assert_eq!(cli.save_path, Some(PathBuf::from("/tmp/rec")));
    }

    #[test]
    fn test_exactly_one_source_required() {
        assert!(Cli::try_parse_from(["motrack"]).is_err());
        assert!(
            Cli::try_parse_from(["motrack", "--input", "/a", "--synthetic", "10"]).is_err()
        );
    }
}

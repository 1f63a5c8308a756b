//! Command-line argument definitions

use std::path::PathBuf;

use clap::Parser;

/// Batch remaster pipeline for high-framerate gameplay recordings
#[derive(Parser, Debug)]
#[command(
    name = "smoothx",
    version,
    about = "Interpolates high-framerate gameplay recordings into editor-friendly CFR masters"
)]
pub struct Cli {
    /// Input recording; repeat for multiple inputs
    #[arg(short = 'i', long = "input", value_name = "PATH", required = true)]
    pub inputs: Vec<PathBuf>,

    /// Output master file; must end in .mkv and must not exist
    #[arg(short = 'o', long = "output", value_name = "PATH")]
    pub output: PathBuf,

    /// Single working directory for temporaries (default: next to each input)
    #[arg(short = 't', long = "tempdir", value_name = "PATH")]
    pub tempdir: Option<PathBuf>,

    /// Route the second audio stream into a sibling .wav
    #[arg(short = 's', long = "splitaudio")]
    pub splitaudio: bool,

    /// Force the 60 fps target even for slow sources
    #[arg(short = 'u', long = "upgrade")]
    pub upgrade: bool,

    /// Raise the intermediate maximum frame rate
    #[arg(long = "maxfps", value_name = "N")]
    pub maxfps: Option<u32>,

    /// Override the output frame rate (clamped to the maximum)
    #[arg(long = "targetfps", value_name = "N")]
    pub targetfps: Option<u32>,

    /// Retain all temporaries and log their paths for post-mortem work
    #[arg(short = 'D', long = "debug")]
    pub debug: bool,

    /// Trace registry lock traffic (very noisy)
    #[arg(long = "lock-debug")]
    pub lock_debug: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_invocation() {
        let cli =
            Cli::try_parse_from(["smoothx", "-i", "in.mkv", "-o", "out.mkv"]).unwrap();
        assert_eq!(cli.inputs, vec![PathBuf::from("in.mkv")]);
        assert_eq!(cli.output, PathBuf::from("out.mkv"));
        assert!(!cli.splitaudio);
        assert!(!cli.upgrade);
        assert!(cli.maxfps.is_none());
    }

    #[test]
    fn test_repeated_inputs_keep_order() {
        let cli = Cli::try_parse_from([
            "smoothx", "-i", "a.mkv", "-i", "b.mkv", "-i", "c.mkv", "-o", "out.mkv",
        ])
        .unwrap();
        assert_eq!(
            cli.inputs,
            vec![
                PathBuf::from("a.mkv"),
                PathBuf::from("b.mkv"),
                PathBuf::from("c.mkv")
            ]
        );
    }

    #[test]
    fn test_all_flags() {
        let cli = Cli::try_parse_from([
            "smoothx",
            "-i",
            "in.mkv",
            "-o",
            "out.mkv",
            "--tempdir",
            "/scratch",
            "-s",
            "-u",
            "--maxfps",
            "240",
            "--targetfps",
            "48",
            "-D",
            "--lock-debug",
        ])
        .unwrap();
        assert_eq!(cli.tempdir, Some(PathBuf::from("/scratch")));
        assert!(cli.splitaudio);
        assert!(cli.upgrade);
        assert_eq!(cli.maxfps, Some(240));
        assert_eq!(cli.targetfps, Some(48));
        assert!(cli.debug);
        assert!(cli.lock_debug);
    }

    #[test]
    fn test_input_is_required() {
        assert!(Cli::try_parse_from(["smoothx", "-o", "out.mkv"]).is_err());
    }
}

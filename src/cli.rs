use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "sfx")]
#[command(version)]
#[command(about = "Build and run self-extracting script archives", long_about = None)]
#[command(after_help = "Examples:\n  \
  sfx app.sfx ./app run.sh       pack ./app into app.sfx, entry script run.sh\n  \
  ./app.sfx --port 8080          unpack to a temp dir and run: bash run.sh --port 8080")]
pub struct Cli {
    /// Print each archived or extracted entry
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    /// <TARGET> <DIR> <SCRIPT> when building; arguments for the script when
    /// running an archive
    #[arg(value_name = "ARGS", trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

/// Positional arguments of build mode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildArgs {
    pub target: PathBuf,
    pub dir: PathBuf,
    pub script: String,
}

impl Cli {
    /// Interpret the positional arguments for build mode.
    ///
    /// Returns `None` when any of the three is missing or empty. Extra
    /// arguments are ignored.
    pub fn build_args(&self) -> Option<BuildArgs> {
        match self.args.as_slice() {
            [target, dir, script, ..]
                if !target.is_empty() && !dir.is_empty() && !script.is_empty() =>
            {
                Some(BuildArgs {
                    target: PathBuf::from(target),
                    dir: PathBuf::from(dir),
                    script: script.clone(),
                })
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("sfx").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_build_args() {
        let cli = parse(&["-v", "out.sfx", "app", "run.sh"]);
        assert!(cli.verbose);
        assert_eq!(
            cli.build_args(),
            Some(BuildArgs {
                target: PathBuf::from("out.sfx"),
                dir: PathBuf::from("app"),
                script: "run.sh".to_string(),
            })
        );
    }

    #[test]
    fn test_missing_build_args() {
        assert_eq!(parse(&[]).build_args(), None);
        assert_eq!(parse(&["out.sfx", "app"]).build_args(), None);
        assert_eq!(parse(&["out.sfx", "", "run.sh"]).build_args(), None);
    }

    #[test]
    fn test_script_args_pass_through() {
        let cli = parse(&["--verbose", "first", "--port", "8080", "-v", "-x"]);
        assert!(cli.verbose);
        assert_eq!(cli.args, vec!["first", "--port", "8080", "-v", "-x"]);
    }

    #[test]
    fn test_leading_hyphen_arg() {
        let cli = parse(&["-x", "y"]);
        assert!(!cli.verbose);
        assert_eq!(cli.args, vec!["-x", "y"]);
    }
}

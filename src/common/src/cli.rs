use clap::Parser;

/// Logging arguments shared by every cycler binary
#[derive(Parser, Debug, Clone, Default)]
pub struct CommonArgs {
    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(short, long, help = "Enable quiet mode (warnings and errors only)")]
    pub quiet: bool,
}

impl CommonArgs {
    /// Default filter directive, `RUST_LOG` takes precedence when set
    pub fn log_level(&self) -> &'static str {
        if self.quiet {
            "warn"
        } else if self.verbose {
            "debug"
        } else {
            "info"
        }
    }
}

/// Utility functions for CLI operations
pub mod utils {
    use super::*;
    use tracing_subscriber::EnvFilter;

    /// Initialize logging based on CLI arguments.
    ///
    /// Diagnostics go to stderr, stdout is reserved for the text report.
    pub fn init_logging(args: &CommonArgs) {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(args.log_level()));

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    /// Standard version information
    pub fn version_info() -> String {
        format!(
            "{} {} ({})",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            env!("CARGO_PKG_RUST_VERSION")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_selection() {
        assert_eq!(CommonArgs::default().log_level(), "info");

        let verbose = CommonArgs {
            verbose: true,
            quiet: false,
        };
        assert_eq!(verbose.log_level(), "debug");

        // Quiet wins when both are given
        let both = CommonArgs {
            verbose: true,
            quiet: true,
        };
        assert_eq!(both.log_level(), "warn");
    }

    #[test]
    fn test_version_info() {
        let version = utils::version_info();
        assert!(version.contains(env!("CARGO_PKG_VERSION")));
    }
}

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::OnceLock;

use anyhow::Result;
use clap::{Parser, Subcommand};
use superimage::preflight::{check_required_tools, require_root, EXTRACT_TOOLS, REPACK_TOOLS};
use superimage::{
    AbortSignal, Config, ExtractRequest, Extractor, RepackRequest, Repacker, SystemTools,
    TracingReporter,
};
use tracing_subscriber::EnvFilter;

/// Extract and repack the root/var/home filesystems of SteamOS-style
/// superimages
#[derive(Parser, Debug)]
#[command(author, version, name = "superimage", max_term_width = 98)]
struct Cli {
    /// Configuration file (default: ~/.config/superimage/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log every external command
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Extract root, /var and /home from an image into a directory
    Extract {
        /// Superimage to read
        #[arg(long)]
        image: PathBuf,

        /// Directory receiving the system tree
        #[arg(long)]
        out: PathBuf,

        /// Do not extract the var partition
        #[arg(long)]
        no_var: bool,

        /// Do not extract the home partition
        #[arg(long)]
        no_home: bool,
    },

    /// Build a new image from a base image and a system tree
    Repack {
        /// Base superimage (partition table and boot partitions are kept)
        #[arg(long)]
        old: PathBuf,

        /// System tree; its var/ and home/ feed the var and home partitions
        #[arg(long)]
        root: PathBuf,

        /// Output image
        #[arg(long)]
        out: PathBuf,

        /// Keep the base image's var partition
        #[arg(long)]
        no_var: bool,

        /// Keep the base image's home partition
        #[arg(long)]
        no_home: bool,
    },
}

static ABORT: OnceLock<AbortSignal> = OnceLock::new();

extern "C" fn handle_interrupt(_sig: libc::c_int) {
    if let Some(abort) = ABORT.get() {
        abort.trigger();
    }
}

fn setup_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGINT, handle_interrupt as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle_interrupt as libc::sighandler_t);
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose {
        "superimage=debug"
    } else {
        "superimage=info"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let abort = ABORT.get_or_init(AbortSignal::new).clone();
    setup_signal_handlers();

    match run(cli, abort) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            // Library errors already render their whole chain.
            eprintln!("error: {err}");
            let code = err
                .downcast_ref::<superimage::Error>()
                .map(superimage::Error::exit_code)
                .unwrap_or(superimage::error::EXIT_FAILED);
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}

fn run(cli: Cli, abort: AbortSignal) -> Result<()> {
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Extract {
            image,
            out,
            no_var,
            no_home,
        } => {
            check_required_tools(EXTRACT_TOOLS)?;
            require_root()?;

            let mut options = config.extract;
            options.include_var &= !no_var;
            options.include_home &= !no_home;

            let report = Extractor::new(&SystemTools, &TracingReporter)
                .options(options)
                .work_parent(config.work_dir)
                .abort_signal(abort)
                .run(&ExtractRequest {
                    image,
                    output_dir: out,
                })?;
            for (role, shape) in &report.extracted {
                tracing::debug!("{role}: {shape:?}");
            }
        }
        Command::Repack {
            old,
            root,
            out,
            no_var,
            no_home,
        } => {
            check_required_tools(REPACK_TOOLS)?;
            require_root()?;

            let mut options = config.repack;
            options.include_var &= !no_var;
            options.include_home &= !no_home;

            let report = Repacker::new(&SystemTools, &TracingReporter)
                .options(options)
                .squashfs(config.squashfs)
                .work_parent(config.work_dir)
                .abort_signal(abort)
                .run(&RepackRequest {
                    base_image: old,
                    source_tree: root,
                    output_image: out,
                })?;
            for (role, shape) in &report.replaced {
                tracing::debug!("{role}: {shape:?}");
            }
        }
    }
    Ok(())
}

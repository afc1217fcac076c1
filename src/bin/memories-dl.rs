//! memories-dl CLI - downloads a memories export's media in bulk.

#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

#[cfg(feature = "cli")]
mod app {
    use std::env;
    use std::num::NonZeroUsize;
    use std::path::PathBuf;

    use memories_dl::cli::CliOptions;
    use memories_dl::config::{LIMIT_ENV, SELECT_ENV};

    const DEFAULT_FETCH_JOBS: usize = 4;
    const DEFAULT_CONVERT_JOBS: usize = 2;

    fn parse_args() -> CliOptions {
        let args: Vec<_> = env::args().skip(1).collect();

        let mut options = CliOptions::default();

        let mut i = 0;
        while i < args.len() {
            match args[i].as_str() {
                "-d" | "--dir" => {
                    i += 1;
                    if i < args.len() {
                        options.export_dir = Some(PathBuf::from(&args[i]));
                    }
                }
                "--manifest" => {
                    i += 1;
                    if i < args.len() {
                        options.manifest = Some(PathBuf::from(&args[i]));
                    }
                }
                "-o" | "--output" => {
                    i += 1;
                    if i < args.len() {
                        options.output = Some(PathBuf::from(&args[i]));
                    }
                }
                "-s" | "--select" => {
                    i += 1;
                    if i < args.len() {
                        options.select = Some(args[i].clone());
                    }
                }
                "--limit" => {
                    i += 1;
                    if i < args.len() {
                        options.limit = args[i].parse::<NonZeroUsize>().ok();
                    }
                }
                "-j" | "--jobs" => {
                    i += 1;
                    if i < args.len() {
                        options.jobs = args[i].parse().ok();
                    }
                }
                "--convert-jobs" => {
                    i += 1;
                    if i < args.len() {
                        options.convert_jobs = args[i].parse().ok();
                    }
                }
                "--ffmpeg" => {
                    i += 1;
                    if i < args.len() {
                        options.ffmpeg = Some(PathBuf::from(&args[i]));
                    }
                }
                "--ffprobe" => {
                    i += 1;
                    if i < args.len() {
                        options.ffprobe = Some(PathBuf::from(&args[i]));
                    }
                }
                "-r" | "--retry-failed" => {
                    options.retry_failed = true;
                }
                "-f" | "--force" => {
                    options.force = true;
                }
                "-h" | "--help" => {
                    print_usage();
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown option: {}", args[i]);
                    print_usage();
                    std::process::exit(1);
                }
            }
            i += 1;
        }

        options
    }

    fn print_usage() {
        eprintln!("Usage: memories-dl [OPTIONS]");
        eprintln!();
        eprintln!("Options:");
        eprintln!("  -d, --dir <PATH>       Root of the unpacked export (default: current dir)");
        eprintln!("      --manifest <PATH>  Manifest HTML (default: <dir>/html/memories_history.html)");
        eprintln!("  -o, --output <PATH>    Output root (default: <dir>/memories)");
        eprintln!("  -s, --select <EXPR>    Items to download, e.g. \"1,5-8\" (default: all)");
        eprintln!("      --limit <N>        Stop after the first N selected items");
        eprintln!("  -r, --retry-failed     Retry only the items that failed last run");
        eprintln!("  -f, --force            Re-download items whose output already exists");
        eprintln!("  -j, --jobs <N>         Concurrent downloads (default: {DEFAULT_FETCH_JOBS})");
        eprintln!("      --convert-jobs <N> Concurrent ffmpeg processes (default: {DEFAULT_CONVERT_JOBS})");
        eprintln!("      --ffmpeg <PATH>    ffmpeg executable (default: ffmpeg on PATH)");
        eprintln!("      --ffprobe <PATH>   ffprobe executable (default: ffprobe on PATH)");
        eprintln!("  -h, --help             Show this help");
        eprintln!();
        eprintln!("Environment:");
        eprintln!("  {SELECT_ENV}    Selection expression (--select wins)");
        eprintln!("  {LIMIT_ENV}     Item-count limit (same as --limit)");
        eprintln!("  RUST_LOG               Log filter (e.g. memories_dl=debug)");
    }

    pub async fn main() -> memories_dl::Result<()> {
        env_logger::init();
        memories_dl::cli::run(parse_args()).await
    }
}

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() {
    if let Err(e) = app::main().await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

#[cfg(not(feature = "cli"))]
fn main() {
    eprintln!("memories-dl was built without the `cli` feature");
    std::process::exit(1);
}

use std::path::PathBuf;
use std::process;

use clap::{Parser, ValueEnum};
use log::info;
use nafld_survival::{load_cohort, run_analysis, AnalysisConfig, LoadOptions, Ties};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TiesArg {
    Efron,
    Breslow,
}

impl From<TiesArg> for Ties {
    fn from(arg: TiesArg) -> Self {
        match arg {
            TiesArg::Efron => Ties::Efron,
            TiesArg::Breslow => Ties::Breslow,
        }
    }
}

#[derive(Parser, Debug)]
#[clap(
    name = "nafld-report",
    version,
    about = "Survival analysis report for the NAFLD cohort"
)]
struct Args {
    /// Delimited file with columns id, status, futime, age, male, weight, height, bmi.
    input: PathBuf,

    /// Field delimiter (a single ASCII character).
    #[clap(long, default_value = ",")]
    delimiter: char,

    /// Handling of tied event times in the Cox model.
    #[clap(long, value_enum, default_value = "efron")]
    ties: TiesArg,

    /// Confidence level for Kaplan-Meier limits.
    #[clap(long, default_value_t = 0.95)]
    conf_level: f64,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    if !args.delimiter.is_ascii() {
        eprintln!("Error: delimiter must be a single ASCII character");
        process::exit(2);
    }
    if !(args.conf_level > 0.0 && args.conf_level < 1.0) {
        eprintln!("Error: --conf-level must lie strictly between 0 and 1");
        process::exit(2);
    }

    let options = LoadOptions::default().with_delimiter(args.delimiter as u8);
    let (cohort, cleaning) = match load_cohort(&args.input, &options) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Error loading '{}': {}", args.input.display(), e);
            process::exit(1);
        }
    };
    info!(
        "{} of {} rows kept ({} removed)",
        cleaning.rows_kept,
        cleaning.rows_read,
        cleaning.rows_removed()
    );

    let config = AnalysisConfig::default()
        .with_ties(args.ties.into())
        .with_conf_level(args.conf_level);

    match run_analysis(&cohort, &config) {
        Ok(report) => {
            println!(
                "cleaning: {} rows read, {} kept, {} with missing values, {} malformed",
                cleaning.rows_read, cleaning.rows_kept, cleaning.rows_missing, cleaning.rows_malformed
            );
            report.print();
        }
        Err(e) => {
            eprintln!("Fatal error during analysis: {}", e);
            process::exit(1);
        }
    }
}

#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use std::process;

use sundial::{AlgorithmSettings, Data, IndividualParameters, Progression};

#[derive(Parser)]
#[command(
    name = "sundial",
    about = "Calibration and personalization of longitudinal disease-progression models",
    long_about = "Fits population progression models on longitudinal biomarker data, \
                 estimates subject-specific parameters and simulates synthetic cohorts."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

/// Algorithm selection shared by every subcommand.
#[derive(Args)]
struct AlgorithmArgs {
    /// TOML file with the algorithm settings (name, device, seed, parameters)
    #[arg(long, value_name = "PATH", conflicts_with = "algorithm")]
    settings: Option<PathBuf>,

    /// Algorithm name, run with its default parameters
    #[arg(long)]
    algorithm: Option<String>,

    /// Device to run the algorithm on (cpu, cuda, cuda:N)
    #[arg(long)]
    device: Option<String>,

    /// Seed of the random number generator
    #[arg(long)]
    seed: Option<u64>,
}

impl AlgorithmArgs {
    fn resolve(&self, default_algorithm: &str) -> sundial::Result<AlgorithmSettings> {
        let mut settings = match &self.settings {
            Some(path) => AlgorithmSettings::load(path)?,
            None => AlgorithmSettings::new(self.algorithm.as_deref().unwrap_or(default_algorithm))?,
        };
        if let Some(device) = &self.device {
            settings = settings.with_device(device);
        }
        if let Some(seed) = self.seed {
            settings = settings.with_seed(seed);
        }
        Ok(settings)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Calibrate a model on longitudinal data
    #[command(about = "Calibrate a progression model (outputs: model.toml)")]
    Fit {
        /// CSV file with ID,TIME,<features...> columns
        #[arg(value_name = "DATA_PATH")]
        data: PathBuf,

        /// Model to calibrate
        #[arg(long, default_value = "lme")]
        model: String,

        #[command(flatten)]
        algorithm: AlgorithmArgs,

        #[arg(long, default_value = "model.toml")]
        output: PathBuf,
    },

    /// Estimate individual parameters with a saved model
    #[command(about = "Personalize a saved model (outputs: individual_parameters.csv)")]
    Personalize {
        #[arg(value_name = "DATA_PATH")]
        data: PathBuf,

        /// Saved model document
        #[arg(long, default_value = "model.toml")]
        model: PathBuf,

        #[command(flatten)]
        algorithm: AlgorithmArgs,

        #[arg(long, default_value = "individual_parameters.csv")]
        output: PathBuf,
    },

    /// Simulate a synthetic cohort resembling real subjects
    #[command(about = "Simulate subjects from a saved model (outputs: simulated.csv)")]
    Simulate {
        #[arg(value_name = "DATA_PATH")]
        data: PathBuf,

        #[arg(long, default_value = "model.toml")]
        model: PathBuf,

        /// Individual parameters of the real subjects
        #[arg(long, value_name = "PATH", default_value = "individual_parameters.csv")]
        individual_parameters: PathBuf,

        #[command(flatten)]
        algorithm: AlgorithmArgs,

        #[arg(long, default_value = "simulated.csv")]
        output: PathBuf,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let result = match cli.command {
        Some(Commands::Fit {
            data,
            model,
            algorithm,
            output,
        }) => run_fit(data, model, algorithm, output),
        Some(Commands::Personalize {
            data,
            model,
            algorithm,
            output,
        }) => run_personalize(data, model, algorithm, output),
        Some(Commands::Simulate {
            data,
            model,
            individual_parameters,
            algorithm,
            output,
        }) => run_simulate(data, model, individual_parameters, algorithm, output),
        None => {
            if Cli::command().print_help().is_err() {
                process::exit(2);
            }
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run_fit(
    data_path: PathBuf,
    model_name: String,
    algorithm: AlgorithmArgs,
    output: PathBuf,
) -> sundial::Result<()> {
    let settings = algorithm.resolve("lme_fit")?;
    let data = Data::from_csv_path(&data_path)?;
    let mut progression = Progression::new(&model_name)?;
    let fit = progression.fit(&data, &settings)?;
    progression.save(&output)?;
    println!(
        "Calibrated '{model_name}' on {} subjects (noise std {:.4}), saved to {}",
        data.n_individuals(),
        fit.noise_std,
        output.display()
    );
    Ok(())
}

fn run_personalize(
    data_path: PathBuf,
    model_path: PathBuf,
    algorithm: AlgorithmArgs,
    output: PathBuf,
) -> sundial::Result<()> {
    let mut progression = Progression::load(&model_path)?;
    let default_algorithm = match progression.model().name() {
        "constant" => "constant_prediction",
        _ => "lme_personalize",
    };
    let settings = algorithm.resolve(default_algorithm)?;
    let data = Data::from_csv_path(&data_path)?;
    let personalized = progression.personalize_with_noise(&data, &settings)?;
    personalized.individual_parameters.save_csv(&output)?;
    println!(
        "Personalized {} subjects (residual std {:.4}), saved to {}",
        personalized.individual_parameters.len(),
        personalized.noise_std,
        output.display()
    );
    Ok(())
}

fn run_simulate(
    data_path: PathBuf,
    model_path: PathBuf,
    individual_parameters_path: PathBuf,
    algorithm: AlgorithmArgs,
    output: PathBuf,
) -> sundial::Result<()> {
    let progression = Progression::load(&model_path)?;
    let settings = algorithm.resolve("simulation")?;
    let data = Data::from_csv_path(&data_path)?;
    let individual_parameters = IndividualParameters::load_csv(&individual_parameters_path)?;
    let simulated = progression.simulate(&individual_parameters, &data, &settings)?;
    simulated.data.to_csv_path(&output)?;
    println!(
        "Simulated {} subjects, saved to {}",
        simulated.data.n_individuals(),
        output.display()
    );
    Ok(())
}

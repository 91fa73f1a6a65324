use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use image::RgbImage;
use rollcall_core::{CosineMatcher, DecisionPolicy, Outcome};
use rollcall_store::{AttendanceFilter, ProfileUpdate};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod alerts;
mod config;
mod engine;
mod report;
mod service;

use config::Config;
use report::ReportFormat;
use service::{Profile, Service};

#[derive(Parser)]
#[command(name = "rollcall", version, about = "Face-recognition faculty attendance")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a faculty member from one or more face images
    Register {
        #[arg(long)]
        id: String,
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "")]
        department: String,
        #[arg(long, default_value = "")]
        email: String,
        #[arg(long, default_value = "")]
        phone: String,
        /// Re-enroll an existing id, replacing its descriptor
        #[arg(long)]
        replace: bool,
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Change profile fields; images, if given, replace the descriptor
    Update {
        #[arg(long)]
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        department: Option<String>,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        phone: Option<String>,
        images: Vec<PathBuf>,
    },
    /// Mark attendance from a captured image
    Mark {
        image: PathBuf,
        /// Faculty id the person claims to be
        #[arg(long)]
        claim: Option<String>,
        #[arg(long)]
        location: Option<String>,
    },
    /// List registered faculty
    List,
    /// Remove a faculty member and their records
    Remove { id: String },
    /// Present/absent counts for a day (default: today), or per day over a range
    Summary {
        #[arg(long, conflicts_with_all = ["from", "to"])]
        date: Option<NaiveDate>,
        /// First day of a range; prints one entry per day
        #[arg(long)]
        from: Option<NaiveDate>,
        /// Last day of the range (default: today)
        #[arg(long, requires = "from")]
        to: Option<NaiveDate>,
    },
    /// Absentee alerts
    Alerts {
        #[command(subcommand)]
        action: AlertsCommand,
    },
    /// Export attendance records
    Report {
        #[arg(long)]
        from: Option<NaiveDate>,
        #[arg(long)]
        to: Option<NaiveDate>,
        #[arg(long)]
        faculty: Option<String>,
        #[arg(long)]
        department: Option<String>,
        #[arg(long)]
        status: Option<String>,
        #[arg(long, value_enum, default_value_t = ReportFormat::Csv)]
        format: ReportFormat,
        /// Write to a file instead of stdout
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum AlertsCommand {
    /// Message every absentee for a day (default: today)
    Send {
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Show recorded alerts
    List {
        #[arg(long)]
        date: Option<NaiveDate>,
    },
}

impl Commands {
    fn needs_models(&self) -> bool {
        match self {
            Commands::Register { .. } | Commands::Mark { .. } => true,
            Commands::Update { images, .. } => !images.is_empty(),
            _ => false,
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    tracing::debug!(?config, "configuration loaded");

    let engine = if cli.command.needs_models() {
        let extractor = engine::load_models(
            &config.detector_model_path(),
            &config.embedder_model_path(),
            config.embedder_spec(),
        )?;
        Some(engine::spawn_engine(extractor)?)
    } else {
        None
    };

    let service = Service::open(
        &config.db_path,
        engine,
        CosineMatcher {
            threshold: config.similarity_threshold,
        },
        DecisionPolicy {
            tie_margin: config.tie_margin,
        },
    )
    .await
    .with_context(|| format!("opening database {}", config.db_path.display()))?;

    let today = Local::now().date_naive();

    match cli.command {
        Commands::Register {
            id,
            name,
            department,
            email,
            phone,
            replace,
            images,
        } => {
            let images = load_images(&images)?;
            let profile = Profile {
                faculty_id: id,
                name,
                department,
                email,
                phone,
            };
            let report = service.register(profile, images, replace).await?;
            print_json(&report)?;
        }
        Commands::Update {
            id,
            name,
            department,
            email,
            phone,
            images,
        } => {
            let images = load_images(&images)?;
            let update = ProfileUpdate {
                name,
                department,
                email,
                phone,
            };
            let row = service.update(&id, update, images).await?;
            print_json(&row)?;
        }
        Commands::Mark {
            image,
            claim,
            location,
        } => {
            let image = load_image(&image)?;
            let location = location.unwrap_or_else(|| config.default_location.clone());
            let report = service.mark(image, claim, location).await?;
            print_json(&report)?;
            if !matches!(report.outcome, Outcome::Accepted { .. }) {
                return Ok(ExitCode::from(2));
            }
        }
        Commands::List => {
            print_json(&service.list().await?)?;
        }
        Commands::Remove { id } => {
            service.remove(&id).await?;
            print_json(&serde_json::json!({ "removed": id }))?;
        }
        Commands::Summary { date, from, to } => match from {
            Some(from) => print_json(&service.summary_range(from, to.unwrap_or(today)).await?)?,
            None => print_json(&service.summary(date.unwrap_or(today)).await?)?,
        },
        Commands::Alerts { action } => match action {
            AlertsCommand::Send { date } => {
                let summary = service
                    .send_alerts(Arc::new(alerts::LogSender), date.unwrap_or(today))
                    .await?;
                print_json(&summary)?;
            }
            AlertsCommand::List { date } => {
                print_json(&service.alerts(date).await?)?;
            }
        },
        Commands::Report {
            from,
            to,
            faculty,
            department,
            status,
            format,
            output,
        } => {
            let filter = AttendanceFilter {
                from,
                to,
                faculty_id: faculty,
                department,
                status,
            };
            let records = service.report(filter).await?;
            match output {
                Some(path) => {
                    let file = std::fs::File::create(&path)
                        .with_context(|| format!("creating {}", path.display()))?;
                    report::write_attendance(std::io::BufWriter::new(file), &records, format)?;
                    tracing::info!(path = %path.display(), records = records.len(), "report written");
                }
                None => report::write_attendance(std::io::stdout().lock(), &records, format)?,
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn load_image(path: &Path) -> Result<RgbImage> {
    rollcall_core::input::load(path).with_context(|| format!("loading image {}", path.display()))
}

fn load_images(paths: &[PathBuf]) -> Result<Vec<RgbImage>> {
    paths.iter().map(|p| load_image(p)).collect()
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    report::write_json(std::io::stdout().lock(), value)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_register() {
        let cli = Cli::try_parse_from([
            "rollcall", "register", "--id", "C001", "--name", "Ada", "--replace", "a.jpg", "b.jpg",
        ])
        .unwrap();
        match cli.command {
            Commands::Register { id, replace, images, department, .. } => {
                assert_eq!(id, "C001");
                assert!(replace);
                assert_eq!(images.len(), 2);
                assert_eq!(department, "");
            }
            _ => panic!("expected register"),
        }
    }

    #[test]
    fn test_register_requires_images() {
        assert!(Cli::try_parse_from(["rollcall", "register", "--id", "C001", "--name", "Ada"]).is_err());
    }

    #[test]
    fn test_parse_report_and_dates() {
        let cli = Cli::try_parse_from([
            "rollcall", "report", "--from", "2024-01-01", "--to", "2024-01-31", "--format", "json",
        ])
        .unwrap();
        match cli.command {
            Commands::Report { from, format, .. } => {
                assert_eq!(from, NaiveDate::from_ymd_opt(2024, 1, 1));
                assert_eq!(format, ReportFormat::Json);
            }
            _ => panic!("expected report"),
        }
        assert!(Cli::try_parse_from(["rollcall", "summary", "--date", "01/02/2024"]).is_err());
    }

    #[test]
    fn test_parse_summary_range() {
        let cli = Cli::try_parse_from(["rollcall", "summary", "--from", "2024-01-01", "--to", "2024-01-07"]).unwrap();
        match cli.command {
            Commands::Summary { date, from, to } => {
                assert!(date.is_none());
                assert_eq!(from, NaiveDate::from_ymd_opt(2024, 1, 1));
                assert_eq!(to, NaiveDate::from_ymd_opt(2024, 1, 7));
            }
            _ => panic!("expected summary"),
        }
        assert!(Cli::try_parse_from(["rollcall", "summary", "--to", "2024-01-07"]).is_err());
        assert!(Cli::try_parse_from(["rollcall", "summary", "--date", "2024-01-01", "--from", "2024-01-01"]).is_err());
    }

    #[test]
    fn test_only_inference_commands_load_models() {
        let parse = |args: &[&str]| Cli::try_parse_from(args.iter().copied()).unwrap().command.needs_models();
        assert!(parse(&["rollcall", "mark", "x.jpg"]));
        assert!(parse(&["rollcall", "update", "--id", "C001", "x.jpg"]));
        assert!(!parse(&["rollcall", "update", "--id", "C001", "--phone", "1"]));
        assert!(!parse(&["rollcall", "alerts", "send"]));
        assert!(!parse(&["rollcall", "list"]));
    }
}
